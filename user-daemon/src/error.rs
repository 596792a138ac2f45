//! The daemon's error taxonomy and retry policy.
//!
//! - User: caller-side misuse, surfaced verbatim, never retried.
//! - Config: kubeconfig or cluster inconsistency, surfaced with a hint.
//! - Transient: retried with exponential backoff at the layer that failed.
//! - Fatal: tears the current session down; the daemon keeps running.

use backoff::ExponentialBackoff;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use telepresence_rpc::daemon::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    User,
    Config,
    Transient,
    Fatal,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DaemonError {
    pub category: Category,
    pub message: String,
}

impl DaemonError {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            category: Category::User,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self {
            category: Category::Config,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            category: Category::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            category: Category::Fatal,
            message: message.into(),
        }
    }

    pub fn wire_category(&self) -> ErrorCategory {
        match self.category {
            Category::User => ErrorCategory::User,
            Category::Config => ErrorCategory::Config,
            Category::Transient | Category::Fatal => ErrorCategory::Unknown,
        }
    }
}

impl From<DaemonError> for tonic::Status {
    fn from(error: DaemonError) -> Self {
        match error.category {
            Category::User => tonic::Status::invalid_argument(error.message),
            Category::Config => tonic::Status::failed_precondition(error.message),
            Category::Transient => tonic::Status::unavailable(error.message),
            Category::Fatal => tonic::Status::internal(error.message),
        }
    }
}

const MAX_ATTEMPTS: u32 = 10;

/// 100 ms doubling up to a 30 s cap; attempts are bounded by the caller-side
/// counter in [`retry_transient`], not by elapsed time.
fn transient_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Retries a transient operation: 100 ms initial backoff, capped at 30 s, at
/// most ten attempts.
pub async fn retry_transient<T, E, Fut>(
    what: &str,
    mut operation: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = AtomicU32::new(0);

    backoff::future::retry(transient_policy(), || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let fut = operation();

        async move {
            fut.await.map_err(|e| {
                if attempt >= MAX_ATTEMPTS {
                    tracing::warn!("{what} failed after {MAX_ATTEMPTS} attempts: {e}");

                    backoff::Error::permanent(e)
                } else {
                    tracing::debug!(%attempt, "{what} failed, retrying: {e}");

                    backoff::Error::transient(e)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);

        let result: Result<u32, &str> = retry_transient("test", || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;

            async move {
                if attempt < 4 { Err("not yet") } else { Ok(attempt) }
            }
        })
        .await;

        assert_eq!(result, Ok(4));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_ten_attempts() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), &str> = retry_transient("test", || {
            attempts.fetch_add(1, Ordering::SeqCst);

            async { Err("still broken") }
        })
        .await;

        assert_eq!(result, Err("still broken"));
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
    }
}
