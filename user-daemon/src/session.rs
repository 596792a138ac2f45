//! The manager session: arrival, keep-alive and silent re-establishment.

use crate::error::retry_transient;
use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use telepresence_model::{Session, timeouts};
use telepresence_rpc::manager::manager_client::ManagerClient;
use telepresence_rpc::manager::{ClientInfo, RemainRequest, SessionInfo};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

/// Consecutive keep-alive misses before the session is considered degraded.
const MAX_MISSES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Healthy,
    /// The manager is unreachable. Routes stay installed; streams re-dial
    /// once the manager returns.
    Degraded,
}

/// Establishes a session, retrying transient failures.
pub async fn arrive(
    client: &mut ManagerClient<Channel>,
    info: ClientInfo,
) -> Result<Session> {
    let session_info = retry_transient("ArriveAsClient", || {
        let mut client = client.clone();
        let info = info.clone();

        async move { client.arrive_as_client(info).await }
    })
    .await
    .context("Failed to establish a session with the traffic manager")?
    .into_inner();

    let session = Session::try_from(session_info).context("Manager returned a bad session")?;

    tracing::info!(session = %session.id, "Arrived as client");

    Ok(session)
}

/// Sends the keep-alives that keep a [`Session`] alive, and re-arrives when
/// the manager forgot us.
pub struct SessionWorker {
    pub client: ManagerClient<Channel>,
    pub client_info: ClientInfo,
    pub session: Arc<Mutex<Session>>,
    pub health_tx: watch::Sender<SessionHealth>,
    /// Notified with the new session whenever we had to re-arrive.
    pub renewed_tx: tokio::sync::mpsc::Sender<Session>,
}

impl SessionWorker {
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(timeouts::KEEP_ALIVE);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // The first tick fires immediately.

        let mut misses = 0u32;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let request = RemainRequest {
                session: Some(SessionInfo::from(&*self.session.lock())),
                api_key: self.client_info.api_key.clone(),
            };

            match self.client.remain(request).await {
                Ok(response) => {
                    match Session::try_from(response.into_inner()) {
                        Ok(refreshed) => *self.session.lock() = refreshed,
                        Err(e) => tracing::warn!("Manager returned a bad session: {e}"),
                    }

                    if misses > 0 {
                        tracing::info!("Manager is reachable again");
                    }
                    misses = 0;
                    self.health_tx.send_replace(SessionHealth::Healthy);
                }
                Err(status) if status.code() == tonic::Code::NotFound => {
                    // The manager restarted and no longer knows us. Re-arrive
                    // silently; the caller never sees a disconnect.
                    tracing::info!("Session unknown to the manager, re-arriving");

                    if let Err(e) = self.rearrive().await {
                        tracing::warn!("Failed to re-establish session: {e:#}");
                        misses += 1;
                        self.update_health(misses);
                    } else {
                        misses = 0;
                        self.health_tx.send_replace(SessionHealth::Healthy);
                    }
                }
                Err(status) => {
                    misses += 1;
                    tracing::debug!(%misses, "Keep-alive failed: {status}");
                    self.update_health(misses);
                }
            }
        }
    }

    fn update_health(&self, misses: u32) {
        if misses >= MAX_MISSES {
            // Transient failure: keep routes installed and keep probing.
            self.health_tx.send_replace(SessionHealth::Degraded);
        }
    }

    async fn rearrive(&mut self) -> Result<()> {
        let mut backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(100),
            max_interval: std::time::Duration::from_secs(30),
            max_elapsed_time: Some(timeouts::KEEP_ALIVE),
            ..Default::default()
        };

        let session = loop {
            match self
                .client
                .arrive_as_client(self.client_info.clone())
                .await
            {
                Ok(response) => break Session::try_from(response.into_inner())?,
                Err(status) => {
                    use backoff::backoff::Backoff as _;

                    let Some(delay) = backoff.next_backoff() else {
                        anyhow::bail!("manager still unreachable: {status}");
                    };
                    tokio::time::sleep(delay).await;
                }
            }
        };

        tracing::info!(session = %session.id, "Re-arrived as client");

        *self.session.lock() = session.clone();
        self.renewed_tx.send(session).await.ok();

        Ok(())
    }
}

/// Departs cleanly, invalidating the session on the manager.
pub async fn depart(client: &mut ManagerClient<Channel>, session: &Session) {
    if let Err(status) = client.depart(SessionInfo::from(session)).await {
        tracing::warn!("Depart failed: {status}");
    }
}
