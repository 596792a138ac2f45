#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::{Context as _, Result};
use std::path::Path;
use tracing::subscriber::DefaultGuard;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _, Registry, fmt, reload};

pub type FilterReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Parses a filter string such as `info,telepresence_tunnel=debug`.
pub fn try_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .with_context(|| format!("Failed to parse directives '{directives}'"))
}

/// Registers the global subscriber: stdout plus an optional daily log file.
///
/// The returned handle reloads the filter at runtime; the guard must be kept
/// alive for the file writer to flush.
pub fn setup(
    directives: &str,
    log_dir: Option<&Path>,
    file_prefix: &str,
) -> Result<(FilterReloadHandle, Option<WorkerGuard>)> {
    let (filter, reload_handle) = reload::Layer::new(try_filter(directives)?);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, format!("{file_prefix}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);

            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    Registry::default()
        .with(fmt::layer().with_filter(filter))
        .with(file_layer)
        .try_init()
        .context("Failed to set global subscriber")?;

    Ok((reload_handle, guard))
}

/// A scoped subscriber for tests.
pub fn test(directives: &str) -> DefaultGuard {
    let subscriber = Registry::default().with(
        fmt::layer()
            .with_test_writer()
            .with_filter(EnvFilter::new(directives)),
    );

    tracing::subscriber::set_default(subscriber)
}
