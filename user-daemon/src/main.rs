//! The unprivileged user daemon.
//!
//! Owns the cluster credentials and the gRPC connection to the traffic
//! manager, drives intercepts, and forwards tunnel streams between the root
//! daemon and the manager. The CLI talks to it over the local control socket.

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use telepresence_model::timeouts;
use telepresence_rpc::daemon::connector_server::ConnectorServer;
use telepresence_user_daemon::service::ConnectorService;
use tokio_util::sync::CancellationToken;

fn socket_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TELEPRESENCE_CONNECTOR_SOCKET") {
        return PathBuf::from(path);
    }

    known_dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("connector.sock")
}

#[tokio::main]
async fn main() -> Result<()> {
    let directives = std::env::var("TELEPRESENCE_LOG").unwrap_or_else(|_| "info".to_owned());
    let (_filter_reload, _log_guard) = telepresence_logging::setup(
        &directives,
        known_dirs::log_dir().as_deref(),
        "user-daemon",
    )?;

    if known_dirs::telemetry_disabled() {
        tracing::debug!("Telemetry is disabled via SCOUT_DISABLE");
    }

    let socket = socket_path();
    let incoming = telepresence_rpc::uds::incoming(&socket)?;

    tracing::info!(socket = %socket.display(), "User daemon listening");

    let shutdown = CancellationToken::new();
    let service = ConnectorService::new(shutdown.clone(), socket.clone());

    tonic::transport::Server::builder()
        .add_service(ConnectorServer::new(service))
        .serve_with_incoming_shutdown(incoming, await_shutdown(shutdown))
        .await
        .context("Control socket server failed")?;

    tokio::time::sleep(timeouts::DISCONNECT_DRAIN).await;
    std::fs::remove_file(&socket).ok();

    Ok(())
}

async fn await_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down");
        }
        () = shutdown.cancelled() => {}
    }
}
