//! The privileged root daemon.
//!
//! Owns the TUN device, the user-space network stack and the host routing
//! table. The unprivileged user daemon hands it a session descriptor and
//! subnet snapshots over the local control socket; tunnel streams are dialled
//! back through the user daemon, which holds the cluster credentials.

mod factory;
mod service;

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use telepresence_model::timeouts;
use telepresence_rpc::daemon::root_server::RootServer;
use tokio_util::sync::CancellationToken;

fn socket_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TELEPRESENCE_ROOT_SOCKET") {
        return PathBuf::from(path);
    }

    known_dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("rootd.sock")
}

#[tokio::main]
async fn main() -> Result<()> {
    let directives = std::env::var("TELEPRESENCE_LOG").unwrap_or_else(|_| "info".to_owned());
    let (_filter_reload, _log_guard) = telepresence_logging::setup(
        &directives,
        known_dirs::log_dir().as_deref(),
        "root-daemon",
    )?;

    let socket = socket_path();
    let incoming = telepresence_rpc::uds::incoming(&socket)?;

    tracing::info!(socket = %socket.display(), "Root daemon listening");

    let shutdown = CancellationToken::new();
    let service = service::RootService::new();

    tonic::transport::Server::builder()
        .add_service(RootServer::new(service))
        .serve_with_incoming_shutdown(incoming, await_shutdown(shutdown.clone()))
        .await
        .context("Control socket server failed")?;

    // Give in-flight streams a moment to drain before the process exits.
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
