//! UNIX domain socket plumbing for the local control sockets.

use anyhow::{Context as _, Result};
use hyper_util::rt::TokioIo;
use std::path::Path;
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Connects a tonic [`Channel`] to a UNIX domain socket.
pub async fn connect(path: impl AsRef<Path>) -> Result<Channel> {
    let path = path.as_ref().to_owned();
    let display_path = path.display().to_string();

    // The URI is required by the API but never used for UDS transports.
    let channel = Endpoint::try_from("http://localhost")
        .context("Failed to build endpoint")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();

            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .with_context(|| format!("Failed to connect to '{display_path}'"))?;

    Ok(channel)
}

/// Binds a UNIX domain socket for a tonic server, replacing any stale socket
/// file left behind by a crashed daemon.
pub fn incoming(path: impl AsRef<Path>) -> Result<UnixListenerStream> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }

    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket '{}'", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind '{}'", path.display()))?;

    Ok(UnixListenerStream::new(listener))
}
