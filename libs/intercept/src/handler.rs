//! Binds an agent-side connection to the user's local endpoint.

use anyhow::{Context as _, Result};
use std::net::SocketAddr;
use std::process::Stdio;
use telepresence_tunnel::TunnelStream;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Where diverted traffic is delivered on the workstation.
#[derive(Debug, Clone)]
pub enum LocalTarget {
    /// A listening address, typically `127.0.0.1:<port>`.
    Addr(SocketAddr),
    /// A user-provided command; the stream is bound to its stdio and the
    /// remote container's environment is passed to the process.
    Command {
        program: String,
        args: Vec<String>,
        environment: std::collections::BTreeMap<String, String>,
    },
}

/// Pumps one accepted stream to the local target until either side is done.
pub async fn handle_stream(stream: TunnelStream, target: &LocalTarget) -> Result<()> {
    match target {
        LocalTarget::Addr(addr) => {
            let tcp = tokio::net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("Failed to connect to local endpoint {addr}"))?;
            let (read_half, write_half) = tcp.into_split();

            pump(stream, read_half, write_half).await
        }
        LocalTarget::Command {
            program,
            args,
            environment,
        } => {
            let mut child = tokio::process::Command::new(program)
                .args(args)
                .envs(environment)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .spawn()
                .with_context(|| format!("Failed to spawn '{program}'"))?;

            let stdin = child.stdin.take().context("Child has no stdin")?;
            let stdout = child.stdout.take().context("Child has no stdout")?;

            let result = pump(stream, stdout, stdin).await;

            child.start_kill().ok();
            child.wait().await.ok();

            result
        }
    }
}

/// Pumps a stream against an arbitrary local byte pipe until both directions
/// are done. Also used for the SFTP port-forward that backs mounts.
pub async fn pump(
    mut stream: TunnelStream,
    mut from_local: impl AsyncRead + Unpin,
    mut to_local: impl AsyncWrite + Unpin,
) -> Result<()> {
    let mut buffer = vec![0u8; 16 * 1024];
    let mut local_done = false;
    let mut remote_done = false;

    while !(local_done && remote_done) {
        tokio::select! {
            chunk = stream.recv(), if !remote_done => match chunk {
                Some(chunk) => {
                    to_local
                        .write_all(&chunk)
                        .await
                        .context("Failed to write to local endpoint")?;
                }
                None => {
                    // Agent side is done sending; flush and stop writing.
                    to_local.shutdown().await.ok();
                    remote_done = true;
                }
            },
            read = from_local.read(&mut buffer), if !local_done => {
                let n = read.context("Failed to read from local endpoint")?;

                if n == 0 {
                    stream.close_send().await;
                    local_done = true;
                } else {
                    stream
                        .send(&buffer[..n])
                        .await
                        .context("Failed to send to agent")?;
                }
            }
        }
    }

    Ok(())
}
