//! [`Transport`] implementations: gRPC to the manager, gRPC relay through the
//! user daemon, and the TCP path used behind a Kubernetes port-forward.

use crate::stream::{FrameSink, FrameSource, Transport};
use anyhow::{Context as _, Result};
use futures::future::BoxFuture;
use futures::{FutureExt as _, SinkExt as _, TryStreamExt as _};
use std::net::SocketAddr;
use std::sync::Arc;
use telepresence_rpc::daemon::connector_client::ConnectorClient;
use telepresence_rpc::manager::manager_client::ManagerClient;
use telepresence_rpc::manager::TunnelMessage;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;
use tonic::transport::Channel;

/// Frames queued towards the gRPC transport per stream.
const TRANSPORT_QUEUE: usize = 16;

fn grpc_pipe(
    outbound_tx: mpsc::Sender<TunnelMessage>,
    inbound: tonic::Streaming<TunnelMessage>,
) -> (FrameSink, FrameSource) {
    let sink = PollSender::new(outbound_tx)
        .sink_map_err(|_| anyhow::anyhow!("Tunnel RPC is closed"))
        .with(|frame: Vec<u8>| futures::future::ready(anyhow::Ok(TunnelMessage { frame })));

    let source = inbound
        .map_ok(|message| message.frame)
        .map_err(|status| anyhow::anyhow!("Tunnel RPC failed: {status}"));

    (Box::pin(sink), Box::pin(source))
}

/// Streams carried directly on the traffic manager's `Tunnel` RPC.
pub struct ManagerTransport {
    pub client: ManagerClient<Channel>,
}

impl Transport for ManagerTransport {
    fn open(&self) -> BoxFuture<'static, Result<(FrameSink, FrameSource)>> {
        let mut client = self.client.clone();

        async move {
            let (outbound_tx, outbound_rx) = mpsc::channel(TRANSPORT_QUEUE);

            let response = client
                .tunnel(ReceiverStream::new(outbound_rx))
                .await
                .context("Tunnel RPC rejected")?;

            Ok(grpc_pipe(outbound_tx, response.into_inner()))
        }
        .boxed()
    }
}

/// Streams relayed through the user daemon's control socket.
pub struct ConnectorTransport {
    pub client: ConnectorClient<Channel>,
}

impl Transport for ConnectorTransport {
    fn open(&self) -> BoxFuture<'static, Result<(FrameSink, FrameSource)>> {
        let mut client = self.client.clone();

        async move {
            let (outbound_tx, outbound_rx) = mpsc::channel(TRANSPORT_QUEUE);

            let response = client
                .tunnel(ReceiverStream::new(outbound_rx))
                .await
                .context("Tunnel relay RPC rejected")?;

            Ok(grpc_pipe(outbound_tx, response.into_inner()))
        }
        .boxed()
    }
}

/// A raw TCP pipe, used when streams go through a Kubernetes port-forward to
/// the agent pod instead of the manager.
///
/// Frames are written as-is; the eight byte header keeps the byte stream
/// self-framing.
pub struct TcpTransport {
    pub addr: SocketAddr,
}

impl Transport for TcpTransport {
    fn open(&self) -> BoxFuture<'static, Result<(FrameSink, FrameSource)>> {
        let addr = self.addr;

        async move {
            let stream = tokio::net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("Failed to connect to port-forward at {addr}"))?;
            let (read_half, write_half) = stream.into_split();

            let sink = futures::sink::unfold(write_half, |mut write_half, frame: Vec<u8>| {
                async move {
                    write_half
                        .write_all(&frame)
                        .await
                        .context("Failed to write frame")?;

                    anyhow::Ok(write_half)
                }
            });

            let source = futures::stream::unfold(read_half, |mut read_half| async move {
                let mut header = [0u8; crate::frame::HEADER_LEN];
                if read_half.read_exact(&mut header).await.is_err() {
                    return None;
                }

                let payload_len = u16::from_be_bytes([header[2], header[3]]) as usize;
                let mut frame = vec![0u8; header.len() + payload_len];
                frame[..header.len()].copy_from_slice(&header);

                match read_half.read_exact(&mut frame[header.len()..]).await {
                    Ok(_) => Some((Ok(frame), read_half)),
                    Err(e) => Some((Err(anyhow::Error::new(e)), read_half)),
                }
            });

            Ok((
                Box::pin(sink) as FrameSink,
                Box::pin(source) as FrameSource,
            ))
        }
        .boxed()
    }
}

/// Tries the primary transport and falls back once, at dial time.
///
/// The choice is never revisited for the lifetime of the stream.
pub struct FallbackTransport {
    pub primary: Arc<dyn Transport>,
    pub fallback: Arc<dyn Transport>,
}

impl Transport for FallbackTransport {
    fn open(&self) -> BoxFuture<'static, Result<(FrameSink, FrameSource)>> {
        let primary = self.primary.clone();
        let fallback = self.fallback.clone();

        async move {
            match primary.open().await {
                Ok(pipe) => Ok(pipe),
                Err(e) => {
                    tracing::debug!("Primary transport failed, trying fallback: {e:#}");

                    fallback.open().await
                }
            }
        }
        .boxed()
    }
}
