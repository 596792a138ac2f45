//! The channel-backed device shared by the unix platforms.
//!
//! Two tasks own the file descriptor: the reader drains the kernel whenever
//! the fd turns readable and parses straight into pooled buffers, the writer
//! pulls batches off the outbound channel. A full inbound channel suspends
//! the reader, which backpressures into the kernel; packets are never
//! silently dropped on the receive path.

use crate::Tun;
use anyhow::Result;
use bufferpool::BufferPool;
use futures::SinkExt as _;
use ip_packet::{IpPacket, IpPacketBuf};
use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

#[cfg(target_os = "linux")]
use crate::linux as platform;
#[cfg(target_os = "macos")]
use crate::macos as platform;

/// Packets buffered in each direction between the stack and the fd tasks.
const PACKET_QUEUE: usize = 1_000;

/// Packets the writer pulls off its channel per wake-up.
const SEND_BATCH: usize = 32;

#[derive(Debug)]
pub struct TunDevice {
    outbound_tx: PollSender<IpPacket>,
    inbound_rx: mpsc::Receiver<IpPacket>,
    name: String,
}

impl TunDevice {
    /// Opens the platform's TUN device and starts its I/O tasks.
    ///
    /// Panics if called without a Tokio runtime.
    pub fn new(pool: BufferPool) -> Result<Self> {
        let (fd, name) = platform::open()?;
        let fd = Arc::new(AsyncFd::new(fd)?);

        let (inbound_tx, inbound_rx) = mpsc::channel(PACKET_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(PACKET_QUEUE);

        tokio::spawn(recv_task(fd.clone(), pool, inbound_tx));
        tokio::spawn(send_task(fd, outbound_rx));

        Ok(Self {
            outbound_tx: PollSender::new(outbound_tx),
            inbound_rx,
            name,
        })
    }
}

impl Tun for TunDevice {
    fn poll_send_ready(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.outbound_tx
            .poll_ready_unpin(cx)
            .map_err(io::Error::other)
    }

    fn send(&mut self, packet: IpPacket) -> io::Result<()> {
        self.outbound_tx
            .start_send_unpin(packet)
            .map_err(io::Error::other)?;

        Ok(())
    }

    fn poll_recv_many(
        &mut self,
        cx: &mut Context,
        buf: &mut Vec<IpPacket>,
        max: usize,
    ) -> Poll<usize> {
        self.inbound_rx.poll_recv_many(cx, buf, max)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn recv_task(
    fd: Arc<AsyncFd<OwnedFd>>,
    pool: BufferPool,
    inbound_tx: mpsc::Sender<IpPacket>,
) {
    loop {
        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("TUN device failed: {e}");

                return;
            }
        };

        // Drain the kernel until it has nothing left for us.
        loop {
            let mut packet_buf = IpPacketBuf::new(&pool);

            let len = match platform::read(fd.get_ref(), &mut packet_buf) {
                Ok(0) => {
                    tracing::error!("TUN file descriptor is closed");

                    return;
                }
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                    break;
                }
                Err(e) => {
                    tracing::warn!("Failed to read from TUN device: {e}");
                    guard.clear_ready();
                    break;
                }
            };

            match IpPacket::new(packet_buf, len) {
                Ok(packet) => {
                    if inbound_tx.send(packet).await.is_err() {
                        tracing::debug!("Inbound packet receiver gone, shutting down task");

                        return;
                    }
                }
                Err(e) => tracing::debug!("Discarding unparseable packet: {e:#}"),
            }
        }
    }
}

async fn send_task(fd: Arc<AsyncFd<OwnedFd>>, mut outbound_rx: mpsc::Receiver<IpPacket>) {
    let mut batch = Vec::with_capacity(SEND_BATCH);

    while outbound_rx.recv_many(&mut batch, SEND_BATCH).await > 0 {
        'batch: for packet in batch.drain(..) {
            loop {
                let mut guard = match fd.writable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        tracing::error!("TUN device failed: {e}");

                        return;
                    }
                };

                match platform::write(fd.get_ref(), &packet) {
                    Ok(_) => continue 'batch,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        guard.clear_ready();
                    }
                    Err(e) => {
                        // Outbound drops are the kernel's loss to take, same
                        // as on a physical interface.
                        tracing::debug!("Failed to write to TUN device: {e}");

                        continue 'batch;
                    }
                }
            }
        }
    }
}
