use crate::frame::{self, ErrorReason, Frame, FrameKind, MAX_PAYLOAD};
use anyhow::{Context as _, Result};
use futures::future::BoxFuture;
use futures::{Sink, SinkExt as _, Stream, StreamExt as _};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use telepresence_model::{ConnectionId, SessionId, timeouts};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// In-flight bytes per stream before senders block.
pub const WINDOW: usize = 256 * 1024;

/// Frames queued between the stream handle and the transport writer.
const OUTBOUND_QUEUE: usize = 16;
/// Data chunks buffered towards the local consumer. Reading from the
/// transport stops while this is full, which is the receiver's implicit
/// credit: draining resumes the peer.
const INBOUND_QUEUE: usize = 16;

/// One endpoint's view of the raw frame pipe under a stream.
pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = anyhow::Error> + Send>>;
pub type FrameSource = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Opens raw frame pipes; one per stream, selected once at dial time.
pub trait Transport: Send + Sync {
    fn open(&self) -> BoxFuture<'static, Result<(FrameSink, FrameSource)>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("destination is never proxied")]
    Unroutable,
    #[error("timed out dialling the cluster")]
    DialTimeout,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("stream aborted: {0}")]
    Aborted(ErrorReason),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

struct Shared {
    state: Mutex<StreamState>,
    error: Mutex<Option<ErrorReason>>,
    window: Semaphore,
    last_send: Mutex<Instant>,
    last_recv: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Shared {
    fn new(cancel: CancellationToken) -> Self {
        let now = Instant::now();

        Self {
            state: Mutex::new(StreamState::Open),
            error: Mutex::new(None),
            window: Semaphore::new(WINDOW),
            last_send: Mutex::new(now),
            last_recv: Mutex::new(now),
            cancel,
        }
    }

    fn fail(&self, reason: ErrorReason) {
        self.error.lock().get_or_insert(reason);
        *self.state.lock() = StreamState::Closed;
        self.cancel.cancel();
    }

    fn local_closed(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            StreamState::Opening | StreamState::Open | StreamState::HalfClosedLocal => {
                StreamState::HalfClosedLocal
            }
        };
    }

    fn remote_closed(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            StreamState::Opening | StreamState::Open | StreamState::HalfClosedRemote => {
                StreamState::HalfClosedRemote
            }
        };
    }
}

/// One bidirectional, ordered, back-pressured byte stream bound to a
/// [`ConnectionId`] for its lifetime.
pub struct TunnelStream {
    id: ConnectionId,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    data_rx: mpsc::Receiver<Vec<u8>>,
}

impl TunnelStream {
    /// Wires a stream over an established, handshaken frame pipe.
    pub(crate) fn spawn(
        id: ConnectionId,
        sink: FrameSink,
        source: FrameSource,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared::new(cancel));
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (data_tx, data_rx) = mpsc::channel(INBOUND_QUEUE);

        tokio::spawn(write_loop(sink, outbound_rx, shared.clone()));
        tokio::spawn(read_loop(source, data_tx, shared.clone()));
        tokio::spawn(keepalive_loop(outbound.clone(), shared.clone()));

        Self {
            id,
            shared,
            outbound,
            data_rx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    /// The reason the stream was torn down, if it failed.
    pub fn error(&self) -> Option<ErrorReason> {
        *self.shared.error.lock()
    }

    /// Sends `bytes`, blocking while the in-flight window is exhausted.
    ///
    /// The bytes are framed by the sender; no frame exceeds [`MAX_PAYLOAD`].
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TunnelError> {
        for chunk in bytes.chunks(MAX_PAYLOAD) {
            if let Some(reason) = self.error() {
                return Err(TunnelError::Aborted(reason));
            }

            let permits = self
                .shared
                .window
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| TunnelError::Aborted(ErrorReason::Internal))?;
            // The writer releases the window once the frame reaches the transport.
            permits.forget();

            self.outbound
                .send(Frame::new(FrameKind::StreamData, 0, chunk.to_vec()))
                .await
                .map_err(|_| {
                    TunnelError::Aborted(self.error().unwrap_or(ErrorReason::Internal))
                })?;
        }

        Ok(())
    }

    /// Receives the next chunk; `None` once the peer closed its sending side.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let chunk = self.data_rx.recv().await?;
        *self.shared.last_recv.lock() = Instant::now();

        Some(chunk)
    }

    /// Signals end-of-stream in our direction; `recv` keeps draining.
    pub async fn close_send(&self) {
        if self
            .outbound
            .send(Frame::new(FrameKind::CloseSend, 0, Vec::new()))
            .await
            .is_ok()
        {
            self.shared.local_closed();
        }
    }

    /// Immediate both-directions close.
    pub fn abort(&self, reason: ErrorReason) {
        let _ = self.outbound.try_send(Frame::new(
            FrameKind::Error,
            0,
            frame::error_payload(reason, &reason.to_string()),
        ));

        self.shared.fail(reason);
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Dials a stream: opens the transport, announces the connection and waits
/// for the peer's `STREAM_OK`.
pub async fn dial(
    transport: &dyn Transport,
    session: &SessionId,
    id: ConnectionId,
    cancel: CancellationToken,
) -> Result<TunnelStream, TunnelError> {
    let handshake = async {
        let (mut sink, mut source) = transport.open().await?;

        sink.send(Frame::new(FrameKind::Connect, 0, frame::connect_payload(session, &id)).encode())
            .await
            .context("Failed to send CONNECT")?;

        tokio::time::timeout(timeouts::HANDSHAKE, wait_for_stream_ok(&mut source))
            .await
            .map_err(|_| TunnelError::Handshake("timed out waiting for STREAM_OK".to_owned()))??;

        Ok::<_, TunnelError>(TunnelStream::spawn(id, sink, source, cancel))
    };

    let stream = tokio::time::timeout(timeouts::DIAL, handshake)
        .await
        .map_err(|_| TunnelError::DialTimeout)??;

    tracing::debug!(%id, "Tunnel stream established");

    Ok(stream)
}

/// Accepts a stream on a fresh frame pipe: waits for `CONNECT`, validates the
/// session and acknowledges with `STREAM_OK`.
///
/// There is no deadline on the wait for `CONNECT`; the dialling side owns the
/// handshake timeout, and reverse pipes sit idle until a peer connects.
pub async fn accept(
    mut sink: FrameSink,
    mut source: FrameSource,
    expected_session: &SessionId,
    cancel: CancellationToken,
) -> Result<(ConnectionId, TunnelStream), TunnelError> {
    let connect = source
        .next()
        .await
        .ok_or_else(|| TunnelError::Handshake("peer closed before CONNECT".to_owned()))?
        .context("Failed to read CONNECT")?;

    let (frame, _) = Frame::decode(&connect).context("Failed to decode CONNECT")?;
    if frame.kind != FrameKind::Connect {
        return Err(TunnelError::Handshake(format!(
            "expected CONNECT, got {:?}",
            frame.kind
        )));
    }

    let (session, id) =
        frame::parse_connect(&frame.payload).context("Failed to parse CONNECT payload")?;

    if &session != expected_session {
        let error = Frame::new(
            FrameKind::Error,
            0,
            frame::error_payload(ErrorReason::SessionExpired, "unknown session"),
        );
        let _ = sink.send(error.encode()).await;

        return Err(TunnelError::Aborted(ErrorReason::SessionExpired));
    }

    sink.send(Frame::new(FrameKind::StreamOk, 0, Vec::new()).encode())
        .await
        .context("Failed to send STREAM_OK")?;

    Ok((id, TunnelStream::spawn(id, sink, source, cancel)))
}

async fn wait_for_stream_ok(source: &mut FrameSource) -> Result<(), TunnelError> {
    loop {
        let bytes = source
            .next()
            .await
            .ok_or_else(|| TunnelError::Handshake("peer closed before STREAM_OK".to_owned()))?
            .context("Failed to read STREAM_OK")?;

        let (frame, _) = Frame::decode(&bytes).context("Failed to decode frame")?;

        match frame.kind {
            FrameKind::StreamOk => return Ok(()),
            FrameKind::Error => {
                let (reason, message) = frame::parse_error(&frame.payload);
                tracing::debug!(%reason, %message, "Peer rejected stream");

                return Err(TunnelError::Aborted(reason));
            }
            FrameKind::KeepAlive | FrameKind::Unknown(_) => continue,
            FrameKind::Connect | FrameKind::StreamData | FrameKind::CloseSend => {
                return Err(TunnelError::Handshake(format!(
                    "unexpected {:?} during handshake",
                    frame.kind
                )));
            }
        }
    }
}

async fn write_loop(mut sink: FrameSink, mut rx: mpsc::Receiver<Frame>, shared: Arc<Shared>) {
    loop {
        let frame = tokio::select! {
            () = shared.cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };

        let Some(frame) = frame else {
            let _ = sink.close().await;
            break;
        };

        let window_credit =
            matches!(frame.kind, FrameKind::StreamData).then_some(frame.payload.len());

        *shared.last_send.lock() = Instant::now();

        if let Err(e) = sink.send(frame.encode()).await {
            tracing::debug!("Failed to write frame: {e:#}");
            shared.fail(ErrorReason::Internal);
            break;
        }

        if let Some(credit) = window_credit {
            shared.window.add_permits(credit);
        }
    }
}

async fn read_loop(mut source: FrameSource, data_tx: mpsc::Sender<Vec<u8>>, shared: Arc<Shared>) {
    let mut data_tx = Some(data_tx);

    loop {
        let next = tokio::select! {
            () = shared.cancel.cancelled() => break,
            next = source.next() => next,
        };

        let bytes = match next {
            None => {
                shared.remote_closed();
                break;
            }
            Some(Err(e)) => {
                tracing::debug!("Transport failed: {e:#}");
                shared.fail(ErrorReason::Internal);
                break;
            }
            Some(Ok(bytes)) => bytes,
        };

        *shared.last_recv.lock() = Instant::now();

        // A transport message may carry several frames; the header is self-framing.
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let (frame, consumed) = match Frame::decode(rest) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::debug!("Failed to decode frame: {e:#}");
                    shared.fail(ErrorReason::Internal);

                    return;
                }
            };
            rest = &rest[consumed..];

            match frame.kind {
                FrameKind::StreamData => {
                    let Some(tx) = &data_tx else { continue };

                    // Blocking here while the consumer is slow is the
                    // stream's inbound backpressure.
                    let send = tokio::select! {
                        () = shared.cancel.cancelled() => return,
                        send = tx.send(frame.payload) => send,
                    };

                    if send.is_err() {
                        // Local consumer is gone; nothing left to deliver to.
                        return;
                    }
                }
                FrameKind::CloseSend => {
                    data_tx = None;
                    shared.remote_closed();
                }
                FrameKind::Error => {
                    let (reason, message) = frame::parse_error(&frame.payload);
                    tracing::debug!(%reason, %message, "Stream aborted by peer");
                    shared.fail(reason);

                    return;
                }
                FrameKind::KeepAlive
                | FrameKind::StreamOk
                | FrameKind::Connect
                | FrameKind::Unknown(_) => {}
            }
        }
    }
}

async fn keepalive_loop(outbound: mpsc::Sender<Frame>, shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(timeouts::KEEP_ALIVE);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // The first tick fires immediately.

    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let idle_recv = shared.last_recv.lock().elapsed();
        if idle_recv >= timeouts::stream_watchdog() {
            tracing::debug!(?idle_recv, "Stream watchdog fired, aborting");

            let _ = outbound.try_send(Frame::new(
                FrameKind::Error,
                0,
                frame::error_payload(ErrorReason::Internal, "keep-alive timeout"),
            ));
            shared.fail(ErrorReason::Internal);
            break;
        }

        if shared.last_send.lock().elapsed() >= timeouts::KEEP_ALIVE {
            let _ = outbound.try_send(Frame::new(FrameKind::KeepAlive, 0, Vec::new()));
        }
    }
}
