#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The tunnel multiplexer: bidirectional, ordered, back-pressured byte
//! streams between a workstation endpoint and a cluster endpoint, identified
//! by a [`telepresence_model::ConnectionId`] and scoped to a session.

mod frame;
mod stream;
mod transport;

pub use frame::{ErrorReason, Frame, FrameKind, HEADER_LEN, MAX_PAYLOAD, parse_connect};
pub use stream::{
    FrameSink, FrameSource, StreamState, Transport, TunnelError, TunnelStream, WINDOW, accept,
    dial,
};
pub use transport::{ConnectorTransport, FallbackTransport, ManagerTransport, TcpTransport};

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
    use parking_lot::Mutex;
    use std::time::Duration;
    use telepresence_model::{ConnectionId, Protocol, SessionId};
    use tokio::sync::mpsc;
    use tokio_util::sync::{CancellationToken, PollSender};

    fn endpoints(
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
    ) -> (FrameSink, FrameSource) {
        let sink = PollSender::new(tx)
            .sink_map_err(|_| anyhow::anyhow!("pipe closed"))
            .with(|frame: Vec<u8>| futures::future::ready(anyhow::Ok(frame)));
        let source = tokio_stream::wrappers::ReceiverStream::new(rx).map(anyhow::Ok);

        (Box::pin(sink), Box::pin(source))
    }

    /// Two connected in-memory frame pipes.
    fn memory_pipe() -> ((FrameSink, FrameSource), (FrameSink, FrameSource)) {
        let (a_tx, b_rx) = mpsc::channel(16);
        let (b_tx, a_rx) = mpsc::channel(16);

        (endpoints(a_tx, a_rx), endpoints(b_tx, b_rx))
    }

    /// A [`Transport`] handing out one pre-connected pipe.
    struct MemoryTransport {
        pipe: Mutex<Option<(FrameSink, FrameSource)>>,
    }

    impl MemoryTransport {
        fn new(pipe: (FrameSink, FrameSource)) -> Self {
            Self {
                pipe: Mutex::new(Some(pipe)),
            }
        }
    }

    impl Transport for MemoryTransport {
        fn open(&self) -> BoxFuture<'static, anyhow::Result<(FrameSink, FrameSource)>> {
            let pipe = self.pipe.lock().take();

            async move { pipe.ok_or_else(|| anyhow::anyhow!("transport exhausted")) }.boxed()
        }
    }

    fn connection_id() -> ConnectionId {
        ConnectionId::new(
            Protocol::Tcp,
            "10.11.0.1:51000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
    }

    async fn dial_and_accept() -> (TunnelStream, TunnelStream) {
        let (client_pipe, (server_sink, server_source)) = memory_pipe();
        let session = SessionId::new("sess-1");
        let transport = MemoryTransport::new(client_pipe);

        let server = tokio::spawn({
            let session = session.clone();

            async move {
                accept(
                    server_sink,
                    server_source,
                    &session,
                    CancellationToken::new(),
                )
                .await
            }
        });

        let client = dial(&transport, &session, connection_id(), CancellationToken::new())
            .await
            .unwrap();
        let (accepted_id, server) = server.await.unwrap().unwrap();

        assert_eq!(accepted_id, connection_id());

        (client, server)
    }

    #[tokio::test]
    async fn one_megabyte_arrives_in_order_then_eof() {
        let (client, mut server) = dial_and_accept().await;

        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

        let sender = tokio::spawn({
            let payload = payload.clone();

            async move {
                client.send(&payload).await.unwrap();
                client.close_send().await;

                client
            }
        });

        let mut received = Vec::with_capacity(payload.len());
        while let Some(chunk) = server.recv().await {
            received.extend_from_slice(&chunk);
        }

        assert_eq!(received, payload);

        // The cluster side can keep sending after our close_send.
        let client = sender.await.unwrap();
        server.send(b"still talking").await.unwrap();

        let mut client = client;
        assert_eq!(client.recv().await.unwrap(), b"still talking");
    }

    #[tokio::test]
    async fn session_mismatch_is_rejected() {
        let (client_pipe, (server_sink, server_source)) = memory_pipe();
        let transport = MemoryTransport::new(client_pipe);

        let server = tokio::spawn(async move {
            accept(
                server_sink,
                server_source,
                &SessionId::new("other-session"),
                CancellationToken::new(),
            )
            .await
        });

        let client = dial(
            &transport,
            &SessionId::new("sess-1"),
            connection_id(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            client,
            Err(TunnelError::Aborted(ErrorReason::SessionExpired))
        ));
        assert!(matches!(
            server.await.unwrap(),
            Err(TunnelError::Aborted(ErrorReason::SessionExpired))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_aborted_by_the_watchdog() {
        let (client_pipe, (mut server_sink, mut server_source)) = memory_pipe();
        let transport = MemoryTransport::new(client_pipe);
        let session = SessionId::new("sess-1");

        // Handshake by hand so the peer never sends anything afterwards.
        let (client, ()) = tokio::join!(
            dial(
                &transport,
                &session,
                connection_id(),
                CancellationToken::new()
            ),
            async {
                let connect = server_source.next().await.unwrap().unwrap();
                let (frame, _) = Frame::decode(&connect).unwrap();
                assert_eq!(frame.kind, FrameKind::Connect);

                server_sink
                    .send(Frame::new(FrameKind::StreamOk, 0, Vec::new()).encode())
                    .await
                    .unwrap();
            }
        );
        let client = client.unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(client.state(), StreamState::Closed);
        assert_eq!(client.error(), Some(ErrorReason::Internal));

        drop((server_sink, server_source));
    }

    #[tokio::test]
    async fn abort_surfaces_reason_to_the_peer() {
        let (client, mut server) = dial_and_accept().await;

        client.abort(ErrorReason::Backpressure);

        assert!(server.recv().await.is_none());
        assert_eq!(server.error(), Some(ErrorReason::Backpressure));
    }

    #[tokio::test]
    async fn sends_block_once_the_window_is_exhausted() {
        let (client, mut server) = dial_and_accept().await;

        let chunk = vec![0u8; MAX_PAYLOAD];
        let mut sent = 0;

        // Without a reader on the other side, at most WINDOW bytes plus the
        // queued frames fit before `send` blocks.
        loop {
            match tokio::time::timeout(Duration::from_millis(100), client.send(&chunk)).await {
                Ok(Ok(())) => {
                    sent += chunk.len();
                    assert!(
                        sent <= WINDOW + 64 * MAX_PAYLOAD,
                        "send never blocked after {sent} bytes"
                    );
                }
                Ok(Err(e)) => panic!("send failed: {e}"),
                Err(_) => break, // Blocked: the window is exhausted.
            }
        }

        // Draining the peer frees the window.
        let drain = tokio::spawn(async move { while server.recv().await.is_some() {} });

        tokio::time::timeout(Duration::from_secs(5), client.send(&chunk))
            .await
            .expect("send should unblock once the peer drains")
            .unwrap();

        drop(client);
        drain.abort();
    }
}
