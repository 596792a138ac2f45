#![allow(clippy::unwrap_used)]

use bufferpool::BufferPool;
use futures::FutureExt as _;
use futures::SinkExt as _;
use futures::future::BoxFuture;
use ip_packet::make::TcpFlags;
use ip_packet::{IpPacket, MTU, make};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use telepresence_model::{ConnectionId, Protocol};
use telepresence_netstack::{DnsQuery, DnsResolver, FlowIo, Netstack, StreamFactory};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, PollSender};
use tun::Tun;

struct TestTun {
    from_host: mpsc::Receiver<IpPacket>,
    to_host: PollSender<IpPacket>,
}

impl Tun for TestTun {
    fn poll_send_ready(&mut self, cx: &mut Context) -> Poll<std::io::Result<()>> {
        self.to_host
            .poll_ready_unpin(cx)
            .map_err(std::io::Error::other)
    }

    fn send(&mut self, packet: IpPacket) -> std::io::Result<()> {
        self.to_host
            .start_send_unpin(packet)
            .map_err(std::io::Error::other)
    }

    fn poll_recv_many(
        &mut self,
        cx: &mut Context,
        buf: &mut Vec<IpPacket>,
        max: usize,
    ) -> Poll<usize> {
        self.from_host.poll_recv_many(cx, buf, max)
    }

    fn name(&self) -> &str {
        "tel-test"
    }
}

/// The cluster-side ends of one opened stream.
struct StreamEnds {
    id: ConnectionId,
    /// What the workstation sent into the tunnel.
    from_stack: mpsc::Receiver<Vec<u8>>,
    /// Sends bytes back towards the workstation.
    to_stack: mpsc::Sender<Vec<u8>>,
}

#[derive(Clone)]
struct TestFactory {
    calls: Arc<Mutex<Vec<ConnectionId>>>,
    streams: mpsc::UnboundedSender<StreamEnds>,
}

impl StreamFactory for TestFactory {
    fn open(&self, id: ConnectionId) -> BoxFuture<'static, anyhow::Result<FlowIo>> {
        self.calls.lock().unwrap().push(id);

        let (tx_a, rx_a) = mpsc::channel(64);
        let (tx_b, rx_b) = mpsc::channel(64);

        let _ = self.streams.send(StreamEnds {
            id,
            from_stack: rx_a,
            to_stack: tx_b,
        });

        async move { Ok(FlowIo { tx: tx_a, rx: rx_b }) }.boxed()
    }
}

struct TestResolver {
    queries: Arc<Mutex<Vec<DnsQuery>>>,
}

impl DnsResolver for TestResolver {
    fn resolve(&self, query: DnsQuery) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> {
        self.queries.lock().unwrap().push(query);

        // A minimal response: the query with the `qr` bit set and a zeroed id.
        let mut response = raw_query();
        response[0] = 0;
        response[1] = 0;
        response[2] |= 0x80;

        async move { Ok(response) }.boxed()
    }
}

struct Harness {
    pool: BufferPool,
    to_stack: mpsc::Sender<IpPacket>,
    from_stack: mpsc::Receiver<IpPacket>,
    streams: mpsc::UnboundedReceiver<StreamEnds>,
    calls: Arc<Mutex<Vec<ConnectionId>>>,
    queries: Arc<Mutex<Vec<DnsQuery>>>,
    cancel: CancellationToken,
    _dns_tx: watch::Sender<Vec<IpAddr>>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_stack(dns_addrs: Vec<IpAddr>) -> Harness {
    let pool = BufferPool::new(MTU, "test");

    let (to_stack, from_host) = mpsc::channel(128);
    let (to_host, from_stack) = mpsc::channel(128);
    let (streams_tx, streams) = mpsc::unbounded_channel();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let queries = Arc::new(Mutex::new(Vec::new()));

    let factory = TestFactory {
        calls: calls.clone(),
        streams: streams_tx,
    };
    let resolver = TestResolver {
        queries: queries.clone(),
    };

    let (dns_tx, dns_rx) = watch::channel(dns_addrs);

    let netstack = Netstack::new(pool.clone(), Arc::new(factory), Arc::new(resolver), dns_rx);

    let cancel = CancellationToken::new();
    let tun = TestTun {
        from_host,
        to_host: PollSender::new(to_host),
    };

    tokio::spawn(netstack.run(tun, cancel.clone()));

    Harness {
        pool,
        to_stack,
        from_stack,
        streams,
        calls,
        queries,
        cancel,
        _dns_tx: dns_tx,
    }
}

async fn next_packet(harness: &mut Harness) -> IpPacket {
    tokio::time::timeout(Duration::from_secs(5), harness.from_stack.recv())
        .await
        .expect("timed out waiting for a packet")
        .expect("stack exited")
}

fn raw_query() -> Vec<u8> {
    let mut message = vec![
        0xab, 0xcd, // id
        0x01, 0x00, // flags: rd
        0x00, 0x01, // qdcount
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // an/ns/ar
    ];
    message.extend_from_slice(&[3]);
    message.extend_from_slice(b"web");
    message.extend_from_slice(&[7]);
    message.extend_from_slice(b"default");
    message.push(0);
    message.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN

    message
}

const CLIENT: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 11, 0, 1));
const SERVER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2));
const DNS_SERVER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 96, 0, 10));

#[tokio::test]
async fn tcp_handshake_creates_exactly_one_stream() {
    let mut harness = spawn_stack(Vec::new());

    let syn = make::tcp_packet(
        &harness.pool,
        CLIENT,
        SERVER,
        51000,
        80,
        1000,
        64240,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        &[
            etherparse::TcpOptionElement::MaximumSegmentSize(1460),
            etherparse::TcpOptionElement::WindowScale(7),
        ],
        Vec::new(),
    )
    .unwrap();
    harness.to_stack.send(syn).await.unwrap();

    let syn_ack = next_packet(&mut harness).await;
    let tcp = syn_ack.as_tcp().unwrap();

    assert!(tcp.syn());
    assert!(tcp.ack());
    assert_eq!(tcp.acknowledgment_number(), 1001);

    let mut mss = None;
    let mut window_scale = None;
    for option in tcp.options_iterator() {
        match option.unwrap() {
            etherparse::TcpOptionElement::MaximumSegmentSize(value) => mss = Some(value),
            etherparse::TcpOptionElement::WindowScale(value) => window_scale = Some(value),
            _ => {}
        }
    }

    assert_eq!(mss, Some((MTU - 40) as u16), "MSS must be MTU - 40");
    assert_eq!(window_scale, Some(6), "window scale must be 6");

    // No stream before the handshake completes.
    assert!(harness.calls.lock().unwrap().is_empty());

    let server_seq = tcp.sequence_number();
    let ack = make::tcp_packet(
        &harness.pool,
        CLIENT,
        SERVER,
        51000,
        80,
        1001,
        64240,
        TcpFlags {
            ack: Some(server_seq + 1),
            ..Default::default()
        },
        &[],
        Vec::new(),
    )
    .unwrap();
    harness.to_stack.send(ack).await.unwrap();

    let mut stream = tokio::time::timeout(Duration::from_secs(5), harness.streams.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        stream.id,
        ConnectionId::new(
            Protocol::Tcp,
            "10.11.0.1:51000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
    );
    assert_eq!(harness.calls.lock().unwrap().len(), 1);

    // Payload flows into the stream in order.
    let data = make::tcp_packet(
        &harness.pool,
        CLIENT,
        SERVER,
        51000,
        80,
        1001,
        64240,
        TcpFlags {
            ack: Some(server_seq + 1),
            ..Default::default()
        },
        &[],
        b"hello".to_vec(),
    )
    .unwrap();
    harness.to_stack.send(data).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), stream.from_stack.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"hello");

    // And back out as a TCP segment.
    stream.to_stack.send(b"world".to_vec()).await.unwrap();

    let segment = loop {
        let packet = next_packet(&mut harness).await;
        if packet
            .tcp_payload()
            .is_some_and(|payload| !payload.is_empty())
        {
            break packet;
        }
    };

    assert_eq!(segment.tcp_payload().unwrap(), b"world");
    assert_eq!(segment.source(), SERVER);
    assert_eq!(segment.destination(), CLIENT);
}

#[tokio::test]
async fn dns_queries_are_served_locally() {
    let mut harness = spawn_stack(vec![DNS_SERVER]);

    let query = make::udp_packet(
        &harness.pool,
        CLIENT,
        DNS_SERVER,
        41000,
        53,
        raw_query(),
    )
    .unwrap();
    harness.to_stack.send(query).await.unwrap();

    let response = next_packet(&mut harness).await;
    let udp = response.as_udp().unwrap();

    assert_eq!(response.source(), DNS_SERVER);
    assert_eq!(response.destination(), CLIENT);
    assert_eq!(udp.source_port(), 53);
    assert_eq!(udp.destination_port(), 41000);

    // The response echoes the query id even though the resolver zeroed it.
    assert_eq!(&response.udp_payload().unwrap()[..2], &[0xab, 0xcd]);

    let queries = harness.queries.lock().unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].name, "web.default");

    // No tunnel stream was created for the DNS flow.
    assert!(harness.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn netbios_datagrams_are_dropped() {
    let mut harness = spawn_stack(Vec::new());

    let netbios = make::udp_packet(
        &harness.pool,
        CLIENT,
        SERVER,
        137,
        137,
        b"browse".to_vec(),
    )
    .unwrap();
    harness.to_stack.send(netbios).await.unwrap();

    // A regular datagram afterwards still creates a flow; NetBIOS did not.
    let datagram = make::udp_packet(
        &harness.pool,
        CLIENT,
        SERVER,
        41001,
        9000,
        b"ping".to_vec(),
    )
    .unwrap();
    harness.to_stack.send(datagram).await.unwrap();

    let stream = tokio::time::timeout(Duration::from_secs(5), harness.streams.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stream.id.destination().port(), 9000);
    assert_eq!(harness.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn udp_replies_are_crafted_from_the_flow_id() {
    let mut harness = spawn_stack(Vec::new());

    let datagram = make::udp_packet(
        &harness.pool,
        CLIENT,
        SERVER,
        41002,
        9000,
        b"ping".to_vec(),
    )
    .unwrap();
    harness.to_stack.send(datagram).await.unwrap();

    let mut stream = tokio::time::timeout(Duration::from_secs(5), harness.streams.recv())
        .await
        .unwrap()
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), stream.from_stack.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"ping");

    stream.to_stack.send(b"pong".to_vec()).await.unwrap();

    let reply = next_packet(&mut harness).await;
    let udp = reply.as_udp().unwrap();

    assert_eq!(reply.source(), SERVER);
    assert_eq!(reply.destination(), CLIENT);
    assert_eq!(udp.source_port(), 9000);
    assert_eq!(udp.destination_port(), 41002);
    assert_eq!(reply.udp_payload().unwrap(), b"pong");
}
