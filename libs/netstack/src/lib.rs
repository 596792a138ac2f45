#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The user-space network stack behind the virtual interface.
//!
//! Raw IP packets come in from the TUN device; TCP connections are terminated
//! by `smoltcp`, UDP datagrams are handled statelessly, and every resulting
//! flow is paired with a stream obtained from a [`StreamFactory`]. DNS
//! queries for the cluster's resolver never become streams; they are answered
//! by a [`DnsResolver`].

mod device;
mod dns;
mod interface;
mod tcp;
mod udp;

pub use dns::{DnsQuery, DnsResolver};

use anyhow::{Context as _, Result};
use bufferpool::BufferPool;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt as _};
use ip_packet::{IpPacket, make};
use smoltcp::iface::{Interface, PollResult, SocketSet};
use smoltcp::socket::tcp::{self as smol_tcp, State};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::future::Future as _;
use std::net::{IpAddr, SocketAddr};
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use telepresence_model::{ConnectionId, Protocol, timeouts};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tun::Tun;

use crate::device::InMemoryDevice;
use crate::tcp::{FlowState, OpenFlow, TcpFlow};
use crate::udp::{MAX_QUEUED_DATAGRAMS, NETBIOS_PORTS, UdpFlow, UdpFlowState};

/// How many packets we pull off the TUN per poll.
const BATCH_SIZE: usize = 100;

/// The two directed byte channels backing one flow.
///
/// Dropping the sender signals end-of-stream (`close_send`); dropping the
/// whole pair aborts the flow.
pub struct FlowIo {
    /// Workstation to cluster.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Cluster to workstation.
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// Creates the stream backing a new flow.
///
/// Called exactly once per flow: for TCP once the three-way handshake
/// completes, for UDP on the first datagram.
pub trait StreamFactory: Send + Sync + 'static {
    fn open(&self, id: ConnectionId) -> BoxFuture<'static, Result<FlowIo>>;
}

pub struct Netstack {
    pool: BufferPool,
    factory: Arc<dyn StreamFactory>,
    resolver: Arc<dyn DnsResolver>,
    /// Addresses of the cluster resolver; UDP port 53 to these is intercepted.
    dns_addrs: watch::Receiver<Vec<IpAddr>>,

    device: InMemoryDevice,
    interface: Interface,
    sockets: SocketSet<'static>,

    tcp_flows: HashMap<ConnectionId, TcpFlow>,
    udp_flows: HashMap<ConnectionId, UdpFlow>,

    opening: FuturesUnordered<BoxFuture<'static, (ConnectionId, Result<FlowIo>)>>,
    dns_pending: FuturesUnordered<BoxFuture<'static, Result<IpPacket>>>,

    tun_outbound: VecDeque<IpPacket>,
    batch: Vec<IpPacket>,

    boot: Instant,
    stack_timer: Pin<Box<tokio::time::Sleep>>,
    sweep: tokio::time::Interval,
}

impl Netstack {
    pub fn new(
        pool: BufferPool,
        factory: Arc<dyn StreamFactory>,
        resolver: Arc<dyn DnsResolver>,
        dns_addrs: watch::Receiver<Vec<IpAddr>>,
    ) -> Self {
        let mut device = InMemoryDevice::new(pool.clone());
        let interface = interface::create_interface(&mut device);

        let mut sweep = tokio::time::interval(std::time::Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        Self {
            pool,
            factory,
            resolver,
            dns_addrs,
            device,
            interface,
            sockets: SocketSet::new(Vec::default()),
            tcp_flows: HashMap::default(),
            udp_flows: HashMap::default(),
            opening: FuturesUnordered::default(),
            dns_pending: FuturesUnordered::default(),
            tun_outbound: VecDeque::default(),
            batch: Vec::with_capacity(BATCH_SIZE),
            boot: Instant::now(),
            stack_timer: Box::pin(tokio::time::sleep(std::time::Duration::ZERO)),
            sweep,
        }
    }

    /// Drives the packet loop until cancelled.
    ///
    /// I/O errors on the TUN device are fatal and propagate out of here;
    /// per-flow errors terminate only that flow.
    pub async fn run(mut self, mut tun: impl Tun, cancel: CancellationToken) -> Result<()> {
        let mut cancelled = pin!(cancel.cancelled());

        std::future::poll_fn(|cx| {
            if cancelled.as_mut().poll(cx).is_ready() {
                tracing::debug!("Packet loop cancelled");

                return Poll::Ready(Ok(()));
            }

            self.poll(cx, &mut tun)
        })
        .await
    }

    fn poll(&mut self, cx: &mut Context, tun: &mut impl Tun) -> Poll<Result<()>> {
        loop {
            let mut progress = false;

            // Flush stack output towards the kernel first; everything below may append to it.
            loop {
                if self.tun_outbound.is_empty() {
                    break;
                }

                match tun.poll_send_ready(cx) {
                    Poll::Ready(Ok(())) => {
                        let Some(packet) = self.tun_outbound.pop_front() else {
                            break;
                        };
                        tun.send(packet).context("Failed to write to TUN device")?;
                        progress = true;
                    }
                    Poll::Ready(Err(e)) => {
                        return Poll::Ready(Err(e).context("TUN device failed"));
                    }
                    Poll::Pending => break,
                }
            }

            if let Poll::Ready(num_packets) =
                tun.poll_recv_many(cx, &mut self.batch, BATCH_SIZE)
            {
                if num_packets == 0 {
                    return Poll::Ready(Err(anyhow::anyhow!("TUN device is closed")));
                }

                let mut batch = std::mem::take(&mut self.batch);
                for packet in batch.drain(..) {
                    self.handle_inbound(packet);
                }
                self.batch = batch;

                progress = true;
            }

            while let Poll::Ready(Some((id, result))) = self.opening.poll_next_unpin(cx) {
                self.on_stream_opened(id, result);
                progress = true;
            }

            while let Poll::Ready(Some(result)) = self.dns_pending.poll_next_unpin(cx) {
                match result {
                    Ok(packet) => self.tun_outbound.push_back(packet),
                    Err(e) => tracing::debug!("DNS lookup failed: {e:#}"),
                }
                progress = true;
            }

            progress |= self.pump_tcp(cx);
            progress |= self.pump_udp(cx);

            let now = interface::smol_now(self.boot, Instant::now());
            if self.interface.poll(now, &mut self.device, &mut self.sockets)
                != PollResult::None
            {
                progress = true;
            }

            while let Some(packet) = self.device.next_send() {
                self.tun_outbound.push_back(packet);
                progress = true;
            }

            if self.sweep.poll_tick(cx).is_ready() {
                self.sweep_idle_flows();
                progress = true;
            }

            if progress {
                continue;
            }

            // Nothing moved; arm the retransmission timer and suspend.
            if let Some(delay) = self.interface.poll_delay(now, &self.sockets) {
                let delay = std::time::Duration::from_micros(delay.total_micros());
                self.stack_timer
                    .as_mut()
                    .reset(tokio::time::Instant::now() + delay);

                if self.stack_timer.as_mut().poll(cx).is_ready() {
                    continue;
                }
            }

            return Poll::Pending;
        }
    }

    fn handle_inbound(&mut self, packet: IpPacket) {
        enum Transport {
            Tcp { syn: bool },
            Udp,
        }

        let (transport, sport, dport) = if let Some(tcp) = packet.as_tcp() {
            (
                Transport::Tcp { syn: tcp.syn() },
                tcp.source_port(),
                tcp.destination_port(),
            )
        } else if let Some(udp) = packet.as_udp() {
            (Transport::Udp, udp.source_port(), udp.destination_port())
        } else {
            tracing::trace!(?packet, "Dropping non-TCP/UDP packet");

            return;
        };

        match transport {
            Transport::Tcp { syn } => self.handle_tcp(packet, sport, dport, syn),
            Transport::Udp => self.handle_udp(packet, sport, dport),
        }
    }

    fn handle_tcp(&mut self, packet: IpPacket, sport: u16, dport: u16, syn: bool) {
        let id = ConnectionId::new(
            Protocol::Tcp,
            SocketAddr::new(packet.source(), sport),
            SocketAddr::new(packet.destination(), dport),
        );

        if !self.tcp_flows.contains_key(&id) {
            if syn {
                let mut socket = tcp::create_socket();

                if let Err(e) = socket.listen(id.destination()) {
                    tracing::warn!(%id, "Failed to listen for new TCP flow: {e}");

                    return;
                }

                let handle = self.sockets.add(socket);
                self.tcp_flows.insert(
                    id,
                    TcpFlow {
                        handle,
                        io: FlowState::Connecting,
                        dialled: false,
                    },
                );

                tracing::debug!(%id, "New TCP flow");
            }
            // Non-SYN segments for unknown flows fall through; the stack answers with a RST.
        }

        self.device.receive(packet);
    }

    fn handle_udp(&mut self, packet: IpPacket, sport: u16, dport: u16) {
        if NETBIOS_PORTS.contains(&dport) {
            tracing::trace!(%dport, "Dropping NetBIOS datagram");

            return;
        }

        if dport == 53 && self.dns_addrs.borrow().contains(&packet.destination()) {
            self.handle_dns(&packet, sport);

            return;
        }

        let id = ConnectionId::new(
            Protocol::Udp,
            SocketAddr::new(packet.source(), sport),
            SocketAddr::new(packet.destination(), dport),
        );
        let Some(payload) = packet.udp_payload().map(<[u8]>::to_vec) else {
            return;
        };
        let now = Instant::now();

        match self.udp_flows.entry(id) {
            Entry::Vacant(entry) => {
                let mut flow = UdpFlow::new(packet, now);
                if let UdpFlowState::Connecting { queued, .. } = &mut flow.io {
                    queued.push(payload);
                }
                entry.insert(flow);

                let factory = self.factory.clone();
                self.opening
                    .push(async move { (id, factory.open(id).await) }.boxed());

                tracing::debug!(%id, "New UDP flow");
            }
            Entry::Occupied(mut entry) => {
                let flow = entry.get_mut();
                flow.last_activity = now;

                match &mut flow.io {
                    UdpFlowState::Connecting { queued, .. } => {
                        if queued.len() < MAX_QUEUED_DATAGRAMS {
                            queued.push(payload);
                        } else {
                            tracing::trace!(%id, "Dropping datagram; stream not yet open");
                        }
                    }
                    UdpFlowState::Open { tx, .. } => {
                        if tx.try_send(payload).is_err() {
                            tracing::trace!(%id, "Dropping datagram; stream is congested");
                        }
                    }
                }
            }
        }
    }

    fn handle_dns(&mut self, packet: &IpPacket, client_port: u16) {
        let Some(payload) = packet.udp_payload() else {
            return;
        };

        let query = match dns::parse_query(payload) {
            Ok(query) => query,
            Err(e) => {
                tracing::debug!("Ignoring malformed DNS query: {e:#}");

                return;
            }
        };

        tracing::trace!(name = %query.name, qtype = %query.qtype, "Intercepted DNS query");

        let resolver = self.resolver.clone();
        let pool = self.pool.clone();
        let server = packet.destination();
        let client = packet.source();

        self.dns_pending.push(
            async move {
                let id = query.id;
                let mut response = resolver.resolve(query).await?;
                dns::patch_id(&mut response, id);

                make::udp_packet(&pool, server, client, 53, client_port, response)
            }
            .boxed(),
        );
    }

    fn on_stream_opened(&mut self, id: ConnectionId, result: Result<FlowIo>) {
        match id.protocol() {
            Protocol::Tcp => {
                let Some(flow) = self.tcp_flows.get_mut(&id) else {
                    return;
                };
                let socket = self.sockets.get_mut::<smol_tcp::Socket>(flow.handle);

                match result {
                    Ok(io) => {
                        flow.io = FlowState::Open(OpenFlow::new(io.tx, io.rx));
                    }
                    Err(e) => {
                        tracing::warn!(%id, "Failed to open stream: {e:#}");

                        socket.abort();
                        flow.io = FlowState::Aborted;
                    }
                }
            }
            Protocol::Udp => match result {
                Ok(io) => {
                    let Some(flow) = self.udp_flows.get_mut(&id) else {
                        return;
                    };

                    if let UdpFlowState::Connecting { queued, .. } = &mut flow.io {
                        for datagram in queued.drain(..) {
                            if io.tx.try_send(datagram).is_err() {
                                tracing::trace!(%id, "Dropping queued datagram");
                            }
                        }
                    }

                    flow.io = UdpFlowState::Open {
                        tx: io.tx,
                        rx: io.rx,
                    };
                }
                Err(e) => {
                    tracing::warn!(%id, "Failed to open stream: {e:#}");

                    let Some(flow) = self.udp_flows.remove(&id) else {
                        return;
                    };

                    if let UdpFlowState::Connecting { original, .. } = flow.io {
                        match make::icmp_dest_unreachable(&self.pool, &original) {
                            Ok(icmp) => self.tun_outbound.push_back(icmp),
                            Err(e) => tracing::debug!("Failed to craft ICMP error: {e:#}"),
                        }
                    }
                }
            },
            Protocol::Icmp4 | Protocol::Icmp6 => {
                debug_assert!(false, "streams are never dialled for ICMP")
            }
        }
    }

    fn pump_tcp(&mut self, cx: &mut Context) -> bool {
        let mut progress = false;
        let mut closed = Vec::new();

        for (id, flow) in self.tcp_flows.iter_mut() {
            let socket = self.sockets.get_mut::<smol_tcp::Socket>(flow.handle);

            if socket.state() == State::Closed {
                closed.push(*id);
                continue;
            }

            // Dial the stream once the three-way handshake completes.
            if !flow.dialled && socket.state() == State::Established {
                flow.dialled = true;

                let id = *id;
                let factory = self.factory.clone();
                self.opening
                    .push(async move { (id, factory.open(id).await) }.boxed());

                progress = true;
            }

            let established = flow.dialled;
            let mut abort = false;

            if let FlowState::Open(open) = &mut flow.io {
                // Workstation to cluster: drain the socket into the stream.
                while socket.can_recv() && !open.tx_closed && !abort {
                    match open.tx.poll_reserve(cx) {
                        Poll::Ready(Ok(())) => {
                            let chunk = socket.recv(|buf| {
                                let take = buf.len().min(tcp::RECV_CHUNK);

                                (take, buf[..take].to_vec())
                            });

                            match chunk {
                                Ok(chunk) => {
                                    if open.tx.send_item(chunk).is_err() {
                                        abort = true;
                                    } else {
                                        progress = true;
                                    }
                                }
                                Err(_) => abort = true,
                            }
                        }
                        // The stream is gone; reset the workstation side.
                        Poll::Ready(Err(_)) => abort = true,
                        // Window fills up and closes; no silent drops.
                        Poll::Pending => break,
                    }
                }

                // The workstation sent a FIN and we drained everything: propagate end-of-stream.
                if !abort
                    && established
                    && !socket.may_recv()
                    && !socket.can_recv()
                    && !open.tx_closed
                {
                    open.tx.close();
                    open.tx_closed = true;
                    progress = true;
                }

                // Cluster to workstation: feed stream chunks into the socket's send buffer.
                while !abort {
                    if open.pending_out.is_none() && !open.rx_closed {
                        match open.rx.poll_recv(cx) {
                            Poll::Ready(Some(chunk)) => open.pending_out = Some((chunk, 0)),
                            Poll::Ready(None) => open.rx_closed = true,
                            Poll::Pending => {}
                        }
                    }

                    let Some((chunk, offset)) = &mut open.pending_out else {
                        break;
                    };

                    if !socket.can_send() {
                        break;
                    }

                    match socket.send_slice(&chunk[*offset..]) {
                        Ok(0) => break,
                        Ok(sent) => {
                            *offset += sent;
                            progress = true;

                            if *offset == chunk.len() {
                                open.pending_out = None;
                            }
                        }
                        Err(_) => abort = true,
                    }
                }

                if !abort && open.rx_closed && open.pending_out.is_none() && !open.fin_sent {
                    socket.close();
                    open.fin_sent = true;
                    progress = true;
                }
            }

            if abort {
                socket.abort();
                flow.io = FlowState::Aborted;
                progress = true;
            }
        }

        for id in closed {
            if let Some(flow) = self.tcp_flows.remove(&id) {
                self.sockets.remove(flow.handle);

                tracing::debug!(%id, "TCP flow closed");
            }
        }

        progress
    }

    fn pump_udp(&mut self, cx: &mut Context) -> bool {
        let mut progress = false;

        for (id, flow) in self.udp_flows.iter_mut() {
            let UdpFlowState::Open { rx, .. } = &mut flow.io else {
                continue;
            };

            while let Poll::Ready(next) = rx.poll_recv(cx) {
                let Some(datagram) = next else {
                    // Stream closed; the idle sweep reaps the flow.
                    break;
                };

                flow.last_activity = Instant::now();
                progress = true;

                match make::udp_packet(
                    &self.pool,
                    id.destination().ip(),
                    id.source().ip(),
                    id.destination().port(),
                    id.source().port(),
                    datagram,
                ) {
                    Ok(packet) => self.tun_outbound.push_back(packet),
                    Err(e) => tracing::debug!(%id, "Failed to craft UDP reply: {e:#}"),
                }
            }
        }

        progress
    }

    fn sweep_idle_flows(&mut self) {
        let now = Instant::now();

        self.udp_flows.retain(|id, flow| {
            let keep = now.duration_since(flow.last_activity) < timeouts::UDP_IDLE;

            if !keep {
                tracing::debug!(%id, "Closing idle UDP flow");
            }

            keep
        });
    }
}
