use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp;
use smoltcp::storage::RingBuffer;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Receive buffer per TCP socket.
///
/// smoltcp derives the advertised window scale from the buffer capacity; 2 MiB
/// yields a window-scale option of 6 on the SYN-ACK.
pub(crate) const TCP_RX_BUFFER: usize = 2 * 1024 * 1024;
/// Send buffer per TCP socket.
pub(crate) const TCP_TX_BUFFER: usize = 512 * 1024;

/// How much TCP payload we hand to the tunnel stream at once.
pub(crate) const RECV_CHUNK: usize = 16 * 1024;

/// Idle time before the first keep-alive probe and between probes.
const KEEP_ALIVE_INTERVAL: smoltcp::time::Duration = smoltcp::time::Duration::from_secs(30);
/// Abort after a 60 s idle grace plus nine unanswered 30 s probes.
const ABORT_AFTER_SILENCE: smoltcp::time::Duration = smoltcp::time::Duration::from_secs(330);

pub(crate) fn create_socket() -> tcp::Socket<'static> {
    let mut socket = tcp::Socket::new(
        RingBuffer::new(vec![0; TCP_RX_BUFFER]),
        RingBuffer::new(vec![0; TCP_TX_BUFFER]),
    );
    socket.set_nagle_enabled(false);
    socket.set_keep_alive(Some(KEEP_ALIVE_INTERVAL));
    socket.set_timeout(Some(ABORT_AFTER_SILENCE));

    socket
}

/// Book-keeping for one terminated TCP connection.
pub(crate) struct TcpFlow {
    pub(crate) handle: SocketHandle,
    pub(crate) io: FlowState,
    /// Whether the factory has been invoked for this flow yet.
    ///
    /// Streams are only dialled once the three-way handshake completes.
    pub(crate) dialled: bool,
}

pub(crate) enum FlowState {
    /// Handshake or stream dial still in progress.
    Connecting,
    Open(OpenFlow),
    /// The stream failed or was aborted; the socket is being reset.
    Aborted,
}

pub(crate) struct OpenFlow {
    /// Workstation to cluster.
    pub(crate) tx: PollSender<Vec<u8>>,
    /// Cluster to workstation.
    pub(crate) rx: mpsc::Receiver<Vec<u8>>,
    /// One chunk pulled off `rx` that did not fit the socket's send buffer yet.
    pub(crate) pending_out: Option<(Vec<u8>, usize)>,
    /// The cluster side stopped sending.
    pub(crate) rx_closed: bool,
    /// We already propagated the workstation's FIN into the stream.
    pub(crate) tx_closed: bool,
    /// We already issued our own FIN towards the workstation.
    pub(crate) fin_sent: bool,
}

impl OpenFlow {
    pub(crate) fn new(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            tx: PollSender::new(tx),
            rx,
            pending_out: None,
            rx_closed: false,
            tx_closed: false,
            fin_sent: false,
        }
    }
}
