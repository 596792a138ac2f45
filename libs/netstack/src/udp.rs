use ip_packet::IpPacket;
use std::time::Instant;
use tokio::sync::mpsc;

/// Datagrams buffered per flow while its stream is still being dialled.
pub(crate) const MAX_QUEUED_DATAGRAMS: usize = 32;

/// The NetBIOS ports we silently drop instead of tunnelling.
pub(crate) const NETBIOS_PORTS: [u16; 3] = [137, 138, 139];

/// One stateless UDP endpoint.
///
/// There is no connection state to track beyond the stream itself; an idle
/// timer reaps flows whose stream has seen no traffic.
pub(crate) struct UdpFlow {
    pub(crate) io: UdpFlowState,
    pub(crate) last_activity: Instant,
}

pub(crate) enum UdpFlowState {
    Connecting {
        /// The packet that created the flow, kept for an ICMP error on dial failure.
        original: IpPacket,
        queued: Vec<Vec<u8>>,
    },
    Open {
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
    },
}

impl UdpFlow {
    pub(crate) fn new(original: IpPacket, now: Instant) -> Self {
        Self {
            io: UdpFlowState::Connecting {
                original,
                queued: Vec::new(),
            },
            last_activity: now,
        }
    }
}
