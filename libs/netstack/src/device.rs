use std::collections::VecDeque;

use bufferpool::BufferPool;
use ip_packet::{IpPacket, IpPacketBuf};

/// An in-memory device for [`smoltcp`] that is entirely backed by buffers.
///
/// The packet loop feeds it the TUN packets it selects for the TCP stack and
/// drains the stack's replies back towards the TUN.
#[derive(Debug)]
pub(crate) struct InMemoryDevice {
    pool: BufferPool,
    inbound_packets: VecDeque<IpPacket>,
    outbound_packets: VecDeque<IpPacket>,
}

impl InMemoryDevice {
    pub(crate) fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            inbound_packets: VecDeque::default(),
            outbound_packets: VecDeque::default(),
        }
    }

    pub(crate) fn receive(&mut self, packet: IpPacket) {
        self.inbound_packets.push_back(packet);
    }

    pub(crate) fn next_send(&mut self) -> Option<IpPacket> {
        self.outbound_packets.pop_front()
    }
}

impl smoltcp::phy::Device for InMemoryDevice {
    type RxToken<'a> = SmolRxToken;
    type TxToken<'a> = SmolTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let rx_token = SmolRxToken {
            packet: self.inbound_packets.pop_front()?,
        };
        let tx_token = SmolTxToken {
            pool: &self.pool,
            outbound_packets: &mut self.outbound_packets,
        };

        Some((rx_token, tx_token))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(SmolTxToken {
            pool: &self.pool,
            outbound_packets: &mut self.outbound_packets,
        })
    }

    fn capabilities(&self) -> smoltcp::phy::DeviceCapabilities {
        let mut caps = smoltcp::phy::DeviceCapabilities::default();
        caps.medium = smoltcp::phy::Medium::Ip;
        caps.max_transmission_unit = ip_packet::MTU;

        caps
    }
}

pub(crate) struct SmolTxToken<'a> {
    pool: &'a BufferPool,
    outbound_packets: &'a mut VecDeque<IpPacket>,
}

impl smoltcp::phy::TxToken for SmolTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet_buf = IpPacketBuf::new(self.pool);
        let result = f(&mut packet_buf.buf()[..len]);

        let packet =
            IpPacket::new(packet_buf, len).expect("smoltcp always emits parseable packets");
        self.outbound_packets.push_back(packet);

        result
    }
}

pub(crate) struct SmolRxToken {
    packet: IpPacket,
}

impl smoltcp::phy::RxToken for SmolRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(self.packet.packet())
    }
}
