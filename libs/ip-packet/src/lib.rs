#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod make;

use anyhow::{Context as _, Result, bail};
use bufferpool::{Buffer, BufferPool};
use etherparse::{IpNumber, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use std::net::IpAddr;

/// The MTU of the virtual interface and thus the size of every pooled packet buffer.
pub const MTU: usize = 1500;

/// Minimum bytes of IPv4 header.
const IPV4_HEADER_LEN: usize = 20;
/// Fixed bytes of IPv6 header.
const IPV6_HEADER_LEN: usize = 40;

/// The packet was an IP fragment; we do not reassemble.
#[derive(Debug, thiserror::Error)]
#[error("packet is fragmented")]
pub struct Fragmented;

/// A buffer for reading a new [`IpPacket`] off the TUN device.
pub struct IpPacketBuf {
    inner: Buffer,
}

impl IpPacketBuf {
    pub fn new(pool: &BufferPool) -> Self {
        Self { inner: pool.pull() }
    }

    pub fn buf(&mut self) -> &mut [u8] {
        &mut self.inner
    }
}

/// One parsed IP packet backed by a pooled buffer.
///
/// Header fields are read through `etherparse` slices on demand; the buffer is
/// validated once on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPacket {
    Ipv4(Buffer),
    Ipv6(Buffer),
}

impl IpPacket {
    /// Parses `len` bytes out of `buf` as an IP packet.
    pub fn new(buf: IpPacketBuf, len: usize) -> Result<Self> {
        let mut buffer = buf.inner;

        anyhow::ensure!(len > 0, "Empty packet");
        anyhow::ensure!(len <= buffer.len(), "Packet length exceeds buffer");
        buffer.truncate(len);

        match buffer[0] >> 4 {
            4 => {
                let header = Ipv4HeaderSlice::from_slice(&buffer)
                    .context("Failed to parse IPv4 header")?;

                if header.is_fragmenting_payload() {
                    bail!(Fragmented);
                }

                let total_len = header.total_len() as usize;
                anyhow::ensure!(total_len <= len, "IPv4 total length exceeds packet");
                buffer.truncate(total_len);

                Ok(IpPacket::Ipv4(buffer))
            }
            6 => {
                let header = Ipv6HeaderSlice::from_slice(&buffer)
                    .context("Failed to parse IPv6 header")?;

                let total_len = IPV6_HEADER_LEN + header.payload_length() as usize;
                anyhow::ensure!(total_len <= len, "IPv6 payload length exceeds packet");
                buffer.truncate(total_len);

                Ok(IpPacket::Ipv6(buffer))
            }
            version => bail!("Unsupported IP version {version}"),
        }
    }

    // Parsing the headers again on access cannot fail; `new` validated them.

    fn ipv4_header<'a>(buf: &'a [u8]) -> Ipv4HeaderSlice<'a> {
        #[allow(clippy::unwrap_used)]
        let header = Ipv4HeaderSlice::from_slice(buf).unwrap();

        header
    }

    fn ipv6_header<'a>(buf: &'a [u8]) -> Ipv6HeaderSlice<'a> {
        #[allow(clippy::unwrap_used)]
        let header = Ipv6HeaderSlice::from_slice(buf).unwrap();

        header
    }

    pub fn source(&self) -> IpAddr {
        match self {
            IpPacket::Ipv4(buf) => IpAddr::V4(Self::ipv4_header(buf).source_addr()),
            IpPacket::Ipv6(buf) => IpAddr::V6(Self::ipv6_header(buf).source_addr()),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self {
            IpPacket::Ipv4(buf) => IpAddr::V4(Self::ipv4_header(buf).destination_addr()),
            IpPacket::Ipv6(buf) => IpAddr::V6(Self::ipv6_header(buf).destination_addr()),
        }
    }

    /// The IANA protocol number of the transport payload.
    pub fn next_header(&self) -> IpNumber {
        match self {
            IpPacket::Ipv4(buf) => Self::ipv4_header(buf).protocol(),
            IpPacket::Ipv6(buf) => Self::ipv6_header(buf).next_header(),
        }
    }

    fn transport_offset(&self) -> usize {
        match self {
            IpPacket::Ipv4(buf) => Self::ipv4_header(buf).slice().len().max(IPV4_HEADER_LEN),
            IpPacket::Ipv6(_) => IPV6_HEADER_LEN,
        }
    }

    fn transport_payload(&self) -> &[u8] {
        &self.packet()[self.transport_offset()..]
    }

    pub fn as_tcp(&self) -> Option<TcpHeaderSlice<'_>> {
        if self.next_header() != IpNumber::TCP {
            return None;
        }

        TcpHeaderSlice::from_slice(self.transport_payload()).ok()
    }

    /// The bytes after the TCP header.
    pub fn tcp_payload(&self) -> Option<&[u8]> {
        let tcp = self.as_tcp()?;
        let offset = tcp.data_offset() as usize * 4;

        self.transport_payload().get(offset..)
    }

    pub fn as_udp(&self) -> Option<UdpHeaderSlice<'_>> {
        if self.next_header() != IpNumber::UDP {
            return None;
        }

        UdpHeaderSlice::from_slice(self.transport_payload()).ok()
    }

    /// The bytes after the UDP header.
    pub fn udp_payload(&self) -> Option<&[u8]> {
        self.as_udp()?;

        self.transport_payload().get(8..)
    }

    pub fn is_icmp(&self) -> bool {
        matches!(self.next_header(), IpNumber::ICMP | IpNumber::IPV6_ICMP)
    }

    pub fn packet(&self) -> &[u8] {
        match self {
            IpPacket::Ipv4(buf) | IpPacket::Ipv6(buf) => buf,
        }
    }

    pub fn packet_mut(&mut self) -> &mut [u8] {
        match self {
            IpPacket::Ipv4(buf) | IpPacket::Ipv6(buf) => buf,
        }
    }

    pub fn len(&self) -> usize {
        self.packet().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packet().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pool() -> BufferPool {
        BufferPool::new(MTU, "test")
    }

    #[test]
    fn parses_udp_packet() {
        let pool = pool();
        let packet = make::udp_packet(
            &pool,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            5353,
            53,
            b"payload".to_vec(),
        )
        .unwrap();

        assert_eq!(packet.source(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(packet.destination(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        let udp = packet.as_udp().unwrap();
        assert_eq!(udp.source_port(), 5353);
        assert_eq!(udp.destination_port(), 53);
        assert_eq!(packet.udp_payload().unwrap(), b"payload");
    }

    #[test]
    fn rejects_fragments() {
        let pool = pool();
        let mut packet = make::udp_packet(
            &pool,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            1,
            2,
            vec![0; 8],
        )
        .unwrap();

        // Set the more-fragments bit and re-parse.
        let raw = packet.packet_mut();
        raw[6] |= 0x20;

        let mut buf = IpPacketBuf::new(&pool);
        let len = raw.len();
        buf.buf()[..len].copy_from_slice(raw);

        let error = IpPacket::new(buf, len).unwrap_err();

        assert!(error.is::<Fragmented>());
    }

    #[test]
    fn rejects_truncated_packets() {
        let pool = pool();
        let mut buf = IpPacketBuf::new(&pool);
        buf.buf()[0] = 4 << 4;

        assert!(IpPacket::new(buf, 3).is_err());
    }
}
