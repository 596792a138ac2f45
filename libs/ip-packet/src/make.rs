//! Factory module for the packets we originate ourselves: UDP replies, ICMP
//! errors and the raw TCP segments used by tests.

use crate::{IpPacket, IpPacketBuf};
use anyhow::{Context as _, Result, bail};
use bufferpool::BufferPool;
use etherparse::{Icmpv4Type, Icmpv6Type, PacketBuilder, TcpOptionElement, icmpv4, icmpv6};
use std::io::Cursor;
use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
#[error("source and destination are different IP versions")]
pub struct IpVersionMismatch;

fn finish<B>(pool: &BufferPool, builder: B, payload: &[u8]) -> Result<IpPacket>
where
    B: FinalBuilder,
{
    let size = builder.size(payload.len());
    let mut buf = IpPacketBuf::new(pool);

    anyhow::ensure!(size <= buf.inner.len(), "Packet is too big; len={size}");

    builder
        .write(&mut Cursor::new(buf.buf()), payload)
        .context("Failed to serialise packet")?;

    IpPacket::new(buf, size)
}

/// The subset of `etherparse`'s builder steps that only need a payload to finish.
trait FinalBuilder {
    fn size(&self, payload_len: usize) -> usize;
    fn write(self, cursor: &mut Cursor<&mut [u8]>, payload: &[u8]) -> Result<()>;
}

macro_rules! impl_final_builder {
    ($step:ty) => {
        impl FinalBuilder for etherparse::PacketBuilderStep<$step> {
            fn size(&self, payload_len: usize) -> usize {
                etherparse::PacketBuilderStep::<$step>::size(self, payload_len)
            }

            fn write(self, cursor: &mut Cursor<&mut [u8]>, payload: &[u8]) -> Result<()> {
                etherparse::PacketBuilderStep::<$step>::write(self, cursor, payload)
                    .map_err(anyhow::Error::new)
            }
        }
    };
}

impl_final_builder!(etherparse::UdpHeader);
impl_final_builder!(etherparse::TcpHeader);
impl_final_builder!(etherparse::Icmpv4Header);
impl_final_builder!(etherparse::Icmpv6Header);

pub fn udp_packet(
    pool: &BufferPool,
    src: IpAddr,
    dst: IpAddr,
    sport: u16,
    dport: u16,
    payload: Vec<u8>,
) -> Result<IpPacket> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => finish(
            pool,
            PacketBuilder::ipv4(src.octets(), dst.octets(), 64).udp(sport, dport),
            &payload,
        ),
        (IpAddr::V6(src), IpAddr::V6(dst)) => finish(
            pool,
            PacketBuilder::ipv6(src.octets(), dst.octets(), 64).udp(sport, dport),
            &payload,
        ),
        (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
            bail!(IpVersionMismatch)
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: Option<u32>,
    pub fin: bool,
    pub rst: bool,
}

/// A raw TCP segment; primarily used by the stack tests to play the kernel's role.
pub fn tcp_packet(
    pool: &BufferPool,
    src: IpAddr,
    dst: IpAddr,
    sport: u16,
    dport: u16,
    seq: u32,
    window: u16,
    flags: TcpFlags,
    options: &[TcpOptionElement],
    payload: Vec<u8>,
) -> Result<IpPacket> {
    macro_rules! build_tcp {
        ($ip:expr) => {{
            let mut tcp = $ip.tcp(sport, dport, seq, window);

            if flags.syn {
                tcp = tcp.syn();
            }
            if let Some(ack) = flags.ack {
                tcp = tcp.ack(ack);
            }
            if flags.fin {
                tcp = tcp.fin();
            }
            if flags.rst {
                tcp = tcp.rst();
            }
            if !options.is_empty() {
                tcp = tcp.options(options).context("Failed to set TCP options")?;
            }

            finish(pool, tcp, &payload)
        }};
    }

    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            build_tcp!(PacketBuilder::ipv4(src.octets(), dst.octets(), 64))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            build_tcp!(PacketBuilder::ipv6(src.octets(), dst.octets(), 64))
        }
        (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
            bail!(IpVersionMismatch)
        }
    }
}

/// ICMP "destination unreachable (port)" in reply to `original`.
///
/// The payload is the original IP header plus the first eight bytes of its
/// payload, as mandated for ICMP errors.
pub fn icmp_dest_unreachable(pool: &BufferPool, original: &IpPacket) -> Result<IpPacket> {
    let quoted = quoted_payload(original);

    match (original.source(), original.destination()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => finish(
            pool,
            PacketBuilder::ipv4(dst.octets(), src.octets(), 64).icmpv4(
                Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Port),
            ),
            quoted,
        ),
        (IpAddr::V6(src), IpAddr::V6(dst)) => finish(
            pool,
            PacketBuilder::ipv6(dst.octets(), src.octets(), 64).icmpv6(
                Icmpv6Type::DestinationUnreachable(icmpv6::DestUnreachableCode::Port),
            ),
            quoted,
        ),
        (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
            bail!(IpVersionMismatch)
        }
    }
}

fn quoted_payload(original: &IpPacket) -> &[u8] {
    let quote_len = (original.transport_offset() + 8).min(original.len());

    &original.packet()[..quote_len]
}
