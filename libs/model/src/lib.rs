#![cfg_attr(test, allow(clippy::unwrap_used))]

mod intercept;
mod subnet;

pub mod timeouts;

pub use intercept::{
    HeaderMatch, HeaderValue, InterceptError, InterceptId, InterceptRuntime, InterceptSpec,
    InterceptState, Mechanism, MountIntent,
};
pub use subnet::{DnsConfig, SubnetSnapshot};

use anyhow::{Context as _, Result, bail};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime};

/// The transport protocol of a [`ConnectionId`].
///
/// The discriminants are the IANA protocol numbers so they can go on the wire as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Protocol {
    Icmp4 = 1,
    Tcp = 6,
    Udp = 17,
    Icmp6 = 58,
}

impl Protocol {
    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Protocol::Icmp4),
            6 => Ok(Protocol::Tcp),
            17 => Ok(Protocol::Udp),
            58 => Ok(Protocol::Icmp6),
            other => bail!("Unknown protocol number {other}"),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icmp4 => write!(f, "icmp"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp6 => write!(f, "icmp6"),
        }
    }
}

/// The immutable 5-tuple identifying one flow across the tunnel.
///
/// Equality and hashing are structural; this is the primary key for tunnel streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    protocol: Protocol,
    source: SocketAddr,
    destination: SocketAddr,
}

impl ConnectionId {
    pub fn new(protocol: Protocol, source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            protocol,
            source,
            destination,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// The id a peer would use for traffic flowing the other way.
    pub fn reply(&self) -> Self {
        Self {
            protocol: self.protocol,
            source: self.destination,
            destination: self.source,
        }
    }

    /// Compact wire form: protocol, address family, source ip + port, destination ip + port.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + 2 * 18);
        buf.push(self.protocol as u8);

        match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                buf.push(4);
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&self.source.port().to_be_bytes());
                buf.extend_from_slice(&dst.octets());
                buf.extend_from_slice(&self.destination.port().to_be_bytes());
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                buf.push(6);
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&self.source.port().to_be_bytes());
                buf.extend_from_slice(&dst.octets());
                buf.extend_from_slice(&self.destination.port().to_be_bytes());
            }
            (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
                unreachable!("source and destination always share an address family")
            }
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (&protocol, rest) = buf.split_first().context("Connection id too short")?;
        let protocol = Protocol::from_wire(protocol)?;
        let (&family, rest) = rest.split_first().context("Connection id too short")?;

        let (source, destination) = match family {
            4 => {
                anyhow::ensure!(rest.len() == 12, "Bad IPv4 connection id length");
                (decode_v4(&rest[..6]), decode_v4(&rest[6..]))
            }
            6 => {
                anyhow::ensure!(rest.len() == 36, "Bad IPv6 connection id length");
                (decode_v6(&rest[..18]), decode_v6(&rest[18..]))
            }
            other => bail!("Unknown address family {other}"),
        };

        Ok(Self {
            protocol,
            source,
            destination,
        })
    }
}

fn decode_v4(buf: &[u8]) -> SocketAddr {
    let mut ip = [0u8; 4];
    ip.copy_from_slice(&buf[..4]);
    let port = u16::from_be_bytes([buf[4], buf[5]]);

    SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)
}

fn decode_v6(buf: &[u8]) -> SocketAddr {
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&buf[..16]);
    let port = u16::from_be_bytes([buf[16], buf[17]]);

    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.protocol, self.source, self.destination
        )
    }
}

/// A manager-issued session: opaque identifier plus expiry.
///
/// Created on the first successful handshake, refreshed by keep-alives and
/// invalidated on disconnect or when the manager reports it unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub expires_at: SystemTime,
}

impl Session {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How long a session is valid without a successful `Remain`.
pub const SESSION_TTL: Duration = Duration::from_secs(300);

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_id() -> ConnectionId {
        ConnectionId::new(
            Protocol::Tcp,
            "10.11.12.13:51234".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
    }

    #[test]
    fn reply_swaps_ends() {
        let id = tcp_id();
        let reply = id.reply();

        assert_eq!(reply.source(), id.destination());
        assert_eq!(reply.destination(), id.source());
        assert_eq!(reply.reply(), id);
    }

    #[test]
    fn connection_id_round_trips() {
        for id in [
            tcp_id(),
            ConnectionId::new(
                Protocol::Udp,
                "[fd00::1]:5353".parse().unwrap(),
                "[fd00::2]:53".parse().unwrap(),
            ),
        ] {
            let decoded = ConnectionId::decode(&id.encode()).unwrap();

            assert_eq!(decoded, id);
        }
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(tcp_id().to_string(), "tcp 10.11.12.13:51234 -> 10.0.0.2:80");
    }
}
