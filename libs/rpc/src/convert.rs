//! Conversions between wire types and the shared data model.

use crate::manager;
use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use telepresence_model::{
    DnsConfig, HeaderMatch, HeaderValue, InterceptRuntime, InterceptSpec, Session, SessionId,
    SubnetSnapshot,
};

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("ip address must be 4 or 16 bytes, got {0}")]
    BadAddressLength(usize),
    #[error("invalid subnet prefix {prefix} for {ip}")]
    BadPrefix { ip: IpAddr, prefix: u32 },
    #[error("port {0} does not fit into u16")]
    BadPort(u32),
    #[error("missing required field {0}")]
    MissingField(&'static str),
}

pub fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

pub fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr, ConvertError> {
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);

            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);

            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => Err(ConvertError::BadAddressLength(other)),
    }
}

pub fn subnet_to_proto(net: IpNetwork) -> manager::Subnet {
    manager::Subnet {
        ip: ip_to_bytes(net.network_address()),
        prefix: u32::from(net.netmask()),
    }
}

pub fn subnet_from_proto(proto: &manager::Subnet) -> Result<IpNetwork, ConvertError> {
    let ip = ip_from_bytes(&proto.ip)?;
    let bad_prefix = || ConvertError::BadPrefix {
        ip,
        prefix: proto.prefix,
    };
    let prefix = u8::try_from(proto.prefix).map_err(|_| bad_prefix())?;

    let network = match ip {
        IpAddr::V4(ip) => {
            IpNetwork::V4(Ipv4Network::new(ip, prefix).map_err(|_| bad_prefix())?)
        }
        IpAddr::V6(ip) => {
            IpNetwork::V6(Ipv6Network::new(ip, prefix).map_err(|_| bad_prefix())?)
        }
    };

    Ok(network)
}

fn subnets_from_proto(protos: &[manager::Subnet]) -> Result<Vec<IpNetwork>, ConvertError> {
    protos.iter().map(subnet_from_proto).collect()
}

impl TryFrom<manager::ClusterInfo> for SubnetSnapshot {
    type Error = ConvertError;

    fn try_from(info: manager::ClusterInfo) -> Result<Self, Self::Error> {
        let dns = info.dns.unwrap_or_default();

        Ok(SubnetSnapshot {
            cluster_subnets: subnets_from_proto(&info.cluster_subnets)?,
            also_proxy: subnets_from_proto(&info.also_proxy)?,
            never_proxy: subnets_from_proto(&info.never_proxy)?,
            allow_conflict: subnets_from_proto(&info.allow_conflict)?,
            dns: DnsConfig {
                remote_addrs: dns
                    .remote_addrs
                    .iter()
                    .map(|addr| ip_from_bytes(addr))
                    .collect::<Result<_, _>>()?,
                include_suffixes: dns.include_suffixes,
                exclude_suffixes: dns.exclude_suffixes,
            },
        })
    }
}

impl From<&SubnetSnapshot> for manager::ClusterInfo {
    fn from(snapshot: &SubnetSnapshot) -> Self {
        manager::ClusterInfo {
            cluster_subnets: snapshot
                .cluster_subnets
                .iter()
                .copied()
                .map(subnet_to_proto)
                .collect(),
            also_proxy: snapshot
                .also_proxy
                .iter()
                .copied()
                .map(subnet_to_proto)
                .collect(),
            never_proxy: snapshot
                .never_proxy
                .iter()
                .copied()
                .map(subnet_to_proto)
                .collect(),
            allow_conflict: snapshot
                .allow_conflict
                .iter()
                .copied()
                .map(subnet_to_proto)
                .collect(),
            dns: Some(manager::DnsConfig {
                remote_addrs: snapshot
                    .dns
                    .remote_addrs
                    .iter()
                    .copied()
                    .map(ip_to_bytes)
                    .collect(),
                include_suffixes: snapshot.dns.include_suffixes.clone(),
                exclude_suffixes: snapshot.dns.exclude_suffixes.clone(),
            }),
        }
    }
}

impl TryFrom<manager::SessionInfo> for Session {
    type Error = ConvertError;

    fn try_from(info: manager::SessionInfo) -> Result<Self, Self::Error> {
        Ok(Session {
            id: SessionId::new(info.session_id),
            expires_at: UNIX_EPOCH + Duration::from_secs(info.expires_at.max(0) as u64),
        })
    }
}

impl From<&Session> for manager::SessionInfo {
    fn from(session: &Session) -> Self {
        let expires_at = session
            .expires_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        manager::SessionInfo {
            session_id: session.id.as_str().to_owned(),
            expires_at,
        }
    }
}

pub fn intercept_spec_to_proto(spec: &InterceptSpec) -> manager::InterceptSpec {
    let (mechanism, headers) = match &spec.mechanism {
        telepresence_model::Mechanism::Tcp => ("tcp".to_owned(), Vec::new()),
        telepresence_model::Mechanism::HttpHeader(matches) => (
            "http-header".to_owned(),
            matches
                .iter()
                .map(|m| manager::HeaderMatch {
                    key: m.key.clone(),
                    value: match &m.value {
                        HeaderValue::Exact(value) | HeaderValue::Regex(value) => value.clone(),
                    },
                    is_regex: matches!(m.value, HeaderValue::Regex(_)),
                })
                .collect(),
        ),
    };

    manager::InterceptSpec {
        name: spec.id.name.clone(),
        workload: spec.id.workload.clone(),
        namespace: spec.id.namespace.clone(),
        mechanism,
        headers,
        target_port: u32::from(spec.target_port),
        replace: spec.replace,
    }
}

pub fn header_matches_from_proto(protos: &[manager::HeaderMatch]) -> Vec<HeaderMatch> {
    protos
        .iter()
        .map(|proto| HeaderMatch {
            key: proto.key.clone(),
            value: if proto.is_regex {
                HeaderValue::Regex(proto.value.clone())
            } else {
                HeaderValue::Exact(proto.value.clone())
            },
        })
        .collect()
}

pub fn runtime_from_info(info: &manager::InterceptInfo) -> Result<InterceptRuntime, ConvertError> {
    let agent_pod_ip = if info.agent_pod_ip.is_empty() {
        None
    } else {
        Some(ip_from_bytes(&info.agent_pod_ip)?)
    };
    let sftp_port = match info.sftp_port {
        0 => None,
        port => Some(u16::try_from(port).map_err(|_| ConvertError::BadPort(port))?),
    };

    Ok(InterceptRuntime {
        agent_pod_ip,
        sftp_port,
        mount_point: None,
        environment: BTreeMap::from_iter(info.environment.clone()),
        original_replicas: (info.original_replicas != 0).then_some(info.original_replicas),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_round_trips() {
        for subnet in ["10.0.0.0/16", "fd00:dead::/48"] {
            let network: IpNetwork = subnet.parse().unwrap();

            let back = subnet_from_proto(&subnet_to_proto(network)).unwrap();

            assert_eq!(back, network);
        }
    }

    #[test]
    fn rejects_bad_address_length() {
        let proto = manager::Subnet {
            ip: vec![1, 2, 3],
            prefix: 24,
        };

        assert!(subnet_from_proto(&proto).is_err());
    }

    #[test]
    fn session_round_trips() {
        let session = Session {
            id: SessionId::new("sess-1"),
            expires_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        };

        let back = Session::try_from(manager::SessionInfo::from(&session)).unwrap();

        assert_eq!(back, session);
    }
}
