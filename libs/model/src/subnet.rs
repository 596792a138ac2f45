use ip_network::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// One authoritative snapshot of the cluster's subnet and DNS configuration.
///
/// Snapshots replace each other wholesale; the router reconciles the host
/// routing table against the latest one it has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSnapshot {
    /// CIDRs the cluster announces as routable to pods and services.
    pub cluster_subnets: Vec<IpNetwork>,
    /// User override: always routed via the VIF.
    pub also_proxy: Vec<IpNetwork>,
    /// User override: never routed via the VIF.
    pub never_proxy: Vec<IpNetwork>,
    /// Subnets for which the VIF wins even when a host route overlaps.
    pub allow_conflict: Vec<IpNetwork>,

    pub dns: DnsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Addresses of the cluster-side resolver; queries to these are intercepted.
    pub remote_addrs: Vec<IpAddr>,
    /// Name suffixes that must be resolved in the cluster.
    pub include_suffixes: Vec<String>,
    /// Name suffixes that must never be resolved in the cluster.
    pub exclude_suffixes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serialises_to_json() {
        let snapshot = SubnetSnapshot {
            cluster_subnets: vec!["10.0.0.0/16".parse().unwrap()],
            never_proxy: vec!["10.0.5.0/24".parse().unwrap()],
            dns: DnsConfig {
                remote_addrs: vec!["10.96.0.10".parse().unwrap()],
                include_suffixes: vec!["cluster.local".to_owned()],
                ..Default::default()
            },
            ..Default::default()
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SubnetSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(back, snapshot);
    }
}
