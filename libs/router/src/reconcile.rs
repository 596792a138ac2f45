//! Pure route-set computation: which subnets should be reachable through the
//! virtual interface for a given snapshot.

use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};
use std::collections::HashSet;
use telepresence_model::SubnetSnapshot;

/// The set of routes the host table should carry for `snapshot`:
/// `(cluster_subnets ∪ also_proxy) − never_proxy`, with the subtraction
/// producing a minimal covering set of CIDRs.
pub fn desired_routes(snapshot: &SubnetSnapshot) -> HashSet<IpNetwork> {
    let mut desired = HashSet::new();

    for subnet in snapshot
        .cluster_subnets
        .iter()
        .chain(snapshot.also_proxy.iter())
    {
        match subnet {
            IpNetwork::V4(subnet) => {
                let excludes: Vec<Ipv4Network> = snapshot
                    .never_proxy
                    .iter()
                    .filter_map(|never| match never {
                        IpNetwork::V4(never) => Some(*never),
                        IpNetwork::V6(_) => None,
                    })
                    .collect();

                desired.extend(subtract_v4(*subnet, &excludes).into_iter().map(IpNetwork::V4));
            }
            IpNetwork::V6(subnet) => {
                let excludes: Vec<Ipv6Network> = snapshot
                    .never_proxy
                    .iter()
                    .filter_map(|never| match never {
                        IpNetwork::V6(never) => Some(*never),
                        IpNetwork::V4(_) => None,
                    })
                    .collect();

                desired.extend(subtract_v6(*subnet, &excludes).into_iter().map(IpNetwork::V6));
            }
        }
    }

    desired
}

fn v4_range(net: Ipv4Network) -> (u32, u32) {
    let start = u32::from(net.network_address());
    let size = match net.netmask() {
        0 => u32::MAX,
        prefix => (1u32 << (32 - prefix)) - 1,
    };

    (start, start | size)
}

fn v6_range(net: Ipv6Network) -> (u128, u128) {
    let start = u128::from(net.network_address());
    let size = match net.netmask() {
        0 => u128::MAX,
        prefix => (1u128 << (128 - prefix)) - 1,
    };

    (start, start | size)
}

fn subtract_v4(net: Ipv4Network, excludes: &[Ipv4Network]) -> Vec<Ipv4Network> {
    let (start, end) = v4_range(net);

    let relevant: Vec<Ipv4Network> = excludes
        .iter()
        .copied()
        .filter(|exclude| {
            let (ex_start, ex_end) = v4_range(*exclude);

            ex_start <= end && ex_end >= start
        })
        .collect();

    if relevant.is_empty() {
        return vec![net];
    }

    if relevant.iter().any(|exclude| {
        let (ex_start, ex_end) = v4_range(*exclude);

        ex_start <= start && ex_end >= end
    }) {
        return Vec::new();
    }

    // Some excluded range lies strictly inside: split in half and recurse.
    let half_prefix = net.netmask() + 1;
    let lower = Ipv4Network::new(net.network_address(), half_prefix)
        .expect("halving a network keeps the prefix valid");
    let upper_start = start + (1u32 << (32 - half_prefix));
    let upper = Ipv4Network::new(upper_start.into(), half_prefix)
        .expect("the upper half starts on its own network boundary");

    let mut cover = subtract_v4(lower, &relevant);
    cover.extend(subtract_v4(upper, &relevant));

    cover
}

fn subtract_v6(net: Ipv6Network, excludes: &[Ipv6Network]) -> Vec<Ipv6Network> {
    let (start, end) = v6_range(net);

    let relevant: Vec<Ipv6Network> = excludes
        .iter()
        .copied()
        .filter(|exclude| {
            let (ex_start, ex_end) = v6_range(*exclude);

            ex_start <= end && ex_end >= start
        })
        .collect();

    if relevant.is_empty() {
        return vec![net];
    }

    if relevant.iter().any(|exclude| {
        let (ex_start, ex_end) = v6_range(*exclude);

        ex_start <= start && ex_end >= end
    }) {
        return Vec::new();
    }

    let half_prefix = net.netmask() + 1;
    let lower = Ipv6Network::new(net.network_address(), half_prefix)
        .expect("halving a network keeps the prefix valid");
    let upper_start = start + (1u128 << (128 - half_prefix));
    let upper = Ipv6Network::new(upper_start.into(), half_prefix)
        .expect("the upper half starts on its own network boundary");

    let mut cover = subtract_v6(lower, &relevant);
    cover.extend(subtract_v6(upper, &relevant));

    cover
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn snapshot(cluster: &[&str], never: &[&str]) -> SubnetSnapshot {
        SubnetSnapshot {
            cluster_subnets: cluster.iter().map(|s| s.parse().unwrap()).collect(),
            never_proxy: never.iter().map(|s| s.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    fn total_v4_addresses(routes: &HashSet<IpNetwork>) -> u64 {
        routes
            .iter()
            .map(|net| match net {
                IpNetwork::V4(net) => 1u64 << (32 - net.netmask()),
                IpNetwork::V6(_) => 0,
            })
            .sum()
    }

    #[test]
    fn no_excludes_keeps_the_subnet_whole() {
        let desired = desired_routes(&snapshot(&["10.0.0.0/16"], &[]));

        assert_eq!(
            desired,
            HashSet::from(["10.0.0.0/16".parse::<IpNetwork>().unwrap()])
        );
    }

    #[test]
    fn never_proxy_is_cut_out_with_a_minimal_cover() {
        let desired = desired_routes(&snapshot(&["10.0.0.0/16"], &["10.0.5.0/24"]));

        // The cover holds everything except the excluded /24.
        assert_eq!(total_v4_addresses(&desired), (1 << 16) - (1 << 8));

        let excluded: IpAddr = "10.0.5.77".parse().unwrap();
        assert!(desired.iter().all(|net| !net.contains(excluded)));

        let kept: IpAddr = "10.0.4.1".parse().unwrap();
        assert!(desired.iter().any(|net| net.contains(kept)));

        // No two routes of the cover overlap.
        for a in &desired {
            for b in &desired {
                if a != b {
                    let IpNetwork::V4(a) = a else { unreachable!() };
                    let IpNetwork::V4(b) = b else { unreachable!() };
                    let (a_start, a_end) = super::v4_range(*a);
                    let (b_start, b_end) = super::v4_range(*b);

                    assert!(a_end < b_start || b_end < a_start, "{a} overlaps {b}");
                }
            }
        }
    }

    #[test]
    fn fully_excluded_subnet_yields_nothing() {
        let desired = desired_routes(&snapshot(&["10.0.5.0/24"], &["10.0.0.0/16"]));

        assert!(desired.is_empty());
    }

    #[test]
    fn also_proxy_is_added_to_the_cover() {
        let desired = desired_routes(&snapshot(&["10.0.0.0/16"], &[]));
        let with_also = desired_routes(&SubnetSnapshot {
            cluster_subnets: vec!["10.0.0.0/16".parse().unwrap()],
            also_proxy: vec!["192.168.7.0/24".parse().unwrap()],
            ..Default::default()
        });

        assert!(with_also.is_superset(&desired));
        assert!(with_also.contains(&"192.168.7.0/24".parse::<IpNetwork>().unwrap()));
    }

    #[test]
    fn ipv6_subnets_are_subtracted_too() {
        let desired = desired_routes(&snapshot(&["fd00::/32"], &["fd00:0:0:5::/64"]));

        let excluded: IpAddr = "fd00:0:0:5::1".parse().unwrap();
        assert!(desired.iter().all(|net| !net.contains(excluded)));

        let kept: IpAddr = "fd00:0:0:4::1".parse().unwrap();
        assert!(desired.iter().any(|net| net.contains(kept)));
    }
}
