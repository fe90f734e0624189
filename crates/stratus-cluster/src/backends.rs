//! Load balancer backend selection for control plane members
//!
//! Every member contributes at most one address. With VPC backends enabled
//! the first internal address outside the private network range wins, and
//! the first one inside it is the fallback; otherwise only the private
//! network address is used. Taking the first match is arbitrary: a member
//! with several VPC interfaces is reached through whichever the cloud
//! listed first.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use stratus_common::crd::{ClusterNetwork, MachineAddress, MachineAddressType};

/// Private network range instances get their private addresses from
const PRIVATE_NETWORK: (Ipv4Addr, u32) = (Ipv4Addr::new(192, 168, 128, 0), 17);

/// One backend: a member address on one load balancer port
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackendTarget {
    /// Name of the member the address belongs to
    pub member: String,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl BackendTarget {
    /// "ip:port", the form the load balancer reports nodes in
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A control plane member and its published addresses
#[derive(Clone, Copy, Debug)]
pub struct Member<'a> {
    pub name: &'a str,
    pub addresses: &'a [MachineAddress],
}

fn in_private_network(ip: Ipv4Addr) -> bool {
    let (base, prefix) = PRIVATE_NETWORK;
    let mask = u32::MAX << (32 - prefix);
    u32::from(ip) & mask == u32::from(base) & mask
}

fn internal_ips<'a>(addresses: &'a [MachineAddress]) -> impl Iterator<Item = Ipv4Addr> + 'a {
    addresses
        .iter()
        .filter(|a| a.type_ == MachineAddressType::InternalIP)
        .filter_map(|a| a.address.parse::<Ipv4Addr>().ok())
}

/// The address a member is reached at, if any qualifies
pub fn select_address(addresses: &[MachineAddress], use_vpc: bool) -> Option<Ipv4Addr> {
    let overlay = if use_vpc {
        internal_ips(addresses).find(|ip| !in_private_network(*ip))
    } else {
        None
    };
    overlay.or_else(|| internal_ips(addresses).find(|ip| in_private_network(*ip)))
}

/// Ports every member is registered on: the API server port first, then the
/// additional ports in declared order
pub fn backend_ports(network: &ClusterNetwork) -> Vec<u16> {
    std::iter::once(network.api_server_port())
        .chain(network.additional_ports.iter().map(|p| p.port))
        .collect()
}

/// Backends for `members`, in member order and without duplicates
pub fn select_targets(members: &[Member<'_>], network: &ClusterNetwork) -> Vec<BackendTarget> {
    let ports = backend_ports(network);
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for member in members {
        let Some(address) = select_address(member.addresses, network.use_vpc_backends) else {
            continue;
        };
        for &port in &ports {
            if seen.insert((address, port)) {
                targets.push(BackendTarget {
                    member: member.name.to_string(),
                    address,
                    port,
                });
            }
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use stratus_common::crd::LoadBalancerPort;

    fn network(use_vpc: bool, extra: &[u16]) -> ClusterNetwork {
        ClusterNetwork {
            use_vpc_backends: use_vpc,
            additional_ports: extra
                .iter()
                .map(|&port| LoadBalancerPort {
                    port,
                    config_id: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("192.168.128.1", true)]
    #[case("192.168.255.254", true)]
    #[case("192.168.127.255", false)]
    #[case("10.0.0.5", false)]
    fn private_network_membership(#[case] ip: &str, #[case] inside: bool) {
        assert_eq!(in_private_network(ip.parse().unwrap()), inside);
    }

    #[test]
    fn story_vpc_address_preferred_on_every_port() {
        let addresses = vec![
            MachineAddress::external("172.232.0.10"),
            MachineAddress::internal("10.0.0.5"),
            MachineAddress::internal("192.168.128.9"),
        ];
        let members = [Member {
            name: "cp-0",
            addresses: &addresses,
        }];

        let targets = select_targets(&members, &network(true, &[8080]));
        let endpoints: Vec<_> = targets.iter().map(BackendTarget::endpoint).collect();
        assert_eq!(endpoints, vec!["10.0.0.5:6443", "10.0.0.5:8080"]);
    }

    #[test]
    fn story_private_address_used_without_vpc_backends() {
        let addresses = vec![
            MachineAddress::internal("10.0.0.5"),
            MachineAddress::internal("192.168.128.9"),
        ];
        let members = [Member {
            name: "cp-0",
            addresses: &addresses,
        }];
        let targets = select_targets(&members, &network(false, &[]));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].endpoint(), "192.168.128.9:6443");
    }

    #[test]
    fn story_private_address_is_the_vpc_fallback() {
        let addresses = vec![MachineAddress::internal("192.168.130.4")];
        assert_eq!(
            select_address(&addresses, true),
            Some(Ipv4Addr::new(192, 168, 130, 4))
        );
    }

    #[test]
    fn story_first_match_wins() {
        let addresses = vec![
            MachineAddress::internal("10.0.0.5"),
            MachineAddress::internal("10.0.1.5"),
        ];
        assert_eq!(
            select_address(&addresses, true),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
    }

    #[test]
    fn story_members_without_addresses_contribute_nothing() {
        let public_only = vec![MachineAddress::external("172.232.0.10")];
        let none: Vec<MachineAddress> = vec![];
        let good = vec![MachineAddress::internal("192.168.128.2")];
        let members = [
            Member {
                name: "public",
                addresses: &public_only,
            },
            Member {
                name: "pending",
                addresses: &none,
            },
            Member {
                name: "cp-2",
                addresses: &good,
            },
        ];
        let targets = select_targets(&members, &network(true, &[]));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].member, "cp-2");
    }

    #[test]
    fn story_duplicate_addresses_are_dropped_in_order() {
        let shared = vec![MachineAddress::internal("192.168.128.2")];
        let other = vec![MachineAddress::internal("192.168.128.3")];
        let members = [
            Member {
                name: "a",
                addresses: &shared,
            },
            Member {
                name: "b",
                addresses: &other,
            },
            Member {
                name: "a-again",
                addresses: &shared,
            },
        ];
        let targets = select_targets(&members, &network(false, &[6443]));
        let endpoints: Vec<_> = targets.iter().map(|t| t.to_string()).collect();
        assert_eq!(endpoints, vec!["192.168.128.2:6443", "192.168.128.3:6443"]);
    }
}
