//! Multiaddr classification and the published-address filter.

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP layer of a multiaddr, when it has one.
pub fn ip_of(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

/// Relay (circuit) address.
pub fn is_relay(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Loopback IP address.
pub fn is_loopback(addr: &Multiaddr) -> bool {
    ip_of(addr).is_some_and(|ip| ip.is_loopback())
}

/// Unspecified (0.0.0.0 / ::) address.
pub fn is_unspecified(addr: &Multiaddr) -> bool {
    ip_of(addr).is_some_and(|ip| ip.is_unspecified())
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    // fc00::/7 unique-local, fe80::/10 link-local.
    (ip.segments()[0] & 0xfe00) == 0xfc00 || (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// RFC1918 / unique-local / link-local address.
pub fn is_private(addr: &Multiaddr) -> bool {
    match ip_of(addr) {
        Some(IpAddr::V4(ip)) => is_private_v4(ip),
        Some(IpAddr::V6(ip)) => is_private_v6(ip),
        None => false,
    }
}

/// Dialing preference of the transport layer: TCP first, QUIC second.
pub fn transport_rank(addr: &Multiaddr) -> u8 {
    let mut has_quic = false;
    for p in addr.iter() {
        match p {
            Protocol::Tcp(_) => return 0,
            Protocol::QuicV1 | Protocol::Quic => has_quic = true,
            _ => {}
        }
    }
    if has_quic {
        1
    } else {
        2
    }
}

/// Order addresses by transport preference (TCP > QUIC > other), stable
/// within each tier.
pub fn order_by_transport(addrs: &mut [Multiaddr]) {
    addrs.sort_by_key(transport_rank);
}

/// Split addresses into (private, all) where private ⊆ all.
pub fn partition_private(addrs: &[Multiaddr]) -> (Vec<Multiaddr>, Vec<Multiaddr>) {
    let private = addrs.iter().filter(|a| is_private(a)).cloned().collect();
    (private, addrs.to_vec())
}

/// Filter the addresses this node publishes to the network.
///
/// Relay addresses always survive. Loopback and unspecified addresses are
/// dropped. Private addresses are dropped unless the deployment is LAN-like
/// (mDNS on) or `advertise_private_addrs` is set. If filtering would strip
/// everything, the original set is returned so the node never publishes an
/// empty address set.
pub fn filter_advertised_addrs(
    addrs: &[Multiaddr],
    advertise_private: bool,
    lan_like: bool,
) -> Vec<Multiaddr> {
    let keep_private = advertise_private || lan_like;
    let filtered: Vec<Multiaddr> = addrs
        .iter()
        .filter(|a| {
            if is_relay(a) {
                return true;
            }
            if is_loopback(a) || is_unspecified(a) {
                return false;
            }
            if is_private(a) && !keep_private {
                return false;
            }
            true
        })
        .cloned()
        .collect();
    if filtered.is_empty() {
        addrs.to_vec()
    } else {
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn classification() {
        assert!(is_loopback(&ma("/ip4/127.0.0.1/tcp/1")));
        assert!(is_unspecified(&ma("/ip4/0.0.0.0/tcp/1")));
        assert!(is_private(&ma("/ip4/192.168.1.4/tcp/1")));
        assert!(is_private(&ma("/ip4/10.1.2.3/udp/1/quic-v1")));
        assert!(!is_private(&ma("/ip4/203.0.113.9/tcp/1")));
        assert!(is_relay(&ma(
            "/ip4/203.0.113.9/tcp/1/p2p/12D3KooWPjceQrSwdWXPyLLeABRXmuqt69Rg3sBYbU1Nft9HyQ6X/p2p-circuit"
        )));
    }

    #[test]
    fn transport_ordering_prefers_tcp_then_quic() {
        let mut addrs = vec![
            ma("/ip4/10.0.0.1/udp/4001/quic-v1"),
            ma("/ip4/10.0.0.1/tcp/4001"),
            ma("/ip4/10.0.0.1/udp/4001"),
        ];
        order_by_transport(&mut addrs);
        assert_eq!(addrs[0], ma("/ip4/10.0.0.1/tcp/4001"));
        assert_eq!(addrs[1], ma("/ip4/10.0.0.1/udp/4001/quic-v1"));
    }

    #[test]
    fn advertised_filter_drops_loopback_and_private() {
        let addrs = vec![
            ma("/ip4/127.0.0.1/tcp/28683"),
            ma("/ip4/192.168.1.4/tcp/28683"),
            ma("/ip4/203.0.113.9/tcp/28683"),
        ];
        let public = filter_advertised_addrs(&addrs, false, false);
        assert_eq!(public, vec![ma("/ip4/203.0.113.9/tcp/28683")]);

        let lan = filter_advertised_addrs(&addrs, false, true);
        assert!(lan.contains(&ma("/ip4/192.168.1.4/tcp/28683")));
        assert!(!lan.contains(&ma("/ip4/127.0.0.1/tcp/28683")));
    }

    #[test]
    fn advertised_filter_never_returns_empty() {
        let addrs = vec![ma("/ip4/127.0.0.1/tcp/28683")];
        assert_eq!(filter_advertised_addrs(&addrs, false, false), addrs);
    }

    #[test]
    fn relay_addrs_always_survive() {
        let relay = ma(
            "/ip4/192.168.1.4/tcp/1/p2p/12D3KooWPjceQrSwdWXPyLLeABRXmuqt69Rg3sBYbU1Nft9HyQ6X/p2p-circuit",
        );
        let out = filter_advertised_addrs(std::slice::from_ref(&relay), false, false);
        assert_eq!(out, vec![relay]);
    }
}
