//! Candidate address selection.
//!
//! A peer only offers addresses the other side can dial directly: relay
//! circuits are never offered (dialing one again would not bypass the relay)
//! and private ranges are dropped unless explicitly allowed.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use multiaddr::{Multiaddr, Protocol};

/// Returns true if the address routes through a relay circuit.
pub fn is_relay_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// First IP component of the address, if any.
pub fn ip_of(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

/// Returns true for addresses not reachable from outside the local network.
///
/// Addresses without an IP component (DNS names) are considered public.
pub fn is_private_addr(addr: &Multiaddr) -> bool {
    match ip_of(addr) {
        Some(IpAddr::V4(ip)) => is_private_v4(ip),
        Some(IpAddr::V6(ip)) => is_private_v6(ip),
        None => false,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private()           // 10.x, 172.16-31.x, 192.168.x
        || ip.is_loopback()   // 127.x
        || ip.is_link_local() // 169.254.x
        || ip.is_broadcast()
        || ip.is_unspecified()
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64) // 100.64/10 carrier-grade NAT
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    ip.is_loopback()
        || ip.is_unspecified()
        || (ip.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7 unique local
        || (ip.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10 link-local
}

/// Selects which addresses are offered to, and dialed from, a peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressFilter {
    allow_private: bool,
}

impl AddressFilter {
    pub fn new(allow_private: bool) -> Self {
        Self { allow_private }
    }

    pub fn allows_private(&self) -> bool {
        self.allow_private
    }

    pub fn is_candidate(&self, addr: &Multiaddr) -> bool {
        if is_relay_addr(addr) {
            return false;
        }
        self.allow_private || !is_private_addr(addr)
    }

    /// Filters and de-duplicates, preserving first-seen order.
    pub fn filter_candidates<'a, I>(&self, addrs: I) -> Vec<Multiaddr>
    where
        I: IntoIterator<Item = &'a Multiaddr>,
    {
        let mut seen = HashSet::new();
        addrs
            .into_iter()
            .filter(|a| self.is_candidate(a))
            .filter(|a| seen.insert((*a).clone()))
            .cloned()
            .collect()
    }
}
