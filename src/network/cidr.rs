//! IPv4 network arithmetic
//!
//! Every address handed to the host is computed from a typed `Ipv4Net`
//! (base address, prefix length) and checked for membership in its parent
//! network. Nothing here ever builds an address by editing another
//! address string.

use crate::error::Violation;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Parse CIDR text into a network
///
/// Rejects IPv6, malformed text, missing prefix lengths and host bits set
/// past the prefix (the canonical network is reported as the expected value).
pub fn parse_network(text: &str) -> Result<Ipv4Net, Violation> {
    let trimmed = text.trim();

    if !trimmed.contains('/') {
        return Err(Violation::invalid_cidr(
            text,
            "missing prefix length (expected <address>/<0-32>)",
        ));
    }

    if trimmed.contains(':') {
        return Err(Violation::invalid_cidr(text, "IPv6 networks are not supported"));
    }

    let net: Ipv4Net = trimmed
        .parse()
        .map_err(|e| Violation::invalid_cidr(text, format!("{}", e)))?;

    let canonical = net.trunc();
    if canonical != net {
        return Err(Violation::invalid_cidr(
            text,
            format!("host bits set (expected {}, got {})", canonical, net),
        ));
    }

    Ok(net)
}

/// Number of usable host addresses in a network
///
/// Network and broadcast addresses are excluded, so /31 and /32 have none.
pub fn usable_hosts(net: &Ipv4Net) -> u32 {
    match net.prefix_len() {
        31 | 32 => 0,
        prefix => ((1u64 << (32 - prefix)) - 2) as u32,
    }
}

/// Gateway address: the first usable host address of the network
pub fn gateway_address(net: &Ipv4Net) -> Result<Ipv4Addr, Violation> {
    if usable_hosts(net) == 0 {
        return Err(Violation::invalid_cidr(
            net.to_string(),
            format!(
                "no usable host address for a gateway (expected prefix length <= 30, got {})",
                net.prefix_len()
            ),
        ));
    }
    host_address(net, 0).map_err(|_| {
        Violation::invalid_cidr(net.to_string(), "no usable host address for a gateway")
    })
}

/// The `offset`-th usable host address (0-based)
///
/// Never yields the network or broadcast address.
pub fn host_address(net: &Ipv4Net, offset: u32) -> Result<Ipv4Addr, Violation> {
    let usable = usable_hosts(net);
    if offset >= usable {
        return Err(Violation::AddressOutOfRange {
            network: *net,
            offset,
            usable,
        });
    }

    let base = u32::from(net.network());
    let addr = Ipv4Addr::from(base + 1 + offset);

    // Membership check before anything leaves this module
    if !net.contains(&addr) || addr == net.network() || addr == net.broadcast() {
        return Err(Violation::AddressOutOfRange {
            network: *net,
            offset,
            usable,
        });
    }

    Ok(addr)
}

/// True iff every address of `inner` is inside `outer`
pub fn contains(outer: &Ipv4Net, inner: &Ipv4Net) -> bool {
    outer.network() <= inner.network() && inner.broadcast() <= outer.broadcast()
}

/// True iff the two ranges share at least one address
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.network() <= b.broadcast() && b.network() <= a.broadcast()
}
