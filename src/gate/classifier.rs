//! Visitor address classification
//!
//! Decides whether an address is subject to gating at all. Anything that is
//! not a routable public address (private ranges, loopback, documentation
//! blocks, multicast, garbage input) is exempt.

use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpClass {
    /// Private, reserved, or unparseable; never gated
    Internal,
    /// Globally routable address
    Public(IpAddr),
}

impl IpClass {
    pub fn is_internal(&self) -> bool {
        matches!(self, IpClass::Internal)
    }
}

const RESERVED_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 88, 99, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(224, 0, 0, 0), 4),
    (Ipv4Addr::new(240, 0, 0, 0), 4),
];

const RESERVED_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::UNSPECIFIED, 128),
    (Ipv6Addr::LOCALHOST, 128),
    (Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0), 96),
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64),
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 23),
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0), 16),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::new(0xfec0, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),
];

static RESERVED_V4_NETS: LazyLock<Vec<Ipv4Net>> = LazyLock::new(|| {
    RESERVED_V4
        .iter()
        .filter_map(|(addr, prefix)| Ipv4Net::new(*addr, *prefix).ok())
        .collect()
});

static RESERVED_V6_NETS: LazyLock<Vec<Ipv6Net>> = LazyLock::new(|| {
    RESERVED_V6
        .iter()
        .filter_map(|(addr, prefix)| Ipv6Net::new(*addr, *prefix).ok())
        .collect()
});

/// Classify a raw address literal. Input that does not parse as IPv4 or IPv6
/// is `Internal`.
pub fn classify(ip: &str) -> IpClass {
    match ip.trim().parse::<IpAddr>() {
        Ok(addr) => classify_addr(addr),
        Err(_) => IpClass::Internal,
    }
}

pub fn classify_addr(ip: IpAddr) -> IpClass {
    let reserved = match ip {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            // ::ffff:a.b.c.d follows the rules of the embedded address
            Some(v4) => is_reserved_v4(v4),
            None => is_reserved_v6(v6),
        },
    };

    if reserved {
        IpClass::Internal
    } else {
        IpClass::Public(ip)
    }
}

fn is_reserved_v4(ip: Ipv4Addr) -> bool {
    RESERVED_V4_NETS.iter().any(|net| net.contains(&ip))
}

fn is_reserved_v6(ip: Ipv6Addr) -> bool {
    RESERVED_V6_NETS.iter().any(|net| net.contains(&ip))
}
