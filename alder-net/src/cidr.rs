//! Bitwise operations over IPv4 and IPv6 addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{NetError, NetResult};

/// Bitwise-AND an address with a mask of the same family.
///
/// A family mismatch leaves the address unchanged; matching code treats
/// mixed families as a non-match anyway.
pub fn mask(addr: IpAddr, mask: IpAddr) -> IpAddr {
    match (addr, mask) {
        (IpAddr::V4(a), IpAddr::V4(m)) => {
            IpAddr::V4(Ipv4Addr::from(u32::from(a) & u32::from(m)))
        }
        (IpAddr::V6(a), IpAddr::V6(m)) => {
            IpAddr::V6(Ipv6Addr::from(u128::from(a) & u128::from(m)))
        }
        _ => addr,
    }
}

/// Family match plus bitwise equality.
pub fn same_ip(a: IpAddr, b: IpAddr) -> bool {
    a == b
}

/// Test `(addr & mask) == masked`. Mixed families never match.
pub fn masked_match(addr: IpAddr, netmask: IpAddr, masked: IpAddr) -> bool {
    match (addr, netmask, masked) {
        (IpAddr::V4(a), IpAddr::V4(m), IpAddr::V4(expect)) => {
            u32::from(a) & u32::from(m) == u32::from(expect)
        }
        (IpAddr::V6(a), IpAddr::V6(m), IpAddr::V6(expect)) => {
            u128::from(a) & u128::from(m) == u128::from(expect)
        }
        _ => false,
    }
}

/// Build a mask with `bits` leading 1-bits in the family of `family_of`.
/// Lengths past the family width are clamped.
pub fn mask_bits(family_of: IpAddr, bits: u32) -> IpAddr {
    match family_of {
        IpAddr::V4(_) => {
            let bits = bits.min(32);
            let value = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            IpAddr::V4(Ipv4Addr::from(value))
        }
        IpAddr::V6(_) => {
            let bits = bits.min(128);
            let value = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            IpAddr::V6(Ipv6Addr::from(value))
        }
    }
}

/// An address plus netmask, with the address canonicalized by the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub mask: IpAddr,
    pub bits: u32,
}

impl Cidr {
    pub fn matches(&self, ip: IpAddr) -> bool {
        masked_match(ip, self.mask, self.addr)
    }
}

impl std::str::FromStr for Cidr {
    type Err = NetError;

    fn from_str(s: &str) -> NetResult<Self> {
        parse_ip_mask(s)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.bits)
    }
}

/// Parse `addr`, `addr/prefix` or `addr/dotted-mask`.
///
/// A bare address implies a full host mask. The returned address is
/// canonicalized with `addr & mask`.
pub fn parse_ip_mask(spec: &str) -> NetResult<Cidr> {
    let spec = spec.trim();
    let (addr_part, mask_part) = match spec.split_once('/') {
        Some((a, m)) => (a, Some(m)),
        None => (spec, None),
    };

    let addr: IpAddr = addr_part
        .parse()
        .map_err(|_| NetError::InvalidAddress(addr_part.to_string()))?;
    let family_bits = match addr {
        IpAddr::V4(_) => 32u32,
        IpAddr::V6(_) => 128u32,
    };

    let netmask = match mask_part {
        None => mask_bits(addr, family_bits),
        Some(m) => {
            if let Ok(prefix) = m.parse::<u32>() {
                if prefix > family_bits {
                    return Err(NetError::PrefixTooLong {
                        got: prefix,
                        max: family_bits,
                    });
                }
                mask_bits(addr, prefix)
            } else {
                let parsed: IpAddr = m.parse().map_err(|_| NetError::InvalidMask(m.to_string()))?;
                match (addr, parsed) {
                    (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => parsed,
                    _ => return Err(NetError::FamilyMismatch),
                }
            }
        }
    };

    let bits = leading_ones(netmask);
    Ok(Cidr {
        addr: mask(addr, netmask),
        mask: netmask,
        bits,
    })
}

fn leading_ones(netmask: IpAddr) -> u32 {
    match netmask {
        IpAddr::V4(m) => u32::from(m).leading_ones(),
        IpAddr::V6(m) => u128::from(m).leading_ones(),
    }
}
