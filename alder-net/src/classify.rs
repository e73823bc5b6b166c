//! Non-public and trusted-proxy address classification.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::warn;

use crate::cidr::Cidr;

/// Address ranges that are never routable public addresses.
static NON_PUBLIC: Lazy<Vec<Cidr>> = Lazy::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "fd00::/8",
        "127.0.0.0/8",
        "::1/128",
        "169.254.0.0/16",
        "fe80::/10",
        "0.0.0.0/8",
        "::/128",
    ]
    .iter()
    .map(|spec| spec.parse().unwrap_or_else(|e| panic!("builtin CIDR {spec}: {e}")))
    .collect()
});

/// Trusted reverse-proxy ranges, set once from configuration.
static TRUSTED_PROXIES: Lazy<RwLock<Vec<Cidr>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Install the trusted-proxy table from configured CIDR specs.
///
/// Invalid entries are logged and skipped; returns the number installed.
pub fn set_trusted_proxies<S: AsRef<str>>(specs: &[S]) -> usize {
    let mut table = Vec::with_capacity(specs.len());
    for spec in specs {
        match spec.as_ref().parse::<Cidr>() {
            Ok(cidr) => table.push(cidr),
            Err(e) => warn!(spec = spec.as_ref(), error = %e, "skipping bad trusted-proxy entry"),
        }
    }
    let count = table.len();
    *TRUSTED_PROXIES.write() = table;
    count
}

/// True iff the address matches none of the non-public ranges.
pub fn public_ip(addr: IpAddr) -> bool {
    !NON_PUBLIC.iter().any(|cidr| cidr.matches(addr))
}

/// True iff the address matches a configured trusted-proxy range.
pub fn trusted_reverse_proxy(addr: IpAddr) -> bool {
    TRUSTED_PROXIES.read().iter().any(|cidr| cidr.matches(addr))
}
