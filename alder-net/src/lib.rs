//! Address utilities: family-agnostic masking, CIDR parsing and matching,
//! and classification of non-public and trusted-proxy addresses.

mod cidr;
mod classify;

pub use cidr::{mask, mask_bits, masked_match, parse_ip_mask, same_ip, Cidr};
pub use classify::{public_ip, set_trusted_proxies, trusted_reverse_proxy};

use thiserror::Error;

/// Result type for address parsing.
pub type NetResult<T> = Result<T, NetError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("invalid mask {0:?}")]
    InvalidMask(String),

    #[error("prefix length {got} exceeds {max} bits")]
    PrefixTooLong { got: u32, max: u32 },

    #[error("address and mask families differ")]
    FamilyMismatch,
}
