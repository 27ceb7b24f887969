//! Exclusion filter.
//!
//! Addresses inside any configured range are exempt from tracking: they are
//! never recorded, counted or audited. Ranges may be IPv4 or IPv6; a bare
//! address is a single-host range.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// Malformed address or range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid network range: {0:?}")]
    InvalidRange(String),
}

/// Parse a single source address.
///
/// Surrounding whitespace is ignored. Anything with a prefix length is
/// rejected: events carry hosts, not networks. IPv4-mapped IPv6 addresses
/// are normalized to IPv4 so `::ffff:10.0.0.1` and `10.0.0.1` share a record.
pub fn parse_address(raw: &str) -> Result<IpAddr, AddressError> {
    let ip: IpAddr = raw
        .trim()
        .parse()
        .map_err(|_| AddressError::InvalidAddress(raw.to_string()))?;

    Ok(match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    })
}

/// Immutable set of exempt network ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    nets: Vec<IpNet>,
}

impl ExclusionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(nets: Vec<IpNet>) -> Self {
        Self {
            nets: nets.into_iter().map(|n| n.trunc()).collect(),
        }
    }

    /// Parse and add an address (`10.0.0.1`) or range (`10.0.0.0/8`).
    pub fn add_str(&mut self, entry: &str) -> Result<(), AddressError> {
        let entry = entry.trim();
        let net = if entry.contains('/') {
            entry
                .parse::<IpNet>()
                .map_err(|_| AddressError::InvalidRange(entry.to_string()))?
        } else {
            let ip = parse_address(entry)?;
            let host_prefix = if ip.is_ipv4() { 32 } else { 128 };
            IpNet::new(ip, host_prefix).map_err(|_| AddressError::InvalidRange(entry.to_string()))?
        };
        self.nets.push(net.trunc());
        Ok(())
    }

    /// True if `ip` falls inside any configured range.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn ranges(&self) -> &[IpNet] {
        &self.nets
    }
}

/// Decide whether a raw address string is exempt.
pub fn is_excluded(ip: &str, exclusions: &ExclusionSet) -> Result<bool, AddressError> {
    Ok(exclusions.contains(parse_address(ip)?))
}
