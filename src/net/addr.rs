//! Address Literals and Name Resolution

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{anyhow, bail};
use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::Result;

/// Socket family selected from an address literal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Address family requested from a DNS lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

impl From<u8> for IpVersion {
    /// `6` selects IPv6, every other number falls back to IPv4.
    fn from(version: u8) -> Self {
        if version == 6 {
            IpVersion::V6
        } else {
            IpVersion::V4
        }
    }
}

/// Pick the socket family for an address literal.
///
/// Literals without a `.` are IPv6, everything else is IPv4.
pub fn address_family(literal: &str) -> AddressFamily {
    if literal.contains('.') {
        AddressFamily::V4
    } else {
        AddressFamily::V6
    }
}

/// Build a socket address from a numeric address literal and a port
pub fn make_sock_addr(literal: &str, port: u16) -> Result<SocketAddr> {
    if literal.is_empty() {
        bail!("no address provided");
    }

    let ip = match address_family(literal) {
        AddressFamily::V4 => literal
            .parse::<Ipv4Addr>()
            .map(IpAddr::V4)
            .map_err(|e| anyhow!("invalid IPv4 address '{}': {}", literal, e))?,
        AddressFamily::V6 => literal
            .parse::<Ipv6Addr>()
            .map(IpAddr::V6)
            .map_err(|e| anyhow!("invalid IPv6 address '{}': {}", literal, e))?,
    };

    Ok(SocketAddr::new(ip, port))
}

/// Resolve a hostname to the first address of the requested family.
///
/// Returns `None` when the host is empty, resolution fails, or no address of
/// that family exists.
pub async fn dns_lookup(host: &str, version: IpVersion) -> Option<String> {
    if host.is_empty() {
        debug!("DNS lookup skipped for empty hostname");
        return None;
    }

    let addrs = match lookup_host((host, 0)).await {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("DNS lookup failed for {}: {}", host, e);
            return None;
        }
    };

    let found = addrs
        .map(|addr| addr.ip())
        .find(|ip| match version {
            IpVersion::V4 => ip.is_ipv4(),
            IpVersion::V6 => ip.is_ipv6(),
        })
        .map(|ip| ip.to_string());

    if found.is_none() {
        debug!("DNS lookup for {} returned no {:?} address", host, version);
    }
    found
}
