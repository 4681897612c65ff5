//! Normalized network addresses.
//!
//! A [`NetAddress`] is the identity key of a relay entry and the payload
//! handed to peers in `connect` replies, so two observations of the same
//! endpoint must always produce equal values. Dual-stack sockets report IPv4
//! peers as IPv4-mapped IPv6 (`::ffff:10.0.0.1`); those are collapsed to plain
//! IPv4 on construction.

use crate::error::{RelayError, Result};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// An externally observed (IP, port) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetAddress {
    ip: IpAddr,
    port: u16,
}

impl NetAddress {
    /// Create an address, normalizing IPv4-mapped IPv6 to IPv4.
    #[must_use]
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip: normalize(ip),
            port,
        }
    }

    /// Build an address from endpoint parts as reported by a socket layer.
    ///
    /// The IP may be wrapped in brackets (`[::1]`).
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidAddress`] if the IP is empty or
    /// unparsable, or if the port is not a number in `0..=65535`.
    pub fn from_observed_endpoint(ip: &str, port: &str) -> Result<Self> {
        let raw_ip = ip.trim();
        if raw_ip.is_empty() {
            return Err(RelayError::InvalidAddress("empty IP".to_string()));
        }

        let unbracketed = raw_ip
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(raw_ip);

        let ip: IpAddr = unbracketed
            .parse()
            .map_err(|_| RelayError::InvalidAddress(format!("invalid IP '{raw_ip}'")))?;

        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| RelayError::InvalidAddress(format!("invalid port '{port}'")))?;

        Ok(Self::new(ip, port))
    }

    /// IP part
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Port part
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Convert to a socket address usable with `send_to`
    #[must_use]
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 @ IpAddr::V4(_) => v4,
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<NetAddress> for SocketAddr {
    fn from(addr: NetAddress) -> Self {
        addr.to_socket_addr()
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

impl FromStr for NetAddress {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| RelayError::InvalidAddress(format!("missing port in '{s}'")))?;
        Self::from_observed_endpoint(ip, port)
    }
}
