//! Endpoint and internal address types.
//!
//! An [`Endpoint`] is what test code dials: the host the container runtime
//! publishes ports on, plus the mapped host port. An [`InternalAddress`] is
//! what a service inside an isolated network advertises to its peers; it is
//! only ever used as a lookup key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Validates a port number, rejecting zero.
pub fn validate_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(CoreError::InvalidPort(port)),
    }
}

/// An externally reachable `(host, port)` pair.
///
/// Immutable once constructed; both fields are validated up front.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawEndpoint", into = "RawEndpoint")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates a new endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidHost`] for an empty host or one containing
    /// whitespace, and [`CoreError::InvalidPort`] for port zero.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidHost(host));
        }
        let port = validate_port(u32::from(port))?;
        Ok(Self { host, port })
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns a `redis://`-style URL for this endpoint with the given scheme.
    pub fn url(&self, scheme: &str) -> String {
        format!("{}://{}", scheme, self)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawEndpoint {
    host: String,
    port: u16,
}

impl TryFrom<RawEndpoint> for Endpoint {
    type Error = CoreError;

    fn try_from(raw: RawEndpoint) -> Result<Self> {
        Endpoint::new(raw.host, raw.port)
    }
}

impl From<Endpoint> for RawEndpoint {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            host: endpoint.host,
            port: endpoint.port,
        }
    }
}

/// Address of a service inside an isolated network.
///
/// Displays in canonical `"{ip}:{port}"` form (`"[ip]:port"` for IPv6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InternalAddress(SocketAddr);

impl InternalAddress {
    /// Creates an internal address from an IP and a port.
    pub fn new(ip: IpAddr, port: u16) -> Result<Self> {
        let port = validate_port(u32::from(port))?;
        Ok(Self(SocketAddr::new(ip, port)))
    }

    /// Returns the IP part.
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Returns the port part.
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns the underlying socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl FromStr for InternalAddress {
    type Err = CoreError;

    /// Parses `ip:port`.
    ///
    /// Cluster nodes sometimes advertise `ip:port@cport`; the bus port
    /// suffix is dropped.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let without_bus = trimmed.split('@').next().unwrap_or(trimmed);
        let addr: SocketAddr = without_bus
            .parse()
            .map_err(|e: std::net::AddrParseError| CoreError::invalid_address(s, e.to_string()))?;
        Self::new(addr.ip(), addr.port())
    }
}

impl TryFrom<String> for InternalAddress {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<InternalAddress> for String {
    fn from(addr: InternalAddress) -> Self {
        addr.to_string()
    }
}

impl From<SocketAddr> for InternalAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for InternalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
