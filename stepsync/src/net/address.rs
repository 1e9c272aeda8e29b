//! Service addresses in `tcp://host:port` form.
//!
//! The scheme mirrors ZeroMQ endpoint strings so the same value can be stored
//! in the application options and handed to either side of the protocol.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use thiserror::Error;

/// The only transport scheme understood by the channel.
pub const TCP_SCHEME: &str = "tcp://";

/// Error parsing a service address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The address is empty.
    #[error("service address is empty")]
    Empty,
    /// The address does not start with `tcp://`.
    #[error("unsupported transport in {0:?} (expected tcp://host:port)")]
    UnsupportedScheme(String),
    /// The `:port` suffix is missing or not a valid port number.
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    /// The host did not resolve to any socket address.
    #[error("cannot resolve host {0:?}")]
    Unresolvable(String),
}

/// A resolved request/reply service address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceAddress(SocketAddr);

impl ServiceAddress {
    /// Parses a `tcp://host:port` string, resolving `host` if needed.
    ///
    /// A host of `*` means every interface, as in a ZeroMQ `bind`.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if the scheme, port or host is invalid.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }
        let rest = raw
            .strip_prefix(TCP_SCHEME)
            .ok_or_else(|| AddressError::UnsupportedScheme(raw.to_owned()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressError::InvalidPort(raw.to_owned()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(raw.to_owned()))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host == "*" {
            return Ok(Self::any(port));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self(SocketAddr::new(ip, port)));
        }

        let mut candidates = (host, port)
            .to_socket_addrs()
            .map_err(|_| AddressError::Unresolvable(host.to_owned()))?;
        candidates
            .next()
            .map(Self)
            .ok_or_else(|| AddressError::Unresolvable(host.to_owned()))
    }

    /// Address on every IPv4 interface.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Loopback address on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns the underlying [`SocketAddr`].
    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl FromStr for ServiceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SocketAddr> for ServiceAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<ServiceAddress> for SocketAddr {
    fn from(addr: ServiceAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TCP_SCHEME}{}", self.0)
    }
}
