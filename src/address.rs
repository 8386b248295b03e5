//! Core address and peer-identity types (spec §3).
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bitcoin::network::constants::ServiceFlags;
use serde::{Deserialize, Serialize};

use crate::time::LocalTime;

/// A network address advertised over the wire: IP, port, services, and the
/// time it was last seen active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub services: ServiceFlags,
    pub timestamp: LocalTime,
}

impl NetworkAddress {
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags, timestamp: LocalTime) -> Self {
        Self {
            ip,
            port,
            services,
            timestamp,
        }
    }

    /// Valid iff the port is non-zero and the IP is not the unspecified address.
    pub fn is_valid(&self) -> bool {
        self.port != 0 && !self.ip.is_unspecified()
    }

    pub fn authority(&self) -> Authority {
        Authority::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port(), ServiceFlags::NONE, LocalTime::now())
    }
}

/// An IP + port pair identifying a peer endpoint — used for logging,
/// blacklist checks, and duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authority {
    pub ip: IpAddr,
    pub port: u16,
}

impl Authority {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Authority {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<Authority> for SocketAddr {
    fn from(a: Authority) -> Self {
        a.socket_addr()
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Parse errors for the `[ipv6]:port` / `ipv4:port` line format used by the
/// hosts file (spec §6) and `Authority`'s `FromStr` impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed authority")]
pub struct ParseAuthorityError;

impl FromStr for Authority {
    type Err = ParseAuthorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix('[') {
            let (ip, port) = rest.split_once("]:").ok_or(ParseAuthorityError)?;
            let ip = Ipv6Addr::from_str(ip).map_err(|_| ParseAuthorityError)?;
            let port = u16::from_str(port).map_err(|_| ParseAuthorityError)?;
            return Ok(Authority::new(IpAddr::V6(ip), port));
        }

        let (ip, port) = s.rsplit_once(':').ok_or(ParseAuthorityError)?;
        let ip = Ipv4Addr::from_str(ip).map_err(|_| ParseAuthorityError)?;
        let port = u16::from_str(port).map_err(|_| ParseAuthorityError)?;
        Ok(Authority::new(IpAddr::V4(ip), port))
    }
}

/// An unresolved hostname + port, as supplied in configuration (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An immutable record of a peer's advertised protocol version, set once per
/// channel on receipt of its first `version` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerVersion {
    pub version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub timestamp: LocalTime,
    pub start_height: i32,
    pub relay: bool,
    /// The nonce the peer advertised in their `version` message, used by the
    /// inbound session to detect self-connections against pending outbound
    /// handshakes (spec §4.7, §8).
    pub nonce: u64,
}
