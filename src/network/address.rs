/**
 * network/address.rs
 *
 * Network addresses: lazily resolved host/port pairs and the
 * direct-or-join-key server address
 */

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::OnceLock;

/// IP address family hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Unspecified,
    V4,
    V6,
}

impl Family {
    /// Family of a concrete socket address
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    /// Whether `addr` is acceptable under this hint
    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Unspecified => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Family::Unspecified => 0,
            Family::V4 => 1,
            Family::V6 => 2,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Family::Unspecified),
            1 => Some(Family::V4),
            2 => Some(Family::V6),
            _ => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Unspecified => write!(f, "any"),
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Families this host can open stream sockets for, IPv4 first
pub fn supported_families() -> Vec<Family> {
    [(Family::V4, Domain::IPV4), (Family::V6, Domain::IPV6)]
        .into_iter()
        .filter(|(_, domain)| Socket::new(*domain, Type::STREAM, Some(Protocol::TCP)).is_ok())
        .map(|(family, _)| family)
        .collect()
}

/// A host/port pair that is resolved on first use
///
/// Once resolved, the socket address never changes for the lifetime
/// of the value (clones share the resolved result they were cloned with).
#[derive(Debug, Clone)]
pub struct NetworkAddress {
    hostname: String,
    port: u16,
    family: Family,
    resolved: OnceLock<SocketAddr>,
}

impl NetworkAddress {
    /// Create an unresolved address. IPv6 brackets are stripped.
    pub fn new(hostname: &str, port: u16, family: Family) -> Self {
        let hostname = hostname.trim_start_matches('[').trim_end_matches(']');
        Self {
            hostname: hostname.to_string(),
            port,
            family,
            resolved: OnceLock::new(),
        }
    }

    /// Create an already resolved address
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(addr);
        Self {
            hostname: addr.ip().to_string(),
            port: addr.port(),
            family: Family::of(&addr),
            resolved,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    pub fn parse(connection_string: &str, default_port: u16) -> Self {
        let s = connection_string.trim();

        if let Some(rest) = s.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                let port = rest[end + 1..]
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(default_port);
                return Self::new(&rest[..end], port, Family::Unspecified);
            }
        }

        match s.rsplit_once(':') {
            // A second colon means a bare IPv6 literal, not a port separator.
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => Self::new(host, port, Family::Unspecified),
                Err(_) => Self::new(s, default_port, Family::Unspecified),
            },
            _ => Self::new(s, default_port, Family::Unspecified),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Whether the host is empty or the any-address
    pub fn is_unspecified_host(&self) -> bool {
        if self.hostname.is_empty() {
            return true;
        }
        match self.hostname.parse::<IpAddr>() {
            Ok(ip) => ip.is_unspecified(),
            Err(_) => false,
        }
    }

    /// Resolve every candidate socket address matching the family hint.
    ///
    /// Blocks on DNS for hostnames; call it from a connect worker only.
    /// The first candidate is cached as the resolved address.
    pub fn lookup(&self) -> io::Result<Vec<SocketAddr>> {
        if let Some(addr) = self.resolved.get() {
            return Ok(vec![*addr]);
        }

        let candidates: Vec<SocketAddr> = (self.hostname.as_str(), self.port)
            .to_socket_addrs()?
            .filter(|addr| self.family.matches(addr))
            .collect();

        match candidates.first() {
            Some(first) => {
                let _ = self.resolved.set(*first);
                Ok(candidates)
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no {} address for {}", self.family, self),
            )),
        }
    }

    /// Resolve to a single socket address, caching the result
    pub fn resolve(&self) -> io::Result<SocketAddr> {
        let candidates = self.lookup()?;
        Ok(self.resolved.get().copied().unwrap_or(candidates[0]))
    }
}

impl PartialEq for NetworkAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self.resolved.get(), other.resolved.get()) {
            (Some(a), Some(b)) => a == b,
            _ => {
                self.port == other.port
                    && self.family == other.family
                    && self.hostname.eq_ignore_ascii_case(&other.hostname)
            }
        }
    }
}

impl Eq for NetworkAddress {}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

/// Address of a game server: either reachable directly, or only
/// through the rendezvous service by its join-key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Direct(NetworkAddress),
    JoinKey(String),
}

impl ServerAddress {
    pub fn is_direct(&self) -> bool {
        matches!(self, ServerAddress::Direct(_))
    }

    pub fn join_key(&self) -> Option<&str> {
        match self {
            ServerAddress::JoinKey(key) => Some(key),
            ServerAddress::Direct(_) => None,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddress::Direct(address) => write!(f, "{}", address),
            ServerAddress::JoinKey(key) => write!(f, "+{}", key),
        }
    }
}
