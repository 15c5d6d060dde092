//! Address registry used to find an entry point into the ring
//!
//! The registry is only a discovery aid: it may return stale addresses, it
//! may be empty, and registrations are idempotent. Membership truth always
//! comes from the ring itself.
//!
//! Addresses can be given as `host`, `host:port` or `host:port1..port2`
//! (inclusive range), e.g. `10.0.0.1:47500..47509`.

use crate::config::DEFAULT_PORT;
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// Environment variable holding a comma-separated list of bootstrap addresses
pub const ADDRESSES_ENV: &str = "GRIDRING_DISCOVERY_ADDRESSES";

/// External set of socket addresses used to bootstrap discovery
#[async_trait]
pub trait AddressRegistry: Send + Sync + fmt::Debug {
    /// Whether several processes read and write the same registry.
    ///
    /// Addresses of departed nodes are cleaned out of shared registries by
    /// the coordinator.
    fn is_shared(&self) -> bool;

    /// Candidate addresses, possibly empty
    async fn list(&self) -> Result<Vec<SocketAddr>>;

    /// Add addresses; registering a known address is a no-op
    async fn register(&self, addrs: &[SocketAddr]) -> Result<()>;

    /// Remove addresses; unknown addresses are ignored
    async fn unregister(&self, addrs: &[SocketAddr]) -> Result<()>;
}

/// In-memory registry, pre-filled from configuration
#[derive(Debug, Default)]
pub struct StaticAddressRegistry {
    addrs: RwLock<Vec<SocketAddr>>,
    shared: bool,
}

impl StaticAddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding `addrs`
    pub fn with_addresses(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        let registry = Self::new();
        registry.insert_all(addrs);
        registry
    }

    /// Parse a comma-separated address list (see module docs)
    pub fn parse(list: &str) -> Result<Self> {
        Ok(Self::with_addresses(parse_addresses(list)?))
    }

    /// Create a registry from [`ADDRESSES_ENV`]; empty when the variable is unset
    pub fn from_env() -> Result<Self> {
        match std::env::var(ADDRESSES_ENV) {
            Ok(list) => Self::parse(&list),
            Err(_) => Ok(Self::new()),
        }
    }

    /// Mark the registry as shared between processes
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Current contents
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.addrs.read().clone()
    }

    fn insert_all(&self, addrs: impl IntoIterator<Item = SocketAddr>) {
        let mut known = self.addrs.write();
        for addr in addrs {
            if !known.contains(&addr) {
                known.push(addr);
            }
        }
    }
}

#[async_trait]
impl AddressRegistry for StaticAddressRegistry {
    fn is_shared(&self) -> bool {
        self.shared
    }

    async fn list(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.addresses())
    }

    async fn register(&self, addrs: &[SocketAddr]) -> Result<()> {
        self.insert_all(addrs.iter().copied());
        Ok(())
    }

    async fn unregister(&self, addrs: &[SocketAddr]) -> Result<()> {
        self.addrs.write().retain(|a| !addrs.contains(a));
        Ok(())
    }
}

/// Parse a comma-separated address list into socket addresses
pub fn parse_addresses(list: &str) -> Result<Vec<SocketAddr>> {
    let mut addrs = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        for addr in parse_address(entry)? {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
    }
    Ok(addrs)
}

/// Parse one `host`, `host:port` or `host:port1..port2` entry
pub fn parse_address(entry: &str) -> Result<Vec<SocketAddr>> {
    let (host, ports) = split_host_ports(entry)?;

    let mut addrs = Vec::new();
    for port in ports {
        let resolved = (host, port)
            .to_socket_addrs()
            .map_err(|e| DiscoveryError::InvalidAddress(format!("{entry}: {e}")))?;
        for addr in resolved {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
    }

    if addrs.is_empty() {
        return Err(DiscoveryError::InvalidAddress(format!(
            "{entry}: host did not resolve"
        )));
    }
    Ok(addrs)
}

fn split_host_ports(entry: &str) -> Result<(&str, std::ops::RangeInclusive<u16>)> {
    let invalid = |reason: &str| DiscoveryError::InvalidAddress(format!("{entry}: {reason}"));

    // [v6]:port, bare v6, or host[:port]
    let (host, port_part) = if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
        match tail {
            "" => (host, None),
            tail => (
                host,
                Some(tail.strip_prefix(':').ok_or_else(|| invalid("expected ':' after ']'"))?),
            ),
        }
    } else if entry.matches(':').count() > 1 {
        (entry, None)
    } else {
        match entry.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (entry, None),
        }
    };

    if host.is_empty() {
        return Err(invalid("empty host"));
    }

    let parse_port = |s: &str| -> Result<u16> {
        let port: u16 = s.trim().parse().map_err(|_| invalid("invalid port"))?;
        if port == 0 {
            return Err(invalid("port must be positive"));
        }
        Ok(port)
    };

    let ports = match port_part {
        None => DEFAULT_PORT..=DEFAULT_PORT,
        Some(p) => match p.split_once("..") {
            Some((from, to)) => {
                let (from, to) = (parse_port(from)?, parse_port(to)?);
                if to <= from {
                    return Err(invalid("port range end must be greater than its start"));
                }
                from..=to
            }
            None => {
                let port = parse_port(p)?;
                port..=port
            }
        },
    };

    Ok((host, ports))
}
