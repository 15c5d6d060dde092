//! Discovery configuration

use crate::error::{DiscoveryError, Result};
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Default discovery port
pub const DEFAULT_PORT: u16 = 47500;

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Address the discovery listener binds to
    pub bind_addr: SocketAddr,

    /// Addresses advertised to peers (empty = the bound address)
    pub advertise_addrs: Vec<SocketAddr>,

    /// Fixed node identifier (random when absent)
    pub node_id: Option<NodeId>,

    /// Application attributes published with the node identity
    pub attributes: BTreeMap<String, String>,

    /// Overall bound for joining the ring (zero = retry forever)
    pub join_timeout: Duration,

    /// Pause between join rounds when peers answered but did not admit us
    pub join_retry_interval: Duration,

    /// Bound for handshakes, pings and single frame reads/writes
    pub network_timeout: Duration,

    /// Bound for establishing a TCP connection
    pub connect_timeout: Duration,

    /// Interval between successor probes
    pub probe_interval: Duration,

    /// Silence on the successor link after which it is suspected
    pub failure_detection_timeout: Duration,

    /// Interval between metrics heartbeats (coordinator only)
    pub heartbeat_frequency: Duration,

    /// Heartbeat periods without any ring traffic before a node checks with
    /// the coordinator whether it is still a member
    pub max_missed_heartbeats: u32,

    /// Direct reconnection attempts before skipping a successor
    pub reconnect_count: u32,

    /// How long a leaving node waits for its NODE_LEFT to come back
    pub leave_timeout: Duration,

    /// How long departed ids are still treated as taken
    pub duplicate_id_grace: Duration,

    /// Interval for cleaning the address registry and metrics store
    pub stores_clean_frequency: Duration,

    /// Forwarded messages kept for resend after ring repair
    pub max_pending_messages: usize,

    /// Capacity of the worker inbox
    pub inbox_capacity: usize,

    /// Message ids remembered for duplicate suppression
    pub seen_messages_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertise_addrs: Vec::new(),
            node_id: None,
            attributes: BTreeMap::new(),
            join_timeout: Duration::from_secs(30),
            join_retry_interval: Duration::from_millis(500),
            network_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_secs(1),
            failure_detection_timeout: Duration::from_secs(3),
            heartbeat_frequency: Duration::from_secs(2),
            max_missed_heartbeats: 5,
            reconnect_count: 2,
            leave_timeout: Duration::from_secs(5),
            duplicate_id_grace: Duration::from_secs(60),
            stores_clean_frequency: Duration::from_secs(60),
            max_pending_messages: 1024,
            inbox_capacity: 1024,
            seen_messages_capacity: 8192,
        }
    }
}

impl DiscoveryConfig {
    /// Create configuration builder
    pub fn builder() -> DiscoveryConfigBuilder {
        DiscoveryConfigBuilder::new()
    }

    /// Join bound, `None` when joins retry forever
    pub fn join_deadline(&self) -> Option<Duration> {
        (!self.join_timeout.is_zero()).then_some(self.join_timeout)
    }

    /// Inbound silence after which membership is checked with the coordinator
    pub fn segment_check_timeout(&self) -> Duration {
        self.heartbeat_frequency * self.max_missed_heartbeats.max(1)
    }

    /// Validate settings that would make the protocol misbehave
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("network_timeout", self.network_timeout),
            ("connect_timeout", self.connect_timeout),
            ("probe_interval", self.probe_interval),
            ("failure_detection_timeout", self.failure_detection_timeout),
            ("heartbeat_frequency", self.heartbeat_frequency),
            ("leave_timeout", self.leave_timeout),
            ("stores_clean_frequency", self.stores_clean_frequency),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(DiscoveryError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.failure_detection_timeout < self.probe_interval {
            return Err(DiscoveryError::InvalidConfig(format!(
                "failure_detection_timeout ({:?}) must not be shorter than probe_interval ({:?})",
                self.failure_detection_timeout, self.probe_interval
            )));
        }

        if self.inbox_capacity == 0 || self.seen_messages_capacity == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "inbox_capacity and seen_messages_capacity must be greater than zero".into(),
            ));
        }

        if self.advertise_addrs.iter().any(|a| a.port() == 0) {
            return Err(DiscoveryError::InvalidConfig(
                "advertised addresses need an explicit port".into(),
            ));
        }

        Ok(())
    }
}

/// Builder for discovery configuration
#[derive(Debug, Default)]
pub struct DiscoveryConfigBuilder {
    config: DiscoveryConfig,
}

impl DiscoveryConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    pub fn advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.config.advertise_addrs.push(addr);
        self
    }

    pub fn node_id(mut self, id: NodeId) -> Self {
        self.config.node_id = Some(id);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.attributes.insert(key.into(), value.into());
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout = timeout;
        self
    }

    pub fn join_retry_interval(mut self, interval: Duration) -> Self {
        self.config.join_retry_interval = interval;
        self
    }

    pub fn network_timeout(mut self, timeout: Duration) -> Self {
        self.config.network_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the probe interval and the silence window that marks a successor suspect
    pub fn failure_detection(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.probe_interval = interval;
        self.config.failure_detection_timeout = timeout;
        self
    }

    pub fn heartbeat_frequency(mut self, frequency: Duration) -> Self {
        self.config.heartbeat_frequency = frequency;
        self
    }

    pub fn max_missed_heartbeats(mut self, count: u32) -> Self {
        self.config.max_missed_heartbeats = count;
        self
    }

    pub fn reconnect_count(mut self, count: u32) -> Self {
        self.config.reconnect_count = count;
        self
    }

    pub fn leave_timeout(mut self, timeout: Duration) -> Self {
        self.config.leave_timeout = timeout;
        self
    }

    pub fn duplicate_id_grace(mut self, grace: Duration) -> Self {
        self.config.duplicate_id_grace = grace;
        self
    }

    pub fn stores_clean_frequency(mut self, frequency: Duration) -> Self {
        self.config.stores_clean_frequency = frequency;
        self
    }

    pub fn build(self) -> Result<DiscoveryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
