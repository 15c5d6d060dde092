//! Node types and runtime metrics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Globally unique 128-bit node identifier, assigned once per process incarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Admitted by the coordinator but not yet announced to the whole ring
    #[default]
    Joining,
    /// Fully admitted and visible
    Ready,
    /// Announced a voluntary departure
    Leaving,
    /// Excluded from the ring after failure detection
    Failed,
}

impl NodeState {
    /// Check if the node takes part in message forwarding
    pub fn is_member(&self) -> bool {
        matches!(self, NodeState::Joining | NodeState::Ready | NodeState::Leaving)
    }
}

/// Immutable identity of a node, published when it asks to join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier
    pub id: NodeId,

    /// Reachable discovery addresses, in preference order
    pub addrs: Vec<SocketAddr>,

    /// Application attributes
    pub attributes: BTreeMap<String, String>,

    /// Software version (for compatibility checking)
    pub version: String,
}

impl NodeInfo {
    /// Create new node info
    pub fn new(id: NodeId, addrs: Vec<SocketAddr>) -> Self {
        Self {
            id,
            addrs,
            attributes: BTreeMap::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Replace all attributes
    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Last-known liveness/load snapshot of a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Wall-clock time the metrics were collected (unix millis)
    pub update_time: u64,

    /// Time since the discovery layer started on the node
    pub uptime_ms: u64,

    /// Ring messages received
    pub received_messages: u64,

    /// Ring messages sent to the successor
    pub sent_messages: u64,

    /// Messages waiting in the worker inbox and backlog
    pub queued_messages: u64,

    /// Topology version the node had applied
    pub topology_version: u64,

    /// Application-provided values
    pub custom: BTreeMap<String, f64>,
}

impl NodeMetrics {
    /// Age of these metrics relative to `now_ms`
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.update_time)
    }
}

/// A ring member as known by the local node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingNode {
    /// Static identity
    pub info: NodeInfo,

    /// Admission order, defines the ring position
    pub order: u64,

    /// Last received metrics
    pub metrics: NodeMetrics,

    /// True once admission has completed on the whole ring
    pub visible: bool,

    /// Lifecycle state
    pub state: NodeState,
}

impl RingNode {
    /// Create a node admitted at `order`, still invisible
    pub fn new(info: NodeInfo, order: u64) -> Self {
        Self {
            info,
            order,
            metrics: NodeMetrics::default(),
            visible: false,
            state: NodeState::Joining,
        }
    }

    /// Get node ID
    pub fn id(&self) -> NodeId {
        self.info.id
    }

    /// Get discovery addresses
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.info.addrs
    }

    /// Mark as fully admitted
    pub fn mark_ready(&mut self) {
        self.visible = true;
        self.state = NodeState::Ready;
    }

    /// Mark as leaving
    pub fn mark_leaving(&mut self) {
        self.state = NodeState::Leaving;
    }

    /// Mark as failed
    pub fn mark_failed(&mut self) {
        self.state = NodeState::Failed;
    }
}

/// Current wall-clock time in unix millis
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
