//! Topology events delivered to subscribers
//!
//! Events are published by the message worker right after the change was
//! applied and the new snapshot published, so every subscriber sees them in
//! local apply order. Each subscriber owns an unbounded queue.

use crate::node::{NodeId, NodeMetrics, RingNode};
use crate::ring::TopologySnapshot;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Numeric event type codes
pub mod codes {
    pub const NODE_JOINED: u16 = 10;
    pub const NODE_LEFT: u16 = 11;
    pub const NODE_FAILED: u16 = 12;
    pub const NODE_METRICS_UPDATED: u16 = 13;
    pub const NODE_SEGMENTED: u16 = 14;
    pub const NODE_RECONNECTED: u16 = 15;
    pub const CUSTOM: u16 = 16;
}

/// Topology change or broadcast observed by the local node
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A node became visible
    NodeJoined {
        node: RingNode,
        topology: Arc<TopologySnapshot>,
    },
    /// A node left voluntarily
    NodeLeft {
        node: RingNode,
        topology: Arc<TopologySnapshot>,
    },
    /// A node was excluded after failure detection
    NodeFailed {
        node: RingNode,
        topology: Arc<TopologySnapshot>,
    },
    /// Fresh metrics of a node arrived with a heartbeat
    NodeMetricsUpdated {
        node_id: NodeId,
        metrics: NodeMetrics,
        topology: Arc<TopologySnapshot>,
    },
    /// The local node was failed out of the ring and is rejoining
    NodeSegmented {
        node_id: NodeId,
        topology: Arc<TopologySnapshot>,
    },
    /// The local node rejoined after segmentation, under a new id
    NodeReconnected {
        previous_id: NodeId,
        node_id: NodeId,
        topology: Arc<TopologySnapshot>,
    },
    /// Application broadcast, delivered in ring order
    Custom {
        from: NodeId,
        data: Vec<u8>,
        topology: Arc<TopologySnapshot>,
    },
}

impl DiscoveryEvent {
    /// Numeric type code, see [`codes`]
    pub fn type_code(&self) -> u16 {
        match self {
            DiscoveryEvent::NodeJoined { .. } => codes::NODE_JOINED,
            DiscoveryEvent::NodeLeft { .. } => codes::NODE_LEFT,
            DiscoveryEvent::NodeFailed { .. } => codes::NODE_FAILED,
            DiscoveryEvent::NodeMetricsUpdated { .. } => codes::NODE_METRICS_UPDATED,
            DiscoveryEvent::NodeSegmented { .. } => codes::NODE_SEGMENTED,
            DiscoveryEvent::NodeReconnected { .. } => codes::NODE_RECONNECTED,
            DiscoveryEvent::Custom { .. } => codes::CUSTOM,
        }
    }

    /// Snapshot right after the event was applied
    pub fn topology(&self) -> &Arc<TopologySnapshot> {
        match self {
            DiscoveryEvent::NodeJoined { topology, .. }
            | DiscoveryEvent::NodeLeft { topology, .. }
            | DiscoveryEvent::NodeFailed { topology, .. }
            | DiscoveryEvent::NodeMetricsUpdated { topology, .. }
            | DiscoveryEvent::NodeSegmented { topology, .. }
            | DiscoveryEvent::NodeReconnected { topology, .. }
            | DiscoveryEvent::Custom { topology, .. } => topology,
        }
    }

    pub fn topology_version(&self) -> u64 {
        self.topology().version
    }

    /// Check if the event changed ring membership
    pub fn is_membership_change(&self) -> bool {
        matches!(
            self,
            DiscoveryEvent::NodeJoined { .. }
                | DiscoveryEvent::NodeLeft { .. }
                | DiscoveryEvent::NodeFailed { .. }
        )
    }
}

/// Fan-out of events to subscribers
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DiscoveryEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; it receives every event published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event; dropped subscribers are pruned
    pub fn publish(&self, event: DiscoveryEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
