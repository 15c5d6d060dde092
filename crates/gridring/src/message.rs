//! Ring messages
//!
//! Every control message travels node-to-node along the ring inside a
//! [`RingMessage`] envelope. Membership-changing messages created by ordinary
//! nodes start out *unverified*: nodes only forward them until they reach the
//! coordinator, which stamps itself as verifier together with the topology
//! version. Only verified messages are applied, so every node applies them in
//! the coordinator's send order. A verified message that arrives back at its
//! verifier has completed a full circuit and is retired.

use crate::node::{NodeId, NodeInfo, NodeMetrics, RingNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique ring message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable binary tags of the payload types.
///
/// The tag equals the payload's variant index, which is what postcard writes
/// as the first byte of an encoded [`Payload`].
pub mod tags {
    pub const JOIN_REQUEST: u8 = 0;
    pub const NODE_ADDED: u8 = 1;
    pub const NODE_ADD_FINISHED: u8 = 2;
    pub const NODE_LEFT: u8 = 3;
    pub const NODE_FAILED: u8 = 4;
    pub const DUPLICATE_ID: u8 = 5;
    pub const HEARTBEAT: u8 = 6;
    pub const CUSTOM: u8 = 7;
}

/// Request of a candidate process to enter the ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Identity the candidate wants to join with
    pub candidate: NodeInfo,

    /// Handshake token, identical across retries of one join attempt
    pub token: Uuid,
}

/// Full ring state handed to a node that is being admitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyData {
    /// Topology version of the sender
    pub version: u64,

    /// Highest admission order ever assigned
    pub max_order: u64,

    /// Start time of the first ring node (unix millis)
    pub grid_start_time: u64,

    /// All ring members, visible or not, sorted by order
    pub nodes: Vec<RingNode>,

    /// Recently departed ids with the time left before they may be reused
    pub departed: Vec<(NodeId, Duration)>,
}

/// Metrics circulated by a heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    /// Metrics carried inline
    pub metrics: BTreeMap<NodeId, NodeMetrics>,

    /// Nodes that wrote their metrics to the external store instead
    pub stored: BTreeSet<NodeId>,
}

/// Typed payload of a ring message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A candidate asks to join; forwarded to the coordinator
    JoinRequest(JoinRequest),

    /// The coordinator admitted a node at `order`
    NodeAdded {
        node: NodeInfo,
        order: u64,
        /// Attached by the new node's predecessor before handing it the message
        topology: Option<TopologyData>,
    },

    /// The admission circulated the whole ring; the node becomes visible
    NodeAddFinished { node_id: NodeId },

    /// A node leaves voluntarily
    NodeLeft { node_id: NodeId },

    /// A node was detected as failed and is excluded
    NodeFailed { node_id: NodeId },

    /// Rejection sent directly to a candidate whose id is taken
    DuplicateId { node_id: NodeId },

    /// Periodic liveness/metrics exchange
    Heartbeat(HeartbeatData),

    /// Application broadcast
    Custom { data: Vec<u8> },
}

impl Payload {
    /// Stable type tag
    pub fn tag(&self) -> u8 {
        match self {
            Payload::JoinRequest(_) => tags::JOIN_REQUEST,
            Payload::NodeAdded { .. } => tags::NODE_ADDED,
            Payload::NodeAddFinished { .. } => tags::NODE_ADD_FINISHED,
            Payload::NodeLeft { .. } => tags::NODE_LEFT,
            Payload::NodeFailed { .. } => tags::NODE_FAILED,
            Payload::DuplicateId { .. } => tags::DUPLICATE_ID,
            Payload::Heartbeat(_) => tags::HEARTBEAT,
            Payload::Custom { .. } => tags::CUSTOM,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::JoinRequest(_) => "JOIN_REQUEST",
            Payload::NodeAdded { .. } => "NODE_ADDED",
            Payload::NodeAddFinished { .. } => "NODE_ADD_FINISHED",
            Payload::NodeLeft { .. } => "NODE_LEFT",
            Payload::NodeFailed { .. } => "NODE_FAILED",
            Payload::DuplicateId { .. } => "DUPLICATE_ID",
            Payload::Heartbeat(_) => "HEARTBEAT",
            Payload::Custom { .. } => "CUSTOM",
        }
    }

    /// Check if applying this payload changes ring membership
    pub fn is_membership_change(&self) -> bool {
        matches!(
            self,
            Payload::NodeAdded { .. }
                | Payload::NodeAddFinished { .. }
                | Payload::NodeLeft { .. }
                | Payload::NodeFailed { .. }
        )
    }
}

/// Envelope of every message forwarded around the ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingMessage {
    /// Unique message id
    pub id: MessageId,

    /// Node that created the message
    pub creator: NodeId,

    /// Coordinator that verified the message, if any
    pub verifier: Option<NodeId>,

    /// Topology version stamped at verification
    pub topology_version: u64,

    /// Number of forwards so far
    pub hops: u32,

    /// Typed payload
    pub payload: Payload,
}

impl RingMessage {
    /// Create an unverified message
    pub fn new(creator: NodeId, payload: Payload) -> Self {
        Self {
            id: MessageId::new(),
            creator,
            verifier: None,
            topology_version: 0,
            hops: 0,
            payload,
        }
    }

    /// Create a message already verified by its creator (the coordinator)
    pub fn verified_by(creator: NodeId, topology_version: u64, payload: Payload) -> Self {
        let mut msg = Self::new(creator, payload);
        msg.verify(creator, topology_version);
        msg
    }

    /// Stamp verification
    pub fn verify(&mut self, verifier: NodeId, topology_version: u64) {
        self.verifier = Some(verifier);
        self.topology_version = topology_version;
    }

    pub fn is_verified(&self) -> bool {
        self.verifier.is_some()
    }

    /// Check if `node` verified this message
    pub fn verified_by_node(&self, node: NodeId) -> bool {
        self.verifier == Some(node)
    }
}

impl fmt::Display for RingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[id={}, creator={}, verified={}, ver={}, hops={}]",
            self.payload.kind(),
            self.id,
            self.creator,
            self.is_verified(),
            self.topology_version,
            self.hops
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads() -> Vec<Payload> {
        let id = NodeId::new();
        let info = NodeInfo::new(id, vec!["127.0.0.1:1".parse().unwrap()]);
        vec![
            Payload::JoinRequest(JoinRequest {
                candidate: info.clone(),
                token: Uuid::new_v4(),
            }),
            Payload::NodeAdded {
                node: info,
                order: 4,
                topology: None,
            },
            Payload::NodeAddFinished { node_id: id },
            Payload::NodeLeft { node_id: id },
            Payload::NodeFailed { node_id: id },
            Payload::DuplicateId { node_id: id },
            Payload::Heartbeat(HeartbeatData::default()),
            Payload::Custom { data: vec![1, 2] },
        ]
    }

    #[test]
    fn test_tags_match_encoding() {
        for payload in payloads() {
            let bytes = postcard::to_allocvec(&payload).unwrap();
            assert_eq!(bytes[0], payload.tag(), "tag mismatch for {}", payload.kind());
        }
    }

    #[test]
    fn test_tags_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for payload in payloads() {
            assert!(seen.insert(payload.tag()));
        }
    }

    #[test]
    fn test_verification() {
        let creator = NodeId::new();
        let coordinator = NodeId::new();
        let mut msg = RingMessage::new(creator, Payload::NodeFailed { node_id: NodeId::new() });
        assert!(!msg.is_verified());

        msg.verify(coordinator, 7);
        assert!(msg.is_verified());
        assert!(msg.verified_by_node(coordinator));
        assert!(!msg.verified_by_node(creator));
        assert_eq!(msg.topology_version, 7);
    }

    #[test]
    fn test_membership_classification() {
        let id = NodeId::new();
        assert!(Payload::NodeFailed { node_id: id }.is_membership_change());
        assert!(!Payload::Custom { data: vec![] }.is_membership_change());
    }
}
