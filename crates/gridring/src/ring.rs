//! Ring manager
//!
//! Local ordered membership view. Nodes are kept in a vector sorted by
//! admission order plus an id index; neighbors are computed from positions
//! rather than stored as links. The ring contains every admitted node,
//! including invisible ones that are still joining; snapshots only expose
//! visible nodes.
//!
//! [`Ring::apply`] is the only membership mutator and is called by the message
//! worker in delivery order. The locally suspected set is the one exception:
//! suspects stay in the ring until a verified failure removes them, but are
//! skipped when picking the successor and the coordinator.

use crate::message::TopologyData;
use crate::node::{unix_millis, NodeId, NodeInfo, NodeMetrics, RingNode};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Immutable view of the visible ring at one topology version
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot {
    /// Topology version
    pub version: u64,

    /// Visible nodes sorted by admission order
    pub nodes: Vec<RingNode>,

    /// Local node id
    pub local: NodeId,

    /// Current coordinator, if the local node is a member
    pub coordinator: Option<NodeId>,

    /// Start time of the first ring node (unix millis)
    pub grid_start_time: u64,
}

impl TopologySnapshot {
    /// Snapshot of a node that has not joined yet
    pub fn empty(local: NodeId) -> Self {
        Self {
            version: 0,
            nodes: Vec::new(),
            local,
            coordinator: None,
            grid_start_time: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&RingNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Node ids in ring order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(RingNode::id).collect()
    }

    /// Local node, once joined
    pub fn local_node(&self) -> Option<&RingNode> {
        self.node(self.local)
    }

    /// Next visible node after `id` in ring order, wrapping around
    pub fn successor_of(&self, id: NodeId) -> Option<&RingNode> {
        let pos = self.nodes.iter().position(|n| n.id() == id)?;
        if self.nodes.len() < 2 {
            return None;
        }
        self.nodes.get((pos + 1) % self.nodes.len())
    }

    /// Every visible node except the local one
    pub fn remote_nodes(&self) -> Vec<RingNode> {
        self.nodes
            .iter()
            .filter(|n| n.id() != self.local)
            .cloned()
            .collect()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator == Some(self.local)
    }
}

/// A membership change delivered by the message worker
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipChange {
    /// Insert an invisible node at `order`
    Added { info: NodeInfo, order: u64 },
    /// Make an added node visible
    AddFinished(NodeId),
    /// Remove a node that left voluntarily
    Left(NodeId),
    /// Remove a failed node
    Failed(NodeId),
}

/// Visible effect of an applied change
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Nothing changed (repeated or stale change)
    Unchanged,
    /// An invisible node was inserted
    Added,
    /// A node became visible
    Joined(RingNode),
    /// A visible node left
    Left(RingNode),
    /// A visible node failed
    Failed(RingNode),
    /// A node that never became visible was removed
    Discarded(RingNode),
}

impl Applied {
    /// Check if the change bumped the topology version
    pub fn bumps_version(&self) -> bool {
        matches!(self, Applied::Joined(_) | Applied::Left(_) | Applied::Failed(_))
    }
}

/// Local ring state, owned by the message worker
#[derive(Debug)]
pub struct Ring {
    local: NodeId,
    nodes: Vec<RingNode>,
    index: HashMap<NodeId, usize>,
    suspects: HashSet<NodeId>,
    /// Departed ids and the instant they may be reused
    departed: HashMap<NodeId, Instant>,
    duplicate_id_grace: Duration,
    version: u64,
    max_order: u64,
    grid_start_time: u64,
}

impl Ring {
    /// Create an empty ring for a node that has not joined yet
    pub fn new(local: NodeId, duplicate_id_grace: Duration) -> Self {
        Self {
            local,
            nodes: Vec::new(),
            index: HashMap::new(),
            suspects: HashSet::new(),
            departed: HashMap::new(),
            duplicate_id_grace,
            version: 0,
            max_order: 0,
            grid_start_time: 0,
        }
    }

    /// Become the first node: order 0, version 1
    pub fn bootstrap(&mut self, info: NodeInfo) {
        let mut node = RingNode::new(info, 0);
        node.mark_ready();
        self.nodes = vec![node];
        self.suspects.clear();
        self.version = 1;
        self.max_order = 0;
        self.grid_start_time = unix_millis();
        self.reindex();
    }

    /// Replace the local state with the topology handed over at admission
    pub fn restore(&mut self, data: TopologyData) {
        self.nodes = data.nodes;
        self.nodes.sort_by_key(|n| n.order);
        self.suspects.clear();
        self.version = data.version;
        self.max_order = data.max_order;
        self.grid_start_time = data.grid_start_time;
        let now = Instant::now();
        self.departed = data
            .departed
            .into_iter()
            .map(|(id, left)| (id, now + left))
            .collect();
        self.reindex();
    }

    /// Full state for a node being admitted
    pub fn topology_data(&self) -> TopologyData {
        let now = Instant::now();
        TopologyData {
            version: self.version,
            max_order: self.max_order,
            grid_start_time: self.grid_start_time,
            nodes: self.nodes.clone(),
            departed: self
                .departed
                .iter()
                .filter(|(_, until)| **until > now)
                .map(|(id, until)| (*id, until.saturating_duration_since(now)))
                .collect(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn grid_start_time(&self) -> u64 {
        self.grid_start_time
    }

    /// Number of ring nodes, visible or not
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check if the local node is part of the ring
    pub fn is_member(&self) -> bool {
        self.index.contains_key(&self.local)
    }

    pub fn get(&self, id: NodeId) -> Option<&RingNode> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn local_node(&self) -> Option<&RingNode> {
        self.get(self.local)
    }

    /// All ring nodes sorted by order
    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    /// Order the coordinator assigns to the next admitted node
    pub fn next_order(&self) -> u64 {
        if self.nodes.is_empty() {
            0
        } else {
            self.max_order + 1
        }
    }

    /// Forwards a message may take before it is considered lost
    pub fn hop_limit(&self) -> u32 {
        3 * (self.nodes.len() as u32 + 1)
    }

    /// Next live node after the local one, cyclically
    pub fn successor(&self) -> Option<&RingNode> {
        let pos = *self.index.get(&self.local)?;
        let n = self.nodes.len();
        (1..n)
            .map(|step| &self.nodes[(pos + step) % n])
            .find(|node| !self.suspects.contains(&node.id()))
    }

    /// Previous live node before the local one, cyclically
    pub fn predecessor(&self) -> Option<&RingNode> {
        let pos = *self.index.get(&self.local)?;
        let n = self.nodes.len();
        (1..n)
            .map(|step| &self.nodes[(pos + n - step) % n])
            .find(|node| !self.suspects.contains(&node.id()))
    }

    /// Ring head: the smallest order among live nodes, visible ones first
    pub fn coordinator(&self) -> Option<&RingNode> {
        if !self.is_member() {
            return None;
        }
        let mut live = self
            .nodes
            .iter()
            .filter(|n| !self.suspects.contains(&n.id()));
        let first = live.clone().find(|n| n.visible);
        first.or_else(|| live.next())
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator().map(RingNode::id) == Some(self.local)
    }

    /// Suspect a node locally until a verified failure removes it
    pub fn mark_failed(&mut self, id: NodeId) -> bool {
        id != self.local && self.contains(id) && self.suspects.insert(id)
    }

    /// Check if `id` is taken: in the ring or departed within the grace window
    pub fn is_duplicate(&mut self, id: NodeId) -> bool {
        self.expire_departed();
        self.contains(id) || self.departed.contains_key(&id)
    }

    /// Apply one membership change.
    ///
    /// Changes are idempotent: repeated or stale changes return
    /// [`Applied::Unchanged`]. A change that alters the visible ring bumps the
    /// version by one, or up to `stamped` when this node is behind.
    ///
    /// An addition was already checked against the grace window by the
    /// coordinator, so it also clears a departed entry for the same id.
    pub fn apply(&mut self, change: MembershipChange, stamped: u64) -> Applied {
        self.expire_departed();
        let applied = match change {
            MembershipChange::Added { info, order } => {
                if self.contains(info.id) {
                    return Applied::Unchanged;
                }
                self.departed.remove(&info.id);
                let pos = self.nodes.partition_point(|n| n.order < order);
                self.nodes.insert(pos, RingNode::new(info, order));
                self.max_order = self.max_order.max(order);
                self.reindex();
                Applied::Added
            }
            MembershipChange::AddFinished(id) => match self.index.get(&id) {
                Some(&i) if !self.nodes[i].visible => {
                    self.nodes[i].mark_ready();
                    Applied::Joined(self.nodes[i].clone())
                }
                _ => Applied::Unchanged,
            },
            MembershipChange::Left(id) => match self.remove(id) {
                Some(mut node) if node.visible => {
                    node.mark_leaving();
                    Applied::Left(node)
                }
                Some(node) => Applied::Discarded(node),
                None => Applied::Unchanged,
            },
            MembershipChange::Failed(id) => match self.remove(id) {
                Some(mut node) if node.visible => {
                    node.mark_failed();
                    Applied::Failed(node)
                }
                Some(node) => Applied::Discarded(node),
                None => Applied::Unchanged,
            },
        };

        if applied.bumps_version() {
            self.version = (self.version + 1).max(stamped);
        }
        applied
    }

    /// Store newer metrics for a node; returns false for unknown nodes or stale metrics
    pub fn update_metrics(&mut self, id: NodeId, metrics: NodeMetrics) -> bool {
        match self.index.get(&id) {
            Some(&i) if metrics.update_time >= self.nodes[i].metrics.update_time => {
                self.nodes[i].metrics = metrics;
                true
            }
            _ => false,
        }
    }

    /// Immutable copy of the visible ring
    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            version: self.version,
            nodes: self.nodes.iter().filter(|n| n.visible).cloned().collect(),
            local: self.local,
            coordinator: self.coordinator().map(RingNode::id),
            grid_start_time: self.grid_start_time,
        }
    }

    /// Shared snapshot, as published to readers
    pub fn shared_snapshot(&self) -> Arc<TopologySnapshot> {
        Arc::new(self.snapshot())
    }

    fn remove(&mut self, id: NodeId) -> Option<RingNode> {
        if id == self.local {
            return None;
        }
        let pos = self.index.get(&id).copied()?;
        let node = self.nodes.remove(pos);
        self.suspects.remove(&id);
        self.departed
            .insert(id, Instant::now() + self.duplicate_id_grace);
        self.reindex();
        Some(node)
    }

    fn expire_departed(&mut self) {
        let now = Instant::now();
        self.departed.retain(|_, until| *until > now);
    }

    fn reindex(&mut self) {
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id(), i))
            .collect();
    }
}
