//! External metrics store
//!
//! When configured, nodes write their metrics here instead of growing the
//! heartbeat payload. The store is a best-effort cache: every failure falls
//! back to inline heartbeat metrics and never aborts the protocol.

use crate::error::Result;
use crate::node::{NodeId, NodeMetrics};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Store for per-node metrics shared by the ring
#[async_trait]
pub trait MetricsStore: Send + Sync + fmt::Debug {
    /// Write the metrics of `node`, replacing older ones
    async fn put(&self, node: NodeId, metrics: &NodeMetrics) -> Result<()>;

    /// Read the metrics of `nodes`; unknown nodes are absent from the result
    async fn get(&self, nodes: &[NodeId]) -> Result<BTreeMap<NodeId, NodeMetrics>>;

    /// Remove the metrics of `nodes`
    async fn remove(&self, nodes: &[NodeId]) -> Result<()>;

    /// Ids of every node with stored metrics
    async fn node_ids(&self) -> Result<Vec<NodeId>>;
}

/// Process-local metrics store with optional entry expiry
#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    entries: DashMap<NodeId, (Instant, NodeMetrics)>,
    expire_time: Option<Duration>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries that were not refreshed within `expire_time`
    pub fn with_expire_time(mut self, expire_time: Duration) -> Self {
        self.expire_time = Some(expire_time);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&self) {
        if let Some(expire_time) = self.expire_time {
            self.entries
                .retain(|_, (written, _)| written.elapsed() <= expire_time);
        }
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn put(&self, node: NodeId, metrics: &NodeMetrics) -> Result<()> {
        self.entries.insert(node, (Instant::now(), metrics.clone()));
        Ok(())
    }

    async fn get(&self, nodes: &[NodeId]) -> Result<BTreeMap<NodeId, NodeMetrics>> {
        self.evict_expired();
        Ok(nodes
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (*id, e.value().1.clone())))
            .collect())
    }

    async fn remove(&self, nodes: &[NodeId]) -> Result<()> {
        for id in nodes {
            self.entries.remove(id);
        }
        Ok(())
    }

    async fn node_ids(&self) -> Result<Vec<NodeId>> {
        self.evict_expired();
        Ok(self.entries.iter().map(|e| *e.key()).collect())
    }
}
