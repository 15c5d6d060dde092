//! Metrics exchange over heartbeats
//!
//! The coordinator originates a HEARTBEAT every `heartbeat_frequency`. Each
//! node reads the metrics the heartbeat carries and adds its own, either
//! inline or, with a metrics store configured, by writing them to the store
//! and only listing its id in [`HeartbeatData::stored`]. A failing store
//! degrades to inline metrics. Heartbeats are never acknowledged; a lost one
//! is replaced by the next.

use crate::message::HeartbeatData;
use crate::metrics_store::MetricsStore;
use crate::node::{unix_millis, NodeId, NodeMetrics};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Source of application-defined metrics
pub trait MetricsProvider: Send + Sync {
    /// Values published with the local node's metrics
    fn custom_metrics(&self) -> BTreeMap<String, f64>;
}

impl<F> MetricsProvider for F
where
    F: Fn() -> BTreeMap<String, f64> + Send + Sync,
{
    fn custom_metrics(&self) -> BTreeMap<String, f64> {
        self()
    }
}

/// Message counters maintained by the worker
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCounters {
    pub received: u64,
    pub sent: u64,
    pub queued: u64,
}

/// Builds, publishes and reads per-node metrics
pub struct MetricsExchanger {
    store: Option<Arc<dyn MetricsStore>>,
    provider: Option<Arc<dyn MetricsProvider>>,
    store_timeout: Duration,
    started: Instant,
}

impl std::fmt::Debug for MetricsExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExchanger")
            .field("store", &self.store)
            .field("provider", &self.provider.is_some())
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl MetricsExchanger {
    pub fn new(
        store: Option<Arc<dyn MetricsStore>>,
        provider: Option<Arc<dyn MetricsProvider>>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            store_timeout,
            started: Instant::now(),
        }
    }

    pub fn store(&self) -> Option<&Arc<dyn MetricsStore>> {
        self.store.as_ref()
    }

    /// Current metrics of the local node
    pub fn local_metrics(&self, counters: MessageCounters, topology_version: u64) -> NodeMetrics {
        NodeMetrics {
            update_time: unix_millis(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            received_messages: counters.received,
            sent_messages: counters.sent,
            queued_messages: counters.queued,
            topology_version,
            custom: self
                .provider
                .as_ref()
                .map(|p| p.custom_metrics())
                .unwrap_or_default(),
        }
    }

    /// Metrics carried by a heartbeat, including those parked in the store
    pub async fn collect(&self, data: &HeartbeatData) -> BTreeMap<NodeId, NodeMetrics> {
        let mut metrics = data.metrics.clone();
        if data.stored.is_empty() {
            return metrics;
        }

        let Some(store) = &self.store else {
            debug!(
                nodes = data.stored.len(),
                "Heartbeat references stored metrics but no store is configured"
            );
            return metrics;
        };

        let ids: Vec<NodeId> = data.stored.iter().copied().collect();
        match timeout(self.store_timeout, store.get(&ids)).await {
            Ok(Ok(stored)) => metrics.extend(stored),
            Ok(Err(e)) => warn!(error = %e, "Failed to read metrics from store"),
            Err(_) => warn!("Timed out reading metrics from store"),
        }
        metrics
    }

    /// Add the local node's metrics to a heartbeat
    pub async fn contribute(&self, local: NodeId, data: &mut HeartbeatData, metrics: NodeMetrics) {
        if let Some(store) = &self.store {
            match timeout(self.store_timeout, store.put(local, &metrics)).await {
                Ok(Ok(())) => {
                    data.metrics.remove(&local);
                    data.stored.insert(local);
                    return;
                }
                Ok(Err(e)) => warn!(error = %e, "Metrics store write failed, sending inline"),
                Err(_) => warn!("Metrics store write timed out, sending inline"),
            }
        }
        data.stored.remove(&local);
        data.metrics.insert(local, metrics);
    }
}
