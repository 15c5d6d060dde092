//! Observability layer for gridring
//!
//! Lightweight protocol metrics using the `metrics` crate with Prometheus
//! export support. Calls compile to nothing when the `metrics-prometheus`
//! feature is disabled.
//!
//! # Usage
//!
//! ```rust,ignore
//! use gridring::observability::{init_metrics, RingMetrics};
//!
//! // Initialize once at startup
//! init_metrics(Some("0.0.0.0:9464".parse()?))?;
//!
//! RingMetrics::set_topology_version(4);
//! RingMetrics::increment_messages_forwarded("HEARTBEAT");
//! ```

use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Ring Metrics
// ============================================================================

/// Ring membership and message-processing metrics
pub struct RingMetrics;

impl RingMetrics {
    // ---- Counters ----

    /// Ring messages processed, by payload kind
    pub fn increment_messages_processed(kind: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_messages_processed_total", "kind" => kind).increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = kind;
    }

    /// Ring messages forwarded to the successor, by payload kind
    pub fn increment_messages_forwarded(kind: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_messages_forwarded_total", "kind" => kind).increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = kind;
    }

    /// Messages dropped as duplicates
    pub fn increment_duplicates_dropped() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_duplicates_dropped_total").increment(1);
    }

    /// Messages dropped because their hop count exceeded the limit
    pub fn increment_hop_limit_dropped() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_hop_limit_dropped_total").increment(1);
    }

    /// Messages that completed a full circuit
    pub fn increment_messages_retired() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_messages_retired_total").increment(1);
    }

    /// Join requests rejected for a duplicate id
    pub fn increment_duplicate_ids() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_duplicate_ids_total").increment(1);
    }

    /// Successors skipped after failure detection
    pub fn increment_failures_detected() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_failures_detected_total").increment(1);
    }

    /// Ring repairs performed
    pub fn increment_ring_repairs() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_ring_repairs_total").increment(1);
    }

    // ---- Gauges ----

    /// Current topology version
    pub fn set_topology_version(version: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("gridring_topology_version").set(version as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = version;
    }

    /// Number of visible ring members
    pub fn set_ring_size(size: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("gridring_ring_size").set(size as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = size;
    }

    /// Whether this node is the coordinator (1 = yes, 0 = no)
    pub fn set_is_coordinator(is_coordinator: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("gridring_is_coordinator").set(if is_coordinator { 1.0 } else { 0.0 });
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = is_coordinator;
    }

    /// Messages kept for resend after ring repair
    pub fn set_pending_messages(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("gridring_pending_messages").set(count as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = count;
    }

    // ---- Histograms ----

    /// Time from join start to admission
    pub fn record_join_latency(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("gridring_join_latency_seconds").record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = duration;
    }

    /// Time a retired message spent circling the ring
    pub fn record_circuit_latency(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("gridring_circuit_latency_seconds").record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = duration;
    }
}

// ============================================================================
// Network Metrics
// ============================================================================

/// Connection layer metrics
pub struct NetworkMetrics;

impl NetworkMetrics {
    /// Total bytes sent
    pub fn add_bytes_sent(bytes: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_network_bytes_sent_total").increment(bytes);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = bytes;
    }

    /// Total bytes received
    pub fn add_bytes_received(bytes: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_network_bytes_received_total").increment(bytes);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = bytes;
    }

    /// Inbound connections currently served
    pub fn set_active_connections(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("gridring_network_active_connections").set(count as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = count;
    }

    /// Failed connection attempts, by purpose
    pub fn increment_connect_errors(purpose: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("gridring_network_connect_errors_total", "purpose" => purpose)
            .increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = purpose;
    }

    /// Probe round trip on the successor link
    pub fn record_probe_rtt(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("gridring_network_probe_rtt_seconds").record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = duration;
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Initialize the metrics-rs Prometheus exporter
    ///
    /// This starts a HTTP server on the given address that serves `/metrics`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;

        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::init_prometheus_exporter;

// ============================================================================
// Unified Initialization
// ============================================================================

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize metrics subsystem
///
/// Call this once at application startup. Safe to call multiple times.
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = prometheus_addr;

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_metrics_compile() {
        RingMetrics::increment_messages_processed("NODE_ADDED");
        RingMetrics::increment_messages_forwarded("HEARTBEAT");
        RingMetrics::increment_duplicates_dropped();
        RingMetrics::set_topology_version(5);
        RingMetrics::set_is_coordinator(true);
        RingMetrics::record_circuit_latency(Duration::from_millis(3));
    }

    #[test]
    fn test_network_metrics_compile() {
        NetworkMetrics::add_bytes_sent(1024);
        NetworkMetrics::add_bytes_received(2048);
        NetworkMetrics::set_active_connections(2);
        NetworkMetrics::increment_connect_errors("successor");
        NetworkMetrics::record_probe_rtt(Duration::from_micros(250));
    }

    #[test]
    fn test_init_without_exporter() {
        assert!(init_metrics(None).is_ok());
        assert!(init_metrics(None).is_ok());
    }
}
