//! CLI argument parsing for the gridring daemon

use clap::Parser;
use gridring::{DiscoveryConfig, NodeId, StaticAddressRegistry, DEFAULT_PORT};
use std::net::SocketAddr;
use std::time::Duration;

/// GridRing - ring-based membership and failure detection
///
/// Runs a single ring member, logs every topology change and leaves the ring
/// gracefully on Ctrl+C or SIGTERM.
#[derive(Parser, Debug)]
#[command(name = "gridringd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    // ============ Network Configuration ============
    /// Discovery listener bind address
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)), env = "GRIDRING_BIND")]
    pub bind: SocketAddr,

    /// Address advertised to other nodes (repeatable)
    /// Useful in NAT/container environments
    #[arg(long, env = "GRIDRING_ADVERTISE_ADDR", value_delimiter = ',')]
    pub advertise_addr: Vec<SocketAddr>,

    /// Addresses of potential ring members (comma-separated)
    /// Format: host, host:port or host:port1..port2
    #[arg(long, value_delimiter = ',', env = "GRIDRING_DISCOVERY_ADDRESSES")]
    pub addresses: Vec<String>,

    /// Treat the address list as shared, so the coordinator prunes departed nodes
    #[arg(long, env = "GRIDRING_SHARED_REGISTRY")]
    pub shared_registry: bool,

    // ============ Identity ============
    /// Fixed node id (UUID); random when absent
    #[arg(long, env = "GRIDRING_NODE_ID")]
    pub node_id: Option<NodeId>,

    /// Node attribute as key=value (repeatable)
    #[arg(long = "attribute", value_parser = parse_attribute)]
    pub attributes: Vec<(String, String)>,

    // ============ Timing ============
    /// Overall join timeout in milliseconds (0 = retry forever)
    #[arg(long, default_value = "30000", env = "GRIDRING_JOIN_TIMEOUT_MS")]
    pub join_timeout_ms: u64,

    /// Successor probe interval in milliseconds
    #[arg(long, default_value = "1000", env = "GRIDRING_PROBE_INTERVAL_MS")]
    pub probe_interval_ms: u64,

    /// Successor silence in milliseconds before it is suspected
    #[arg(long, default_value = "3000", env = "GRIDRING_FAILURE_DETECTION_TIMEOUT_MS")]
    pub failure_detection_timeout_ms: u64,

    /// Metrics heartbeat frequency in milliseconds
    #[arg(long, default_value = "2000", env = "GRIDRING_HEARTBEAT_FREQUENCY_MS")]
    pub heartbeat_frequency_ms: u64,

    /// Reconnect attempts before a successor is skipped
    #[arg(long, default_value = "2", env = "GRIDRING_RECONNECT_COUNT")]
    pub reconnect_count: u32,

    /// Leave timeout in milliseconds
    #[arg(long, default_value = "5000", env = "GRIDRING_LEAVE_TIMEOUT_MS")]
    pub leave_timeout_ms: u64,

    // ============ Observability ============
    /// Prometheus exporter bind address (disabled when absent)
    #[arg(long, env = "GRIDRING_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}

fn parse_attribute(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

impl Cli {
    /// Convert CLI args to discovery configuration
    pub fn to_config(&self) -> gridring::Result<DiscoveryConfig> {
        let mut builder = DiscoveryConfig::builder()
            .bind_addr(self.bind)
            .join_timeout(Duration::from_millis(self.join_timeout_ms))
            .failure_detection(
                Duration::from_millis(self.probe_interval_ms),
                Duration::from_millis(self.failure_detection_timeout_ms),
            )
            .heartbeat_frequency(Duration::from_millis(self.heartbeat_frequency_ms))
            .reconnect_count(self.reconnect_count)
            .leave_timeout(Duration::from_millis(self.leave_timeout_ms));

        for addr in &self.advertise_addr {
            builder = builder.advertise_addr(*addr);
        }
        if let Some(id) = self.node_id {
            builder = builder.node_id(id);
        }
        for (key, value) in &self.attributes {
            builder = builder.attribute(key.clone(), value.clone());
        }
        builder.build()
    }

    /// Address registry built from `--addresses`
    pub fn registry(&self) -> gridring::Result<StaticAddressRegistry> {
        let registry = StaticAddressRegistry::parse(&self.addresses.join(","))?;
        Ok(registry.shared(self.shared_registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cli() {
        let cli = Cli::parse_from(["gridringd"]);
        assert_eq!(cli.bind.port(), DEFAULT_PORT);
        assert!(cli.addresses.is_empty());

        let config = cli.to_config().unwrap();
        assert_eq!(config.join_timeout, Duration::from_secs(30));
        assert!(cli.registry().unwrap().addresses().is_empty());
    }

    #[test]
    fn test_addresses_and_attributes() {
        let cli = Cli::parse_from([
            "gridringd",
            "--addresses",
            "127.0.0.1:47500..47502,127.0.0.1:48000",
            "--attribute",
            "role=worker",
            "--node-id",
            "67e55044-10b1-426f-9247-bb680e5fe0c8",
        ]);
        assert_eq!(cli.registry().unwrap().addresses().len(), 4);

        let config = cli.to_config().unwrap();
        assert_eq!(config.attributes.get("role").map(String::as_str), Some("worker"));
        assert!(config.node_id.is_some());
    }

    #[test]
    fn test_invalid_timing_is_rejected() {
        let cli = Cli::parse_from([
            "gridringd",
            "--probe-interval-ms",
            "5000",
            "--failure-detection-timeout-ms",
            "1000",
        ]);
        assert!(cli.to_config().is_err());
    }

    #[test]
    fn test_attribute_needs_key() {
        assert!(parse_attribute("=x").is_err());
        assert_eq!(
            parse_attribute("zone=a=b").unwrap(),
            ("zone".to_string(), "a=b".to_string())
        );
    }
}
