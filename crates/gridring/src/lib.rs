//! # GridRing
//!
//! Ring-based membership and failure detection for compute and data grids:
//! - **Ordered ring**: every member is admitted with a unique, increasing order
//! - **Coordinator verification**: the oldest member verifies every change, so
//!   all members apply the same changes in the same order
//! - **Failure detection**: each node probes its successor and repairs the ring
//!   around nodes that stop answering
//! - **Metrics exchange**: per-node metrics travel with periodic heartbeats
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Discovery handle                      │
//! │     snapshots (watch) · events (subscribe) · commands       │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │        Message worker        │          Listener            │
//! │  • ring state (single owner) │  • ring frames → inbox       │
//! │  • join / admission          │  • probe acks, pings         │
//! │  • forward, verify, retire   │  • join handshakes           │
//! │  • successor link + repair   │                              │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │   Address registry        Metrics store        Prometheus   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Messages travel one direction only, from each node to its successor.
//! A change created by a regular member first travels unverified to the
//! coordinator, which stamps it and sends it once around the ring. When it
//! comes back to the coordinator every live member has applied it.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use gridring::{Discovery, DiscoveryConfig, StaticAddressRegistry};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(StaticAddressRegistry::parse("10.0.0.1:47500..47503")?);
//! let discovery = Discovery::builder(DiscoveryConfig::default())
//!     .registry(registry)
//!     .start()
//!     .await?;
//!
//! let topology = discovery.current_snapshot();
//! println!("version {} with {} nodes", topology.version, topology.len());
//!
//! discovery.leave().await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod detector;
pub mod discovery;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod message;
pub mod metrics_store;
pub mod node;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod ring;
pub(crate) mod transport;
pub(crate) mod worker;

// Re-export main types
pub use config::{DiscoveryConfig, DiscoveryConfigBuilder, DEFAULT_PORT};
pub use discovery::{Discovery, DiscoveryBuilder};
pub use error::{DiscoveryError, Result};
pub use event::{DiscoveryEvent, EventBus};
pub use heartbeat::MetricsProvider;
pub use message::{MessageId, Payload, RingMessage};
pub use metrics_store::{InMemoryMetricsStore, MetricsStore};
pub use node::{NodeId, NodeInfo, NodeMetrics, NodeState, RingNode};
pub use observability::{init_metrics, NetworkMetrics, RingMetrics};
pub use protocol::{Frame, JoinResponse, PROTOCOL_VERSION};
pub use registry::{AddressRegistry, StaticAddressRegistry, ADDRESSES_ENV};
pub use ring::TopologySnapshot;
