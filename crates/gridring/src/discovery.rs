//! Discovery handle
//!
//! [`Discovery`] is the upward API of the ring. Starting it binds the
//! listener, spawns the message worker and waits until the local node is a
//! visible ring member. Everything else reads published snapshots or sends
//! commands to the worker; no caller ever blocks the worker.
//!
//! ```rust,ignore
//! use gridring::{Discovery, DiscoveryConfig, StaticAddressRegistry};
//! use std::sync::Arc;
//!
//! let config = DiscoveryConfig::builder()
//!     .bind_addr("0.0.0.0:47500".parse()?)
//!     .build()?;
//! let registry = Arc::new(StaticAddressRegistry::parse("10.0.0.1:47500..47509")?);
//!
//! let discovery = Discovery::builder(config).registry(registry).start().await?;
//! let mut events = discovery.subscribe();
//! while let Some(event) = events.recv().await {
//!     println!("{} at version {}", event.type_code(), event.topology_version());
//! }
//! ```

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::event::{DiscoveryEvent, EventBus};
use crate::heartbeat::{MetricsExchanger, MetricsProvider};
use crate::metrics_store::MetricsStore;
use crate::node::{NodeId, NodeInfo, RingNode};
use crate::registry::{AddressRegistry, StaticAddressRegistry};
use crate::ring::TopologySnapshot;
use crate::transport::{self, ServerContext};
use crate::worker::{Command, MessageWorker, WorkerContext, WorkerEvent};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Assembles a [`Discovery`] instance
pub struct DiscoveryBuilder {
    config: DiscoveryConfig,
    registry: Option<Arc<dyn AddressRegistry>>,
    metrics_store: Option<Arc<dyn MetricsStore>>,
    metrics_provider: Option<Arc<dyn MetricsProvider>>,
}

impl DiscoveryBuilder {
    /// Address registry used to find the ring (defaults to
    /// [`StaticAddressRegistry::from_env`])
    pub fn registry(mut self, registry: Arc<dyn AddressRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Shared store for heartbeat metrics
    pub fn metrics_store(mut self, store: Arc<dyn MetricsStore>) -> Self {
        self.metrics_store = Some(store);
        self
    }

    /// Source of application metrics published with every heartbeat
    pub fn metrics_provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.metrics_provider = Some(provider);
        self
    }

    /// Bind, join the ring and return once the local node is visible
    pub async fn start(self) -> Result<Discovery> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(StaticAddressRegistry::from_env()?),
        };

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            DiscoveryError::ConnectionFailed(format!("bind {}: {}", config.bind_addr, e))
        })?;
        let local_addrs = advertised_addrs(&config, listener.local_addr()?);

        let node_id = config.node_id.unwrap_or_default();
        let info = NodeInfo::new(node_id, local_addrs.clone())
            .with_attributes(config.attributes.clone());

        let (inbox_tx, inbox) = mpsc::channel(config.inbox_capacity);
        let (snapshot_tx, snapshot) = watch::channel(Arc::new(TopologySnapshot::empty(node_id)));
        let events = Arc::new(EventBus::new());
        let join_token = Arc::new(Mutex::new(Uuid::new_v4()));

        let listener_task = tokio::spawn(transport::serve(
            listener,
            ServerContext {
                inbox: inbox_tx.clone(),
                snapshot: snapshot.clone(),
                join_token: join_token.clone(),
                network_timeout: config.network_timeout,
            },
        ));

        let worker = MessageWorker::new(WorkerContext {
            config: config.clone(),
            info,
            registry,
            exchanger: MetricsExchanger::new(
                self.metrics_store,
                self.metrics_provider,
                config.network_timeout,
            ),
            inbox,
            inbox_tx: inbox_tx.clone(),
            snapshot_tx,
            events: events.clone(),
            join_token,
        });
        let (started_tx, started_rx) = oneshot::channel();
        let worker_task = tokio::spawn(worker.run(started_tx));

        info!(node = %node_id, addrs = ?local_addrs, "Discovery starting");

        let started = started_rx.await.unwrap_or(Err(DiscoveryError::ShuttingDown));
        if let Err(e) = started {
            worker_task.abort();
            listener_task.abort();
            return Err(e);
        }

        Ok(Discovery {
            config,
            local_addrs,
            commands: inbox_tx,
            snapshot,
            events,
            worker: worker_task,
            listener: listener_task,
        })
    }
}

/// Addresses peers should use; unspecified IPs are replaced by loopback
fn advertised_addrs(config: &DiscoveryConfig, bound: SocketAddr) -> Vec<SocketAddr> {
    if !config.advertise_addrs.is_empty() {
        return config.advertise_addrs.clone();
    }
    if bound.ip().is_unspecified() {
        warn!(
            bound = %bound,
            "Listener bound to an unspecified address without advertise addresses, advertising loopback"
        );
        let ip = match bound.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        };
        return vec![SocketAddr::new(ip, bound.port())];
    }
    vec![bound]
}

/// Handle of a running ring member
pub struct Discovery {
    config: Arc<DiscoveryConfig>,
    local_addrs: Vec<SocketAddr>,
    commands: mpsc::Sender<WorkerEvent>,
    snapshot: watch::Receiver<Arc<TopologySnapshot>>,
    events: Arc<EventBus>,
    worker: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("local_node_id", &self.local_node_id())
            .field("local_addrs", &self.local_addrs)
            .field("topology_version", &self.current_snapshot().version)
            .finish()
    }
}

impl Discovery {
    pub fn builder(config: DiscoveryConfig) -> DiscoveryBuilder {
        DiscoveryBuilder {
            config,
            registry: None,
            metrics_store: None,
            metrics_provider: None,
        }
    }

    /// Latest published topology
    pub fn current_snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Run `handler` for every future event on a background task
    pub fn on_event<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(DiscoveryEvent) + Send + 'static,
    {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                handler(event);
            }
        })
    }

    /// Current local identity; changes after a rejoin
    pub fn local_node_id(&self) -> NodeId {
        self.snapshot.borrow().local
    }

    pub fn is_coordinator(&self) -> bool {
        self.snapshot.borrow().is_coordinator()
    }

    pub fn node(&self, id: NodeId) -> Option<RingNode> {
        self.snapshot.borrow().node(id).cloned()
    }

    pub fn remote_nodes(&self) -> Vec<RingNode> {
        self.snapshot.borrow().remote_nodes()
    }

    /// Start time of the ring's first node (unix millis)
    pub fn grid_start_time(&self) -> u64 {
        self.snapshot.borrow().grid_start_time
    }

    /// Addresses advertised for the local node
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Check if a ring member answers a ping under its own identity
    pub async fn ping_node(&self, id: NodeId) -> bool {
        let local = self.local_node_id();
        if id == local {
            return true;
        }
        let Some(node) = self.node(id) else {
            return false;
        };
        matches!(
            transport::ping(node.addrs(), local, &self.config).await,
            Ok((found, _)) if found == id
        )
    }

    /// Broadcast application data to every member in ring order
    pub async fn send_custom(&self, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendCustom { data, reply }).await?;
        rx.await.map_err(|_| DiscoveryError::ShuttingDown)?
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn await_topology<F>(&self, predicate: F, limit: Duration) -> Result<Arc<TopologySnapshot>>
    where
        F: FnMut(&Arc<TopologySnapshot>) -> bool,
    {
        let mut snapshot = self.snapshot.clone();
        let found = match tokio::time::timeout(limit, snapshot.wait_for(predicate)).await {
            Ok(Ok(found)) => Ok(found.clone()),
            Ok(Err(_)) => Err(DiscoveryError::ShuttingDown),
            Err(_) => Err(DiscoveryError::Timeout),
        };
        found
    }

    /// Leave the ring gracefully and stop
    pub async fn leave(mut self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Leave { reply }).await?;
        let limit = self.config.leave_timeout + self.config.network_timeout * 2;
        let result = match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DiscoveryError::ShuttingDown),
            Err(_) => Err(DiscoveryError::Timeout),
        };
        let _ = (&mut self.worker).await;
        result
    }

    /// Stop without announcing it; peers detect the failure
    pub fn terminate(self) {
        info!(node = %self.local_node_id(), "Terminating discovery");
    }

    /// Stop the worker at the next event without leaving
    pub async fn stop(mut self) {
        let _ = self.command(Command::Stop).await;
        let _ = (&mut self.worker).await;
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(WorkerEvent::Command(command))
            .await
            .map_err(|_| DiscoveryError::ShuttingDown)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.worker.abort();
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_loopback_for_unspecified_bind() {
        let config = DiscoveryConfig::default();
        let bound: SocketAddr = "0.0.0.0:47501".parse().unwrap();
        assert_eq!(
            advertised_addrs(&config, bound),
            vec!["127.0.0.1:47501".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn test_explicit_advertise_addresses_win() {
        let public: SocketAddr = "10.1.2.3:47500".parse().unwrap();
        let config = DiscoveryConfig::builder()
            .advertise_addr(public)
            .build()
            .unwrap();
        assert_eq!(
            advertised_addrs(&config, "0.0.0.0:47500".parse().unwrap()),
            vec![public]
        );
    }
}
