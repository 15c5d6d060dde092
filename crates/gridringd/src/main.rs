//! GridRing daemon - standalone ring member
//!
//! Usage:
//!   # First node (bootstraps a new ring)
//!   gridringd --bind 10.0.0.1:47500
//!
//!   # Further nodes
//!   gridringd --bind 10.0.0.2:47500 --addresses 10.0.0.1:47500..47509
//!
//!   # With Prometheus metrics
//!   gridringd --addresses 10.0.0.1:47500 --metrics-addr 0.0.0.0:9100

mod cli;

use clap::Parser;
use cli::Cli;
use gridring::{init_metrics, Discovery, DiscoveryEvent};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match cli.to_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    let registry = Arc::new(cli.registry()?);

    if let Err(e) = init_metrics(cli.metrics_addr) {
        tracing::warn!("Failed to start metrics exporter: {}", e);
    }

    tracing::info!(
        bind = %config.bind_addr,
        addresses = registry.addresses().len(),
        "Starting gridring node"
    );

    let discovery = Discovery::builder(config)
        .registry(registry)
        .start()
        .await?;

    let topology = discovery.current_snapshot();
    tracing::info!(
        node = %discovery.local_node_id(),
        version = topology.version,
        nodes = topology.len(),
        coordinator = discovery.is_coordinator(),
        "Joined ring"
    );

    let mut events = discovery.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, leaving ring...");

    match discovery.leave().await {
        Ok(()) => tracing::info!("Left ring gracefully"),
        Err(e) => tracing::warn!("Leave did not complete: {}", e),
    }
    printer.abort();

    tracing::info!("Goodbye!");
    Ok(())
}

fn log_event(event: &DiscoveryEvent) {
    let version = event.topology_version();
    match event {
        DiscoveryEvent::NodeJoined { node, .. } => {
            tracing::info!(node = %node.id(), order = node.order, version, "Node joined")
        }
        DiscoveryEvent::NodeLeft { node, .. } => {
            tracing::info!(node = %node.id(), version, "Node left")
        }
        DiscoveryEvent::NodeFailed { node, .. } => {
            tracing::warn!(node = %node.id(), version, "Node failed")
        }
        DiscoveryEvent::NodeMetricsUpdated { node_id, metrics, .. } => {
            tracing::debug!(node = %node_id, sent = metrics.sent_messages, received = metrics.received_messages, "Metrics updated")
        }
        DiscoveryEvent::NodeSegmented { node_id, .. } => {
            tracing::warn!(node = %node_id, "Local node segmented from ring")
        }
        DiscoveryEvent::NodeReconnected {
            previous_id,
            node_id,
            ..
        } => tracing::info!(previous = %previous_id, node = %node_id, version, "Rejoined ring"),
        DiscoveryEvent::Custom { from, data, .. } => {
            tracing::info!(from = %from, bytes = data.len(), "Custom message")
        }
    }
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
