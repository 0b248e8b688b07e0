//! Fleet Node Manager
//!
//! Runs a set of worker nodes against the mock provider and transport.
//! Each node provisions a resource, waits for its worker to report ready,
//! forwards commands and tears the resource down on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_node_manager::actors::{ActorSystem, WorkerNode, WorkerNodeHandle};
use fleet_node_manager::config::Config;
use fleet_node_manager::provider::MockProvider;
use fleet_node_manager::transport::MockTransport;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Simulated worker boot time after the instance exists.
const WORKER_BOOT_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on waiting for nodes to reach Terminated after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(90);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_count = config.node_count,
        image_id = %config.spec.image_id,
        instance_type = %config.spec.instance_type,
        health_check_interval_secs = config.worker.health_check_interval.as_secs(),
        "Starting fleet node manager"
    );

    let provider = Arc::new(MockProvider::new());
    let transport = Arc::new(MockTransport::new());
    let mut system = ActorSystem::new();

    let nodes: Vec<WorkerNodeHandle> = (0..config.node_count)
        .map(|_| {
            WorkerNode::new(
                config.spec.clone(),
                config.worker.clone(),
                Arc::clone(&provider),
                Arc::clone(&transport),
            )
            .spawn(&mut system)
        })
        .collect();

    for node in &nodes {
        tokio::spawn(simulate_worker(node.clone()));
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    for node in &nodes {
        if let Err(e) = node.shutdown().await {
            warn!(node_id = %node.node_id(), error = %e, "Node already stopped");
        }
    }

    for node in &nodes {
        match tokio::time::timeout(SHUTDOWN_GRACE, node.wait_terminated()).await {
            Ok(status) => info!(
                node_id = %node.node_id(),
                forwarded = status.forwarded,
                failed = status.failed,
                last_error = ?status.last_error,
                "Node terminated"
            ),
            Err(_) => error!(node_id = %node.node_id(), "Node did not terminate in time"),
        }
    }

    system.stop_all(Duration::from_secs(5)).await;

    info!(
        creates = provider.create_calls(),
        destroys = provider.destroy_calls(),
        "Node manager shutdown complete"
    );
    Ok(())
}

/// Stand-in for the worker process: reports ready once the instance exists,
/// then sends one command through the node.
async fn simulate_worker(node: WorkerNodeHandle) {
    let status = node.wait_for(|s| s.instance_id.is_some() || !s.is_live()).await;
    if !status.is_live() {
        return;
    }

    tokio::time::sleep(WORKER_BOOT_DELAY).await;
    if node.notify_ready().await.is_err() {
        return;
    }

    match node.request(serde_json::json!({ "op": "ping" })).await {
        Ok(Ok(response)) => info!(node_id = %node.node_id(), response = %response, "Worker answered"),
        Ok(Err(failed)) => warn!(node_id = %node.node_id(), error = %failed, "Command failed"),
        Err(e) => warn!(node_id = %node.node_id(), error = %e, "Node stopped before replying"),
    }
}
