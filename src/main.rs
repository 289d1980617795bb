use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use pgfleet::config::{self, Config};
use pgfleet::failover::{FailoverOrchestrator, PgFailoverActions};
use pgfleet::inventory::{MemoryInventory, StaticCredentials};
use pgfleet::metrics::start_metrics_server;
use pgfleet::pool::PoolManager;
use pgfleet::replication::ReplicationTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();

    // External-collaborator stand-ins, seeded from config
    let inventory = Arc::new(MemoryInventory::from_config(
        &config.clusters,
        config.pool.connect_timeout_ms,
    ));
    let credentials = Arc::new(StaticCredentials::from_config(&config.credentials));
    let fallback = credentials.defaults();

    // Pool manager with its idle-eviction timer
    let pool_manager = Arc::new(PoolManager::new(
        inventory.clone(),
        credentials,
        fallback,
        config.pool.clone(),
    ));
    let shutdown = CancellationToken::new();
    let cleanup_task = pool_manager
        .clone()
        .spawn_cleanup_task(shutdown.child_token());

    // Topology tracker and failover orchestrator
    let tracker = Arc::new(ReplicationTracker::new(
        pool_manager.clone(),
        inventory.clone(),
        config.health.clone(),
    ));
    let actions = Arc::new(PgFailoverActions::new(pool_manager.clone()));
    let orchestrator = FailoverOrchestrator::new(
        tracker.clone(),
        inventory.clone(),
        actions,
        config.failover.clone(),
        config.health.clone(),
    );

    info!(
        clusters = config.clusters.len(),
        "pgfleet core started"
    );

    // Startup connectivity probes, logged only
    for cluster in &config.clusters {
        for instance in &cluster.instances {
            let check = pool_manager.test_connection(&instance.id).await;
            if check.success {
                info!(
                    instance_id = %instance.id,
                    latency_ms = check.latency_ms,
                    version = check.version.as_deref().unwrap_or("unknown"),
                    "Instance reachable"
                );
            } else {
                warn!(
                    instance_id = %instance.id,
                    message = %check.message,
                    "Instance unreachable at startup"
                );
            }
        }
    }

    // Metrics endpoint
    let metrics_addr = config.server.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(&metrics_addr).await {
            warn!(error = %e, "Metrics server stopped");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    orchestrator.shutdown();
    shutdown.cancel();
    let _ = cleanup_task.await;
    pool_manager.close_all().await;

    info!("Shutdown complete");
    Ok(())
}

fn load_or_default_config() -> Config {
    // Try to load from config file
    let config_paths = ["config/pgfleet.toml", "pgfleet.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
