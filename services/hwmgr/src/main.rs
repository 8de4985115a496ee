//! Hardware manager controller.
//!
//! Reconciles NodePool requests against the hardware inventory kept in the
//! local state store.

use std::sync::Arc;

use anyhow::{Context, Result};
use hwmgr::{
    allocation::{AllocationEngine, AllocationStore, HardwareCatalog},
    config::Config,
    controller::{ControllerWorker, NodePoolReconciler, WorkerConfig},
    provisioner::NodeProvisioner,
    store::{Client, SqliteStore, TimedStore},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to HWMGR_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hardware manager");
    info!(
        namespace = %config.namespace,
        state_path = %config.state_path.display(),
        "Configuration loaded"
    );

    if let Some(parent) = config.state_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;
    }

    let sqlite = match SqliteStore::open(&config.state_path) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open state store");
            return Err(e.into());
        }
    };
    let store = TimedStore::new(Arc::new(sqlite), config.store_timeout);
    let client = Client::new(Arc::new(store)).with_retry_policy(config.retry_policy());

    let allocations = AllocationStore::new(client.clone(), config.namespace.clone());
    if let Some(path) = &config.profiles_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading hardware profiles from {}", path.display()))?;
        let catalog = HardwareCatalog::from_yaml(&text)?;
        allocations.save_catalog(&catalog).await?;
        info!(path = %path.display(), profiles = catalog.profiles.len(), "Hardware profiles loaded");
    }

    let provisioner = NodeProvisioner::new(client.clone(), config.namespace.clone());
    let engine = AllocationEngine::new(allocations, provisioner);
    let reconciler = Arc::new(NodePoolReconciler::new(client.clone(), engine));

    let worker_config = WorkerConfig {
        resync_interval: config.resync_interval,
        ..WorkerConfig::new(config.namespace.clone())
    };
    let worker = ControllerWorker::new(reconciler, client, worker_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Controller worker did not shut down in time");
    }

    info!("Hardware manager shutdown complete");
    Ok(())
}
