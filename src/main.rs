//! `pos-sync` daemon: keeps the till's sale queue draining to the backend.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use cybercafe_pos_sync::{
    logging, EngineConfig, HttpHealthProbe, HttpTransactionGateway, MonitorSettings, QueueStore,
    ReachabilityMonitor, SyncEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env();
    let _log_guard = logging::init(&config.log_dir)
        .with_context(|| format!("failed to initialise logging in {}", config.log_dir.display()))?;
    info!("Starting pos-sync v{}", env!("CARGO_PKG_VERSION"));

    let (store, store_error) =
        QueueStore::open_or_volatile(&config.db_path).context("failed to open sale queue")?;
    if let Some(e) = store_error {
        warn!(error = %e, "Running on a volatile queue; restart after fixing the data directory");
    }
    config
        .apply_local_settings(store.database())
        .context("failed to load local settings")?;
    info!(api = %config.api_base_url, db = %config.db_path.display(), "Configuration loaded");

    let gateway = Arc::new(HttpTransactionGateway::new(&config).context("failed to build API client")?);
    let probe = Arc::new(HttpHealthProbe::new(&config).context("failed to build health probe")?);

    // Offline until the first probe answers.
    let monitor = ReachabilityMonitor::new(probe, MonitorSettings::from(&config), false);
    let engine = SyncEngine::new(store, gateway, monitor.clone(), &config);

    let _network_log = monitor.subscribe(|online| info!(online = *online, "Network status changed"));
    let _sync_log = engine.subscribe(|event| info!(?event, "Sync event"));

    let status = engine.status().context("failed to read queue status")?;
    info!(
        actionable = status.actionable,
        failed = status.failed,
        durable = status.durable,
        "Sale queue opened"
    );

    let sync_task = engine.start().context("failed to start sync engine")?;
    let monitor_task = monitor.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    engine.shutdown();
    monitor.shutdown();
    let (sync_result, monitor_result) = tokio::join!(sync_task, monitor_task);
    if let Err(e) = sync_result {
        warn!(error = %e, "Sync loop ended abnormally");
    }
    if let Err(e) = monitor_result {
        warn!(error = %e, "Reachability monitor ended abnormally");
    }

    info!("pos-sync stopped");
    Ok(())
}
