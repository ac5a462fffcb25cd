//! Headless sync daemon.
//!
//! Usage: `pos-sync [config.json]`. Keeps the offline queue draining against
//! the POS server until Ctrl-C.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use small_pos_sync::{
    db, logging, HttpRemote, NetworkObserver, NetworkStatus, ReachabilityProbe, RemoteService,
    SyncConfig, SyncContext, SyncEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path.as_deref()).context("loading sync config")?;

    let _log_guard = logging::init(&config.log_dir()).context("initialising logging")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        built_at = env!("BUILD_TIMESTAMP"),
        "Starting pos-sync"
    );

    let db = Arc::new(db::init(&config.data_dir).context("opening offline store")?);
    let remote = Arc::new(
        HttpRemote::new(
            &config.server_url,
            &config.api_key,
            config.request_timeout(),
            config.connectivity_timeout(),
        )
        .context("configuring POS server client")?,
    );
    info!(server = remote.base_url(), "POS server configured");

    let probe: Arc<dyn ReachabilityProbe> = remote.clone();
    let network = Arc::new(NetworkObserver::new(
        NetworkStatus::ONLINE,
        Some(probe),
        config.connectivity_timeout(),
    ));
    network.check_now().await;

    let service: Arc<dyn RemoteService> = remote;
    let engine = Arc::new(SyncEngine::new(
        db,
        service,
        network.clone(),
        config.sync_settings(),
    ));
    let context = SyncContext::new(engine.clone());

    let monitor_cancel = CancellationToken::new();
    let monitor = network
        .clone()
        .spawn_monitor(config.network_poll_interval(), monitor_cancel.clone());
    let handle = engine.start();

    let first = context.trigger_sync().await;
    info!(
        status = ?first.status,
        synced = first.synced,
        failed = first.failed,
        "Startup sync finished"
    );
    info!(snapshot = ?context.snapshot(), "Sync state");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    monitor_cancel.cancel();
    if let Err(e) = monitor.await {
        warn!(error = %e, "Network monitor ended abnormally");
    }
    handle.shutdown().await;
    info!("pos-sync stopped");
    Ok(())
}
