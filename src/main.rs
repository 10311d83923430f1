use std::sync::Arc;

use tracing::{info, warn};

use shopslots::compactor;
use shopslots::config::Config;
use shopslots::engine::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    shopslots::observability::init(config.metrics_port)?;

    let engine = Arc::new(Engine::open(&config)?);
    info!("shopslots started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  shops: {}", engine.shop_count());
    info!(
        "  compaction: every {}s past {} appends",
        config.compact_interval.as_secs(),
        config.compact_threshold
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let compactor_task = tokio::spawn(compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    // Graceful shutdown on SIGTERM/ctrl-c
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received");
    compactor_task.abort();
    if let Err(e) = engine.compact_wal().await {
        warn!("final compaction failed: {e}");
    }

    info!("shopslots stopped");
    Ok(())
}
