use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use roomwarden::config::Config;
use roomwarden::engine::{Engine, EngineOptions};
use roomwarden::notify::{LogMailer, NotifyHub};
use roomwarden::{observability, sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    observability::init_tracing(&config.log_level, config.log_json)?;
    observability::init_metrics(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let notify = Arc::new(NotifyHub::with_mailer(Arc::new(LogMailer)));
    let engine = Arc::new(
        Engine::with_options(
            config.wal_path(),
            notify,
            EngineOptions {
                policy: config.policy.clone(),
                cache_timeout: config.cache_timeout,
            },
        )
        .with_context(|| format!("opening journal {}", config.wal_path().display()))?,
    );

    info!("roomwarden running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  auto-rejection at: {}", config.auto_reject_at);
    info!("  status refresh every: {}s", config.status_sweep_interval.as_secs());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let tasks = [
        tokio::spawn(sweeper::run_auto_rejection(engine.clone(), config.auto_reject_at)),
        tokio::spawn(sweeper::run_status_refresh(engine.clone(), config.status_sweep_interval)),
        tokio::spawn(sweeper::run_compactor(engine.clone(), config.compact_threshold)),
    ];

    shutdown_signal().await?;
    info!("shutdown signal received, stopping sweepers");
    for task in &tasks {
        task.abort();
    }

    if let Err(e) = engine.compact_wal().await {
        warn!("final journal compaction failed: {e}");
    }
    info!("roomwarden stopped");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.context("waiting for ctrl-c")?;
    }
    Ok(())
}
