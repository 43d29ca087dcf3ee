use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ── Request-driven ──────────────────────────────────────────────

/// Counter: availability verdicts. Labels: result (available, unavailable, error).
pub const AVAILABILITY_CHECKS_TOTAL: &str = "roomwarden_availability_checks_total";

/// Counter: timetable conflict checks. Labels: outcome (clear, conflict).
pub const CONFLICT_CHECKS_TOTAL: &str = "roomwarden_conflict_checks_total";

/// Histogram: conflict check latency in seconds.
pub const CONFLICT_CHECK_DURATION_SECONDS: &str = "roomwarden_conflict_check_duration_seconds";

/// Counter: reservation status changes. Labels: from, to, trigger.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "roomwarden_reservation_transitions_total";

// ── Background work ─────────────────────────────────────────────

/// Histogram: sweep duration in seconds. Labels: sweep.
pub const SWEEP_DURATION_SECONDS: &str = "roomwarden_sweep_duration_seconds";

/// Counter: per-item sweep failures. Labels: sweep.
pub const SWEEP_ERRORS_TOTAL: &str = "roomwarden_sweep_errors_total";

/// Counter: timetable cache rebuilds.
pub const CACHE_REFRESHES_TOTAL: &str = "roomwarden_cache_refreshes_total";

/// Counter: outbound notification deliveries that failed.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "roomwarden_notification_failures_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomwarden_wal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomwarden_wal_flush_batch_size";

/// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus metrics exporter")?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
