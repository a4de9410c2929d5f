//! VPN config aggregator binary.
//! Loads settings and the source set, then runs one cycle (`RUN_ONCE=1`) or
//! cycles forever on an interval.
//!
//! Environment:
//!   AGGREGATOR_CONFIG_PATH / AGGREGATOR_SOURCES_PATH  settings and source set
//!   OUTPUT_DIR           where published files go (default `output`)
//!   CYCLE_INTERVAL_SECS  scheduler period (default 1800)
//!   METRICS_ADDR         e.g. `0.0.0.0:9100` to expose Prometheus metrics
//!   LOG_FORMAT=json      JSON log lines instead of compact text

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vpn_config_aggregator::config::{load_sources_default, AggregatorSettings};
use vpn_config_aggregator::metrics::install_exporter;
use vpn_config_aggregator::pipeline::Aggregator;
use vpn_config_aggregator::publish::publish;
use vpn_config_aggregator::scheduler::{spawn_scheduler, SchedulerCfg};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vpn_config_aggregator=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().with_context(|| format!("METRICS_ADDR={addr}"))?;
        install_exporter(addr)?;
    }

    let settings = AggregatorSettings::load_default()?;
    let sources = load_sources_default()?;
    tracing::info!(sources = sources.len(), "source set loaded");

    let output_dir = std::env::var("OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("output"));

    let agg = Arc::new(Aggregator::builder(settings).build()?);

    if env_flag("RUN_ONCE") {
        let result = agg.run_cycle(&sources).await;
        publish(&result, &output_dir)?;
        return Ok(());
    }

    let interval_secs = std::env::var("CYCLE_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(1800);

    let handle = spawn_scheduler(
        agg,
        sources,
        SchedulerCfg {
            interval: Duration::from_secs(interval_secs),
            output_dir: Some(output_dir),
        },
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    handle.abort();
    Ok(())
}
