// src/metrics.rs
use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "aggregator_fetch_attempts_total",
            "Network fetch attempts by outcome."
        );
        describe_counter!("aggregator_fetch_bytes_total", "Body bytes fetched from sources.");
        describe_histogram!(
            "aggregator_fetch_latency_seconds",
            "Latency of a single fetch attempt."
        );
        describe_counter!("aggregator_breaker_opened_total", "Circuit breaker trips.");
        describe_counter!("aggregator_cache_hits_total", "Cache hits by tier.");
        describe_counter!("aggregator_cache_misses_total", "Lookups that missed every tier.");
        describe_counter!("aggregator_cache_evictions_total", "Memory tier LRU evictions.");
        describe_counter!(
            "aggregator_cache_unavailable_total",
            "Cache tier errors degraded to the next tier."
        );
        describe_counter!("aggregator_parse_lines_total", "Candidate lines by parse result.");
        describe_counter!("aggregator_decode_failures_total", "Bodies that could not be decoded.");
        describe_counter!("aggregator_dedup_duplicates_total", "Configurations dropped as duplicates.");
        describe_counter!(
            "aggregator_reputation_transitions_total",
            "Source reputation state changes by target state."
        );
        describe_counter!("aggregator_cycles_total", "Completed aggregation cycles.");
        describe_histogram!("aggregator_cycle_duration_seconds", "Wall time of one cycle.");
        describe_gauge!("aggregator_published_configs", "Configurations published by the last cycle.");
        describe_gauge!("aggregator_last_cycle_ts", "Unix ts when the last cycle finished.");
    });
}

/// Install the Prometheus recorder with its own HTTP listener on `addr`.
/// Must run inside a Tokio runtime.
pub fn install_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing prometheus exporter")?;
    ensure_metrics_described();
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}
