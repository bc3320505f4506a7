//! Prometheus metrics exporter
//!
//! HTTP endpoint for Prometheus scraping, fed from the atomic counters.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use super::counters::METRICS;
use crate::config::MetricsConfig;

/// Initialize the Prometheus metrics exporter
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    describe_counter!("ssrlocal_tunnels_total", "Total tunnels accepted");
    describe_gauge!("ssrlocal_tunnels_active", "Currently active tunnels");
    describe_counter!("ssrlocal_handshake_failures", "Rejected SOCKS5 handshakes");
    describe_counter!("ssrlocal_resolve_failures", "Upstream resolve failures");
    describe_counter!("ssrlocal_connect_failures", "Upstream connect failures");
    describe_counter!("ssrlocal_timeouts_total", "Idle timeouts");
    describe_counter!("ssrlocal_errors_total", "Tunnel errors");
    describe_counter!("ssrlocal_bytes_up", "Plaintext bytes client to server");
    describe_counter!("ssrlocal_bytes_down", "Plaintext bytes server to client");

    PrometheusBuilder::new()
        .with_http_listener(config.bind_addr)
        .install()?;

    tokio::spawn(sync_metrics_task());

    Ok(())
}

/// Periodically sync the atomic counters into the metrics registry.
async fn sync_metrics_task() {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut last = METRICS.snapshot();

    loop {
        interval.tick().await;
        let snapshot = METRICS.snapshot();

        let delta = snapshot.tunnels_total.saturating_sub(last.tunnels_total);
        if delta > 0 {
            counter!("ssrlocal_tunnels_total").increment(delta);
        }

        gauge!("ssrlocal_tunnels_active").set(snapshot.tunnels_active as f64);

        let delta = snapshot
            .handshake_failures
            .saturating_sub(last.handshake_failures);
        if delta > 0 {
            counter!("ssrlocal_handshake_failures").increment(delta);
        }

        let delta = snapshot
            .resolve_failures
            .saturating_sub(last.resolve_failures);
        if delta > 0 {
            counter!("ssrlocal_resolve_failures").increment(delta);
        }

        let delta = snapshot
            .connect_failures
            .saturating_sub(last.connect_failures);
        if delta > 0 {
            counter!("ssrlocal_connect_failures").increment(delta);
        }

        let delta = snapshot.timeouts_total.saturating_sub(last.timeouts_total);
        if delta > 0 {
            counter!("ssrlocal_timeouts_total").increment(delta);
        }

        let delta = snapshot.errors_total.saturating_sub(last.errors_total);
        if delta > 0 {
            counter!("ssrlocal_errors_total").increment(delta);
        }

        let delta = snapshot.bytes_up.saturating_sub(last.bytes_up);
        if delta > 0 {
            counter!("ssrlocal_bytes_up").increment(delta);
        }

        let delta = snapshot.bytes_down.saturating_sub(last.bytes_down);
        if delta > 0 {
            counter!("ssrlocal_bytes_down").increment(delta);
        }

        last = snapshot;
    }
}
