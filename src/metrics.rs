// src/metrics.rs
use anyhow::Context;
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Process telemetry recorder. Its output is appended to `/metrics` by the
/// exposer rather than served from a route of its own.
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already installed.
    pub fn init(artifacts: usize) -> anyhow::Result<Self> {
        // Default buckets; fetch durations are recorded in milliseconds.
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        gauge!("csv_exporter_configured_artifacts").set(artifacts as f64);

        Ok(Self { handle })
    }
}
