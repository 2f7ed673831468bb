// src/pipeline/mod.rs
//! Fetch → parse → compute for one artifact, driven by the refresh scheduler.

pub mod backoff;
pub mod compute;
pub mod fetcher;
pub mod parser;
pub mod scheduler;

use metrics::{describe_counter, describe_histogram};
use once_cell::sync::OnceCell;

pub use compute::MetricComputer;
pub use fetcher::{ArtifactFetcher, ArtifactHandle, FetchOutcome, HttpFetcher};
pub use scheduler::{CycleOutcome, RefreshScheduler, RefreshTrigger, SchedulerSettings, TriggerOutcome};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_histogram!(
            "csv_exporter_fetch_duration_ms",
            "Artifact fetch time in milliseconds."
        );
        describe_counter!(
            "csv_exporter_fetch_outcomes_total",
            "Fetch attempts by outcome (success, not_modified, transient, permanent)."
        );
        describe_counter!(
            "csv_exporter_cycles_total",
            "Refresh cycles by result."
        );
        describe_counter!("csv_exporter_rows_total", "Data rows read from artifacts.");
    });
}
