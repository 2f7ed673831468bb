// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod exporter;
pub mod exposition;
pub mod metrics;
pub mod pipeline;
pub mod snapshot;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::config::ExporterConfig;
pub use crate::error::{ConfigError, HeaderError, RowError, RowErrorKind};
pub use crate::exporter::Exporter;
pub use crate::exposition::MetricExposer;
pub use crate::snapshot::{ArtifactView, MetricSnapshot, SnapshotSlot};
