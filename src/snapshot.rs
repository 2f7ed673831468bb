// src/snapshot.rs
//! Published metric state and the slot it lives in.
//!
//! A `MetricSnapshot` is built completely, wrapped in an `ArtifactView`
//! together with pipeline health, and swapped into the slot in one atomic
//! store. Readers get an `Arc` to whatever was current when they loaded; the
//! scheduler never mutates a view after publishing it.

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::metric::MetricKind;
use crate::pipeline::fetcher::CacheValidators;

/// Label pairs in definition order.
pub type LabelSet = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramValue {
    pub bounds: Vec<f64>,
    /// Cumulative count per bound (`le` semantics).
    pub cumulative: Vec<u64>,
    pub count: u64,
    pub sum: f64,
}

impl HistogramValue {
    pub fn new(bounds: Vec<f64>) -> Self {
        let cumulative = vec![0; bounds.len()];
        Self {
            bounds,
            cumulative,
            count: 0,
            sum: 0.0,
        }
    }

    pub fn observe(&mut self, v: f64) {
        for (bound, slot) in self.bounds.iter().zip(self.cumulative.iter_mut()) {
            if v <= *bound {
                *slot += 1;
            }
        }
        self.count += 1;
        self.sum += v;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
    Histogram(HistogramValue),
}

/// All series of one configured metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub series: BTreeMap<LabelSet, MetricValue>,
}

impl MetricFamily {
    /// Value for the given label pairs, e.g. `&[("status", "ok")]`.
    pub fn value(&self, labels: &[(&str, &str)]) -> Option<&MetricValue> {
        let key: LabelSet = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.series.get(&key)
    }
}

/// Row accounting for one cycle. `parsed + dropped == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RowStats {
    pub total: usize,
    pub parsed: usize,
    pub dropped: usize,
}

/// Immutable result of one successful cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    /// 0 means nothing has been published yet.
    pub generation: u64,
    pub fetched_at: Option<DateTime<Utc>>,
    pub families: Vec<MetricFamily>,
    pub rows: RowStats,
    pub validators: CacheValidators,
    /// Raw payload the figures were computed from.
    pub payload: Bytes,
}

impl MetricSnapshot {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            fetched_at: None,
            families: Vec::new(),
            rows: RowStats::default(),
            validators: CacheValidators::default(),
            payload: Bytes::new(),
        }
    }

    pub fn is_published(&self) -> bool {
        self.generation > 0
    }

    pub fn family(&self, name: &str) -> Option<&MetricFamily> {
        self.families.iter().find(|f| f.name == name)
    }
}

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Fetching,
    Parsing,
    Computing,
    Published,
    ErrorBackoff,
}

/// Failure bookkeeping, exposed through the same scrape as the data.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineHealth {
    pub consecutive_failures: u64,
    pub transient_failures_total: u64,
    pub permanent_failures_total: u64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What readers see: the current snapshot plus health, swapped together.
#[derive(Debug, Clone)]
pub struct ArtifactView {
    pub artifact: String,
    pub state: CycleState,
    pub snapshot: Arc<MetricSnapshot>,
    pub health: PipelineHealth,
}

impl ArtifactView {
    pub fn initial(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            state: CycleState::Idle,
            snapshot: Arc::new(MetricSnapshot::empty()),
            health: PipelineHealth::default(),
        }
    }
}

/// Single-writer, many-reader holder of the current view.
pub struct SnapshotSlot {
    inner: ArcSwap<ArtifactView>,
}

impl SnapshotSlot {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            inner: ArcSwap::from_pointee(ArtifactView::initial(artifact)),
        }
    }

    /// Lock-free read of the current view.
    pub fn load(&self) -> Arc<ArtifactView> {
        self.inner.load_full()
    }

    /// Replace the current view. Only the scheduler calls this.
    pub fn publish(&self, view: ArtifactView) {
        self.inner.store(Arc::new(view));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let mut h = HistogramValue::new(vec![10.0, 50.0]);
        for v in [5.0, 10.0, 20.0, 70.0] {
            h.observe(v);
        }
        assert_eq!(h.cumulative, vec![2, 3]);
        assert_eq!(h.count, 4);
        assert_eq!(h.sum, 105.0);
    }

    #[test]
    fn readers_keep_their_view_across_publish() {
        let slot = SnapshotSlot::new("a");
        let before = slot.load();
        assert_eq!(before.snapshot.generation, 0);

        let mut next = (*before).clone();
        next.snapshot = Arc::new(MetricSnapshot {
            generation: 1,
            ..MetricSnapshot::empty()
        });
        slot.publish(next);

        assert_eq!(before.snapshot.generation, 0);
        assert_eq!(slot.load().snapshot.generation, 1);
    }
}
