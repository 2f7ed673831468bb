// src/exposition.rs
//! Prometheus text exposition of the current snapshots.
//!
//! Rendering only loads `Arc`s from the slots; it never waits on a refresh.
//! Before the first successful cycle the body carries just the meta-metrics,
//! so a scrape always gets something parseable.

use metrics_exporter_prometheus::PrometheusHandle;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::snapshot::{ArtifactView, MetricFamily, MetricValue, SnapshotSlot};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub struct MetricExposer {
    slots: Vec<Arc<SnapshotSlot>>,
    telemetry: Option<PrometheusHandle>,
}

impl MetricExposer {
    pub fn new(slots: Vec<Arc<SnapshotSlot>>) -> Self {
        Self {
            slots,
            telemetry: None,
        }
    }

    /// Append the process telemetry recorder's output to every scrape.
    pub fn with_telemetry(mut self, handle: PrometheusHandle) -> Self {
        self.telemetry = Some(handle);
        self
    }

    pub fn render(&self) -> String {
        let views: Vec<Arc<ArtifactView>> = self.slots.iter().map(|s| s.load()).collect();
        let mut out = render_views(&views);
        if let Some(handle) = &self.telemetry {
            let extra = handle.render();
            if !extra.is_empty() {
                out.push_str(&extra);
                if !extra.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        out
    }
}

/// Data families of every published snapshot, then the meta-metrics.
pub fn render_views(views: &[Arc<ArtifactView>]) -> String {
    let mut out = String::new();
    for view in views {
        for family in &view.snapshot.families {
            render_family(&mut out, family);
        }
    }
    render_meta(&mut out, views);
    out
}

fn render_family(out: &mut String, family: &MetricFamily) {
    let _ = writeln!(out, "# HELP {} {}", family.name, escape_help(&family.help));
    let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind.as_str());
    for (labels, value) in &family.series {
        let pairs: Vec<(&str, &str)> = labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        match value {
            MetricValue::Counter(n) => {
                let _ = writeln!(out, "{}{} {}", family.name, label_block(&pairs), n);
            }
            MetricValue::Gauge(v) => {
                let _ = writeln!(out, "{}{} {}", family.name, label_block(&pairs), format_value(*v));
            }
            MetricValue::Histogram(h) => {
                for (bound, count) in h.bounds.iter().zip(&h.cumulative) {
                    let le = format_value(*bound);
                    let mut with_le = pairs.clone();
                    with_le.push(("le", le.as_str()));
                    let _ = writeln!(out, "{}_bucket{} {}", family.name, label_block(&with_le), count);
                }
                let mut with_inf = pairs.clone();
                with_inf.push(("le", "+Inf"));
                let _ = writeln!(out, "{}_bucket{} {}", family.name, label_block(&with_inf), h.count);
                let _ = writeln!(out, "{}_sum{} {}", family.name, label_block(&pairs), format_value(h.sum));
                let _ = writeln!(out, "{}_count{} {}", family.name, label_block(&pairs), h.count);
            }
        }
    }
}

fn render_meta(out: &mut String, views: &[Arc<ArtifactView>]) {
    meta_gauge(
        out,
        "csv_exporter_last_success_timestamp_seconds",
        "Unix time of the fetch behind the current snapshot (0 before the first success).",
        views,
        |v| {
            v.snapshot
                .fetched_at
                .map(|ts| ts.timestamp_millis() as f64 / 1000.0)
                .unwrap_or(0.0)
        },
    );
    meta_gauge(
        out,
        "csv_exporter_snapshot_generation",
        "Generation number of the current snapshot.",
        views,
        |v| v.snapshot.generation as f64,
    );
    meta_gauge(
        out,
        "csv_exporter_consecutive_failures",
        "Refresh attempts that failed since the last healthy check.",
        views,
        |v| v.health.consecutive_failures as f64,
    );
    meta_gauge(
        out,
        "csv_exporter_rows_dropped",
        "Rows dropped by validation in the cycle behind the current snapshot.",
        views,
        |v| v.snapshot.rows.dropped as f64,
    );
    meta_gauge(
        out,
        "csv_exporter_rows_parsed",
        "Rows accepted in the cycle behind the current snapshot.",
        views,
        |v| v.snapshot.rows.parsed as f64,
    );

    out.push_str("# HELP csv_exporter_failures_total Failed refresh attempts by kind.\n");
    out.push_str("# TYPE csv_exporter_failures_total counter\n");
    for v in views {
        for (kind, n) in [
            ("transient", v.health.transient_failures_total),
            ("permanent", v.health.permanent_failures_total),
        ] {
            let _ = writeln!(
                out,
                "csv_exporter_failures_total{} {}",
                label_block(&[("artifact", v.artifact.as_str()), ("kind", kind)]),
                n
            );
        }
    }
}

fn meta_gauge<F>(out: &mut String, name: &str, help: &str, views: &[Arc<ArtifactView>], value: F)
where
    F: Fn(&ArtifactView) -> f64,
{
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    for v in views {
        let _ = writeln!(
            out,
            "{name}{} {}",
            label_block(&[("artifact", v.artifact.as_str())]),
            format_value(value(v.as_ref()))
        );
    }
}

fn label_block(pairs: &[(&str, &str)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
        .collect();
    format!("{{{}}}", inner.join(","))
}

fn escape_label(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Float formatting accepted by Prometheus parsers.
pub fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}
