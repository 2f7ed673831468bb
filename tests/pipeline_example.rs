// tests/pipeline_example.rs
//
// End-to-end over the pure stages: parse → compute → render, using the
// requests fixture (three good rows, one with a non-integer id).

use csv_metrics_exporter::config::metric::{LabelSpec, MetricDefinition, Reduction};
use csv_metrics_exporter::config::schema::{ColumnSpec, CsvSchema, FieldType};
use csv_metrics_exporter::exposition::render_views;
use csv_metrics_exporter::pipeline::compute::compute;
use csv_metrics_exporter::pipeline::parser::parse;
use csv_metrics_exporter::snapshot::{ArtifactView, MetricSnapshot, MetricValue, RowStats};
use std::sync::Arc;

const FIXTURE: &str = include_str!("fixtures/requests.csv");

fn schema() -> CsvSchema {
    CsvSchema::new(vec![
        ColumnSpec::new("id", FieldType::Integer).required(),
        ColumnSpec::new("status", FieldType::String),
        ColumnSpec::new("latency_ms", FieldType::Float),
    ])
}

fn definitions() -> Vec<MetricDefinition> {
    vec![
        MetricDefinition::counter("requests_total")
            .with_label(LabelSpec::new("status", ["ok", "err"])),
        MetricDefinition::gauge("latency_avg", "latency_ms", Reduction::Avg),
    ]
}

#[test]
fn fixture_parses_with_one_dropped_row() {
    let out = parse(FIXTURE.as_bytes(), &schema()).expect("header matches");
    assert_eq!(out.total_rows, 4);
    assert_eq!(out.records.len(), 3);
    assert_eq!(out.dropped, 1);
    assert_eq!(out.records.len() + out.dropped, out.total_rows);
    assert_eq!(out.errors[0].line, 5);
}

#[test]
fn fixture_yields_expected_figures() {
    let parsed = parse(FIXTURE.as_bytes(), &schema()).unwrap();
    let families = compute(&parsed.records, &definitions(), &schema()).unwrap();

    let requests = &families[0];
    assert_eq!(requests.value(&[("status", "ok")]), Some(&MetricValue::Counter(2)));
    assert_eq!(requests.value(&[("status", "err")]), Some(&MetricValue::Counter(1)));
    assert_eq!(families[1].value(&[]), Some(&MetricValue::Gauge(20.0)));
}

#[test]
fn rendered_scrape_contains_data_and_meta() {
    let parsed = parse(FIXTURE.as_bytes(), &schema()).unwrap();
    let families = compute(&parsed.records, &definitions(), &schema()).unwrap();

    let mut view = ArtifactView::initial("requests");
    view.snapshot = Arc::new(MetricSnapshot {
        generation: 1,
        fetched_at: Some(chrono::Utc::now()),
        families,
        rows: RowStats {
            total: parsed.total_rows,
            parsed: parsed.records.len(),
            dropped: parsed.dropped,
        },
        ..MetricSnapshot::empty()
    });

    let body = render_views(&[Arc::new(view)]);
    assert!(body.contains("requests_total{status=\"ok\"} 2\n"));
    assert!(body.contains("requests_total{status=\"err\"} 1\n"));
    assert!(body.contains("latency_avg 20\n"));
    assert!(body.contains("csv_exporter_rows_dropped{artifact=\"requests\"} 1\n"));
    assert!(body.contains("csv_exporter_snapshot_generation{artifact=\"requests\"} 1\n"));
}
