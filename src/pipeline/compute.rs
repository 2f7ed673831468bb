// src/pipeline/compute.rs
//! Folding parsed records into metric families.
//!
//! Pure: no I/O, no clock, no hidden ordering. Families come out in
//! definition order and series are keyed by `BTreeMap`, so equal input
//! gives equal output.

use std::collections::{BTreeMap, HashSet};

use crate::config::metric::{MetricDefinition, MetricKind, Reduction};
use crate::config::schema::CsvSchema;
use crate::error::ConfigError;
use crate::pipeline::parser::ParsedRecord;
use crate::snapshot::{HistogramValue, LabelSet, MetricFamily, MetricValue};

/// Label value for anything outside an allow-list.
pub const OTHER_LABEL: &str = "other";

struct CompiledLabel {
    name: String,
    position: usize,
    allow: HashSet<String>,
}

struct CompiledDefinition {
    def: MetricDefinition,
    field: Option<usize>,
    filter: Option<usize>,
    labels: Vec<CompiledLabel>,
}

/// Definitions resolved against one schema.
pub struct MetricComputer {
    defs: Vec<CompiledDefinition>,
}

#[derive(Default)]
struct GaugeAcc {
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
    latest: f64,
}

impl GaugeAcc {
    fn push(&mut self, v: f64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.count += 1;
        self.latest = v;
    }

    fn reduce(&self, how: Reduction) -> f64 {
        match how {
            Reduction::Latest => self.latest,
            Reduction::Sum => self.sum,
            Reduction::Avg => self.sum / self.count as f64,
            Reduction::Min => self.min,
            Reduction::Max => self.max,
        }
    }
}

impl MetricComputer {
    pub fn new(schema: &CsvSchema, definitions: &[MetricDefinition]) -> Result<Self, ConfigError> {
        let resolve = |def: &MetricDefinition, field: &str| {
            schema
                .position(field)
                .ok_or_else(|| ConfigError::metric(&def.name, format!("unknown field '{field}'")))
        };

        let mut defs = Vec::with_capacity(definitions.len());
        for def in definitions {
            let field = match (&def.field, def.kind) {
                (Some(f), _) => Some(resolve(def, f)?),
                (None, MetricKind::Counter) => None,
                (None, _) => return Err(ConfigError::metric(&def.name, "needs a source field")),
            };
            let filter = def
                .filter
                .as_ref()
                .map(|f| resolve(def, &f.field))
                .transpose()?;
            let labels = def
                .labels
                .iter()
                .map(|l| {
                    Ok(CompiledLabel {
                        name: l.label_name().to_string(),
                        position: resolve(def, &l.field)?,
                        allow: l.allow.iter().cloned().collect(),
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;
            defs.push(CompiledDefinition {
                def: def.clone(),
                field,
                filter,
                labels,
            });
        }
        Ok(Self { defs })
    }

    pub fn compute(&self, records: &[ParsedRecord]) -> Vec<MetricFamily> {
        self.defs.iter().map(|d| d.fold(records)).collect()
    }
}

impl CompiledDefinition {
    fn matches(&self, rec: &ParsedRecord) -> bool {
        match (&self.def.filter, self.filter) {
            (Some(f), Some(pos)) => f.matches(rec.get(pos).map(|v| v.text()).as_deref()),
            _ => true,
        }
    }

    fn label_set(&self, rec: &ParsedRecord) -> LabelSet {
        self.labels
            .iter()
            .map(|l| {
                let value = rec
                    .get(l.position)
                    .map(|v| v.text().into_owned())
                    .filter(|v| l.allow.contains(v))
                    .unwrap_or_else(|| OTHER_LABEL.to_string());
                (l.name.clone(), value)
            })
            .collect()
    }

    fn numeric(&self, rec: &ParsedRecord) -> Option<f64> {
        self.field
            .and_then(|pos| rec.get(pos))
            .and_then(|v| v.as_f64())
    }

    fn fold(&self, records: &[ParsedRecord]) -> MetricFamily {
        let matching = records.iter().filter(|r| self.matches(r));
        let mut series = BTreeMap::new();

        match self.def.kind {
            MetricKind::Counter => {
                let mut counts: BTreeMap<LabelSet, u64> = BTreeMap::new();
                for rec in matching {
                    *counts.entry(self.label_set(rec)).or_default() += 1;
                }
                if self.labels.is_empty() && counts.is_empty() {
                    counts.insert(Vec::new(), 0);
                }
                series.extend(counts.into_iter().map(|(k, v)| (k, MetricValue::Counter(v))));
            }
            MetricKind::Gauge => {
                let mut accs: BTreeMap<LabelSet, GaugeAcc> = BTreeMap::new();
                for rec in matching {
                    if let Some(v) = self.numeric(rec) {
                        accs.entry(self.label_set(rec)).or_default().push(v);
                    }
                }
                series.extend(
                    accs.into_iter()
                        .map(|(k, acc)| (k, MetricValue::Gauge(acc.reduce(self.def.reduce)))),
                );
            }
            MetricKind::Histogram => {
                let mut hists: BTreeMap<LabelSet, HistogramValue> = BTreeMap::new();
                for rec in matching {
                    if let Some(v) = self.numeric(rec) {
                        hists
                            .entry(self.label_set(rec))
                            .or_insert_with(|| HistogramValue::new(self.def.buckets.clone()))
                            .observe(v);
                    }
                }
                if self.labels.is_empty() && hists.is_empty() {
                    hists.insert(Vec::new(), HistogramValue::new(self.def.buckets.clone()));
                }
                series.extend(hists.into_iter().map(|(k, h)| (k, MetricValue::Histogram(h))));
            }
        }

        MetricFamily {
            name: self.def.name.clone(),
            help: self.help(),
            kind: self.def.kind,
            series,
        }
    }

    fn help(&self) -> String {
        if let Some(h) = &self.def.help {
            return h.clone();
        }
        match (&self.def.field, self.def.kind) {
            (Some(field), MetricKind::Gauge) => {
                let how = format!("{:?}", self.def.reduce).to_lowercase();
                format!("{how} of column {field}")
            }
            (Some(field), MetricKind::Histogram) => format!("distribution of column {field}"),
            _ => "count of matching rows".to_string(),
        }
    }
}

/// One-shot form: resolve `definitions` against `schema` and fold `records`.
pub fn compute(
    records: &[ParsedRecord],
    definitions: &[MetricDefinition],
    schema: &CsvSchema,
) -> Result<Vec<MetricFamily>, ConfigError> {
    Ok(MetricComputer::new(schema, definitions)?.compute(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::metric::{LabelSpec, RowFilter};
    use crate::config::schema::{ColumnSpec, FieldType};
    use crate::pipeline::parser::parse;

    fn schema() -> CsvSchema {
        CsvSchema::new(vec![
            ColumnSpec::new("id", FieldType::Integer).required(),
            ColumnSpec::new("status", FieldType::String),
            ColumnSpec::new("latency_ms", FieldType::Float),
        ])
    }

    fn rows(csv: &str) -> Vec<ParsedRecord> {
        parse(csv.as_bytes(), &schema()).unwrap().records
    }

    const CSV: &str = "id,status,latency_ms\n1,ok,10\n2,err,30\n3,ok,20\n4,timeout,90\n5,,\n";

    #[test]
    fn counter_by_label_folds_unknown_into_other() {
        let defs = [MetricDefinition::counter("requests_total")
            .with_label(LabelSpec::new("status", ["ok", "err"]))];
        let fams = compute(&rows(CSV), &defs, &schema()).unwrap();
        let f = &fams[0];
        assert_eq!(f.value(&[("status", "ok")]), Some(&MetricValue::Counter(2)));
        assert_eq!(f.value(&[("status", "err")]), Some(&MetricValue::Counter(1)));
        // "timeout" and the empty status both land in `other`.
        assert_eq!(f.value(&[("status", "other")]), Some(&MetricValue::Counter(2)));
        assert_eq!(f.series.len(), 3);
    }

    #[test]
    fn counter_with_filter() {
        let defs = [MetricDefinition::counter("ok_total").with_filter(RowFilter {
            field: "status".into(),
            equals: Some("ok".into()),
            one_of: vec![],
        })];
        let fams = compute(&rows(CSV), &defs, &schema()).unwrap();
        assert_eq!(fams[0].value(&[]), Some(&MetricValue::Counter(2)));
    }

    #[test]
    fn unlabeled_counter_with_no_matches_reports_zero() {
        let defs = [MetricDefinition::counter("none_total")];
        let fams = compute(&[], &defs, &schema()).unwrap();
        assert_eq!(fams[0].value(&[]), Some(&MetricValue::Counter(0)));
    }

    #[test]
    fn gauge_reductions() {
        let recs = rows(CSV);
        let g = |r| {
            let defs = [MetricDefinition::gauge("g", "latency_ms", r)];
            match compute(&recs, &defs, &schema()).unwrap()[0].value(&[]) {
                Some(MetricValue::Gauge(v)) => *v,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(g(Reduction::Sum), 150.0);
        assert_eq!(g(Reduction::Avg), 37.5);
        assert_eq!(g(Reduction::Min), 10.0);
        assert_eq!(g(Reduction::Max), 90.0);
        assert_eq!(g(Reduction::Latest), 90.0);
    }

    #[test]
    fn gauge_without_values_emits_no_series() {
        let defs = [MetricDefinition::gauge("g", "latency_ms", Reduction::Avg)];
        let fams = compute(&[], &defs, &schema()).unwrap();
        assert!(fams[0].series.is_empty());
    }

    #[test]
    fn histogram_per_label() {
        let defs = [MetricDefinition::histogram("lat", "latency_ms", vec![15.0, 50.0])
            .with_label(LabelSpec::new("status", ["ok"]))];
        let fams = compute(&rows(CSV), &defs, &schema()).unwrap();
        match fams[0].value(&[("status", "ok")]) {
            Some(MetricValue::Histogram(h)) => {
                assert_eq!(h.cumulative, vec![1, 2]);
                assert_eq!(h.count, 2);
                assert_eq!(h.sum, 30.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match fams[0].value(&[("status", "other")]) {
            Some(MetricValue::Histogram(h)) => assert_eq!(h.count, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn deterministic_for_identical_input() {
        let defs = [
            MetricDefinition::counter("requests_total")
                .with_label(LabelSpec::new("status", ["ok", "err"])),
            MetricDefinition::gauge("latency_avg", "latency_ms", Reduction::Avg),
            MetricDefinition::histogram("lat", "latency_ms", vec![10.0, 100.0]),
        ];
        let recs = rows(CSV);
        let computer = MetricComputer::new(&schema(), &defs).unwrap();
        assert_eq!(computer.compute(&recs), computer.compute(&recs));
    }

    #[test]
    fn unknown_field_is_a_config_error() {
        let defs = [MetricDefinition::gauge("g", "nope", Reduction::Sum)];
        assert!(MetricComputer::new(&schema(), &defs).is_err());
    }
}
