// src/config/metric.rs
//! Static metric definitions: which record fields feed which output series.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    /// Type hint used in the `# TYPE` exposition line.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// How a gauge folds the values of its source field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Value of the last contributing record, in input order.
    #[default]
    Latest,
    Sum,
    Avg,
    Min,
    Max,
}

/// One label dimension taken from a categorical field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabelSpec {
    pub field: String,
    /// Label name; defaults to the field name.
    #[serde(default)]
    pub name: Option<String>,
    /// Accepted values. Anything else is reported as `other`.
    pub allow: Vec<String>,
}

impl LabelSpec {
    pub fn new<I, S>(field: impl Into<String>, allow: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field: field.into(),
            name: None,
            allow: allow.into_iter().map(Into::into).collect(),
        }
    }

    pub fn label_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.field)
    }
}

/// Row predicate evaluated against a field's textual value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RowFilter {
    pub field: String,
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub one_of: Vec<String>,
}

impl RowFilter {
    pub fn matches(&self, value: Option<&str>) -> bool {
        let Some(v) = value else {
            return false;
        };
        if let Some(eq) = &self.equals {
            if v != eq {
                return false;
            }
        }
        self.one_of.is_empty() || self.one_of.iter().any(|o| o == v)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub kind: MetricKind,
    #[serde(default)]
    pub help: Option<String>,
    /// Numeric source field for gauges and histograms.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub reduce: Reduction,
    #[serde(default)]
    pub buckets: Vec<f64>,
    #[serde(default)]
    pub labels: Vec<LabelSpec>,
    #[serde(default)]
    pub filter: Option<RowFilter>,
}

impl MetricDefinition {
    pub fn counter(name: impl Into<String>) -> Self {
        Self::bare(name, MetricKind::Counter)
    }

    pub fn gauge(name: impl Into<String>, field: impl Into<String>, reduce: Reduction) -> Self {
        let mut def = Self::bare(name, MetricKind::Gauge);
        def.field = Some(field.into());
        def.reduce = reduce;
        def
    }

    pub fn histogram(name: impl Into<String>, field: impl Into<String>, buckets: Vec<f64>) -> Self {
        let mut def = Self::bare(name, MetricKind::Histogram);
        def.field = Some(field.into());
        def.buckets = buckets;
        def
    }

    pub fn with_label(mut self, label: LabelSpec) -> Self {
        self.labels.push(label);
        self
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    fn bare(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            help: None,
            field: None,
            reduce: Reduction::default(),
            buckets: Vec::new(),
            labels: Vec::new(),
            filter: None,
        }
    }
}
