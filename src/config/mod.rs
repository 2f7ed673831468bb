// src/config/mod.rs
//! Deployment configuration: repository coordinates, refresh cadence,
//! backoff bounds, and the per-artifact schema and metric mapping.
//!
//! Loaded from TOML, patched from the deployment's environment variables,
//! then validated once at startup.

pub mod metric;
pub mod schema;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::metric::{MetricDefinition, MetricKind};
use crate::config::schema::{ColumnSpec, CsvSchema};
use crate::error::ConfigError;
use crate::pipeline::backoff::Backoff;
use crate::pipeline::fetcher::ArtifactHandle;

pub const DEFAULT_CONFIG_PATH: &str = "config/exporter.toml";
pub const ENV_CONFIG_PATH: &str = "EXPORTER_CONFIG_PATH";

pub const ENV_BASE_URL: &str = "ARTIFACTORY_DOCUMENTS_URL";
pub const ENV_USER: &str = "ART_USER";
pub const ENV_PASSWORD: &str = "ART_PASSWORD";
pub const ENV_REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
pub const ENV_SCHEDULE_INTERVAL: &str = "SCHEDULE_INTERVAL";
pub const ENV_LISTEN: &str = "EXPORTER_LISTEN";

/// Prefix reserved for the exporter's own meta-metrics.
pub const RESERVED_PREFIX: &str = "csv_exporter_";

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_interval_secs() -> u64 {
    300
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    300_000
}
fn default_verify_tls() -> bool {
    true
}
fn default_max_body_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_delimiter() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub artifacts: Vec<ArtifactConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub base_url: String,
    /// "ENV" means: read from ART_USER.
    #[serde(default)]
    pub username: Option<String>,
    /// "ENV" means: read from ART_PASSWORD.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: None,
            password: None,
            verify_tls: default_verify_tls(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    pub name: String,
    /// Path relative to `source.base_url`, or an absolute URL.
    pub path: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub ignore_extra_columns: bool,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

impl ArtifactConfig {
    pub fn handle(&self) -> ArtifactHandle {
        ArtifactHandle {
            name: self.name.clone(),
            path: self.path.clone(),
            content_type: self.content_type.clone(),
        }
    }

    pub fn schema(&self) -> CsvSchema {
        let delimiter = self.delimiter.as_bytes().first().copied().unwrap_or(b',');
        CsvSchema::new(self.columns.clone())
            .with_delimiter(delimiter)
            .with_ignore_extra_columns(self.ignore_extra_columns)
    }
}

/// Load, apply env overrides, and validate.
pub fn load_from(path: &Path) -> Result<ExporterConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading exporter config from {}", path.display()))?;
    let mut cfg: ExporterConfig = toml::from_str(&content)
        .with_context(|| format!("parsing exporter config {}", path.display()))?;
    cfg.apply_overrides(|k| std::env::var(k).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

/// $EXPORTER_CONFIG_PATH, falling back to config/exporter.toml.
pub fn load_default() -> Result<ExporterConfig> {
    let path = std::env::var(ENV_CONFIG_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    load_from(&path)
}

fn metric_name_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("metric name regex"))
}

fn label_name_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name regex"))
}

impl ExporterConfig {
    /// Patch values from the environment. `lookup` is `std::env::var` in production.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|s| !s.trim().is_empty()) {
            self.source.base_url = url;
        }
        if let Some(listen) = lookup(ENV_LISTEN).filter(|s| !s.trim().is_empty()) {
            self.server.listen = listen;
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT) {
            self.refresh.request_timeout_secs = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_REQUEST_TIMEOUT} must be whole seconds"))
            })?;
        }
        if let Some(raw) = lookup(ENV_SCHEDULE_INTERVAL) {
            let minutes: u64 = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_SCHEDULE_INTERVAL} must be whole minutes"))
            })?;
            self.refresh.interval_secs = minutes.saturating_mul(60);
        }

        self.source.username = resolve_secret(self.source.username.take(), ENV_USER, &lookup)?;
        self.source.password =
            resolve_secret(self.source.password.take(), ENV_PASSWORD, &lookup)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.artifacts.is_empty() {
            return Err(ConfigError::NoArtifacts);
        }
        if self.refresh.interval_secs == 0 {
            return Err(ConfigError::Invalid("refresh.interval_secs must be > 0".into()));
        }
        if self.refresh.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "refresh.request_timeout_secs must be > 0".into(),
            ));
        }
        if self.refresh.backoff_initial_ms == 0
            || self.refresh.backoff_initial_ms > self.refresh.backoff_max_ms
        {
            return Err(ConfigError::Invalid(
                "refresh.backoff_initial_ms must be > 0 and <= backoff_max_ms".into(),
            ));
        }

        let mut artifact_names = HashSet::new();
        let mut metric_names = HashSet::new();
        for art in &self.artifacts {
            if !artifact_names.insert(art.name.as_str()) {
                return Err(ConfigError::DuplicateArtifact(art.name.clone()));
            }
            validate_artifact(art)?;
            for def in &art.metrics {
                if !metric_names.insert(def.name.as_str()) {
                    return Err(ConfigError::metric(&def.name, "defined more than once"));
                }
            }
        }
        Ok(())
    }
}

fn resolve_secret<F>(value: Option<String>, env_key: &str, lookup: &F) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Some(v) if v.trim().eq_ignore_ascii_case("env") => lookup(env_key)
            .map(Some)
            .ok_or_else(|| ConfigError::Invalid(format!("missing {env_key} env var"))),
        Some(v) => Ok(Some(v)),
        // Not configured: the env var alone is enough.
        None => Ok(lookup(env_key).filter(|s| !s.is_empty())),
    }
}

fn validate_artifact(art: &ArtifactConfig) -> Result<(), ConfigError> {
    if art.path.trim().is_empty() {
        return Err(ConfigError::artifact(&art.name, "path is empty"));
    }
    if art.delimiter.len() != 1 || !art.delimiter.is_ascii() {
        return Err(ConfigError::artifact(
            &art.name,
            "delimiter must be a single ASCII character",
        ));
    }
    if art.columns.is_empty() {
        return Err(ConfigError::artifact(&art.name, "no columns declared"));
    }
    let mut seen = HashSet::new();
    for col in &art.columns {
        if col.name.trim().is_empty() {
            return Err(ConfigError::artifact(&art.name, "column with empty name"));
        }
        if !seen.insert(col.name.as_str()) {
            return Err(ConfigError::artifact(
                &art.name,
                format!("column '{}' declared twice", col.name),
            ));
        }
    }

    let schema = art.schema();
    for def in &art.metrics {
        validate_metric(def, &schema)?;
    }
    Ok(())
}

fn validate_metric(def: &MetricDefinition, schema: &CsvSchema) -> Result<(), ConfigError> {
    if !metric_name_re().is_match(&def.name) {
        return Err(ConfigError::metric(&def.name, "invalid metric name"));
    }
    if def.name.starts_with(RESERVED_PREFIX) {
        return Err(ConfigError::metric(
            &def.name,
            format!("prefix '{RESERVED_PREFIX}' is reserved"),
        ));
    }

    match def.kind {
        MetricKind::Counter => {}
        MetricKind::Gauge | MetricKind::Histogram => {
            let field = def
                .field
                .as_deref()
                .ok_or_else(|| ConfigError::metric(&def.name, "needs a source field"))?;
            let col = schema
                .column(field)
                .ok_or_else(|| ConfigError::metric(&def.name, format!("unknown field '{field}'")))?;
            if !col.field_type.is_numeric() {
                return Err(ConfigError::metric(
                    &def.name,
                    format!("field '{field}' is {}, not numeric", col.field_type),
                ));
            }
        }
    }

    if def.kind == MetricKind::Histogram {
        if def.buckets.is_empty() {
            return Err(ConfigError::metric(&def.name, "histogram needs buckets"));
        }
        if def.buckets.iter().any(|b| !b.is_finite()) {
            return Err(ConfigError::metric(&def.name, "buckets must be finite"));
        }
        if def.buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::metric(
                &def.name,
                "buckets must be strictly increasing",
            ));
        }
    }

    let mut label_names = HashSet::new();
    for label in &def.labels {
        if schema.column(&label.field).is_none() {
            return Err(ConfigError::metric(
                &def.name,
                format!("unknown label field '{}'", label.field),
            ));
        }
        let name = label.label_name();
        if !label_name_re().is_match(name) || name.starts_with("__") {
            return Err(ConfigError::metric(
                &def.name,
                format!("invalid label name '{name}'"),
            ));
        }
        if name == "le" {
            return Err(ConfigError::metric(&def.name, "label 'le' is reserved"));
        }
        if !label_names.insert(name) {
            return Err(ConfigError::metric(
                &def.name,
                format!("label '{name}' used twice"),
            ));
        }
        if label.allow.is_empty() {
            return Err(ConfigError::metric(
                &def.name,
                format!("label '{name}' needs a non-empty allow list"),
            ));
        }
    }

    if let Some(filter) = &def.filter {
        if schema.column(&filter.field).is_none() {
            return Err(ConfigError::metric(
                &def.name,
                format!("unknown filter field '{}'", filter.field),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[refresh]
interval_secs = 60

[source]
base_url = "https://repo.example.com/docs"
username = "svc"
password = "ENV"

[[artifacts]]
name = "requests"
path = "requests.csv"

[[artifacts.columns]]
name = "id"
type = "integer"
required = true

[[artifacts.columns]]
name = "status"
type = "string"

[[artifacts.columns]]
name = "latency_ms"
type = "float"

[[artifacts.metrics]]
name = "requests_total"
kind = "counter"
labels = [{ field = "status", allow = ["ok", "err"] }]

[[artifacts.metrics]]
name = "latency_avg"
kind = "gauge"
field = "latency_ms"
reduce = "avg"
"#;

    fn sample() -> ExporterConfig {
        toml::from_str(SAMPLE).unwrap()
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn sample_parses_with_defaults() {
        let cfg = sample();
        assert_eq!(cfg.server.listen, "0.0.0.0:5000");
        assert_eq!(cfg.refresh.request_timeout_secs, 10);
        assert!(cfg.source.verify_tls);
        assert_eq!(cfg.artifacts[0].schema().delimiter, b',');
        cfg.validate().unwrap();
    }

    #[test]
    fn env_overrides_patch_source_and_cadence() {
        let mut cfg = sample();
        cfg.apply_overrides(env(&[
            (ENV_BASE_URL, "https://other.example.com/x"),
            (ENV_PASSWORD, "s3cret"),
            (ENV_SCHEDULE_INTERVAL, "5"),
            (ENV_REQUEST_TIMEOUT, "3"),
        ]))
        .unwrap();
        assert_eq!(cfg.source.base_url, "https://other.example.com/x");
        assert_eq!(cfg.source.username.as_deref(), Some("svc"));
        assert_eq!(cfg.source.password.as_deref(), Some("s3cret"));
        assert_eq!(cfg.refresh.interval_secs, 300);
        assert_eq!(cfg.refresh.request_timeout_secs, 3);
    }

    #[test]
    fn env_secret_missing_is_an_error() {
        let mut cfg = sample();
        let err = cfg.apply_overrides(env(&[])).unwrap_err();
        assert!(err.to_string().contains(ENV_PASSWORD));
    }

    #[test]
    fn rejects_gauge_on_string_field() {
        let mut cfg = sample();
        cfg.artifacts[0].metrics[1].field = Some("status".into());
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Metric { .. }));
    }

    #[test]
    fn rejects_empty_allow_list_and_reserved_prefix() {
        let mut cfg = sample();
        cfg.artifacts[0].metrics[0].labels[0].allow.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.artifacts[0].metrics[0].name = "csv_exporter_rows".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn le_label_is_reserved_for_every_kind() {
        let mut cfg = sample();
        assert_eq!(cfg.artifacts[0].metrics[0].kind, MetricKind::Counter);
        cfg.artifacts[0].metrics[0].labels[0].name = Some("le".into());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("'le' is reserved"));
    }

    #[test]
    fn rejects_unsorted_buckets() {
        let mut cfg = sample();
        cfg.artifacts[0]
            .metrics
            .push(MetricDefinition::histogram("lat", "latency_ms", vec![50.0, 10.0]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_metric_across_artifacts() {
        let mut cfg = sample();
        let mut other = cfg.artifacts[0].clone();
        other.name = "requests_copy".into();
        cfg.artifacts.push(other);
        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err,
            ConfigError::metric("requests_total", "defined more than once")
        );
    }
}
