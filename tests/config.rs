// tests/config.rs
//
// Loading from disk plus process-env overrides. Env is process-global, so
// every test here runs serially.

use std::io::Write;
use std::path::PathBuf;

use csv_metrics_exporter::config::{self, ENV_CONFIG_PATH};
use csv_metrics_exporter::exporter::Exporter;
use csv_metrics_exporter::pipeline::fetcher::{FetchOutcome, ScriptedFetcher};
use serial_test::serial;

const MINIMAL: &str = r#"
[source]
base_url = "https://repo.example.com/docs"

[[artifacts]]
name = "jobs"
path = "jobs.csv"
columns = [{ name = "id", type = "integer" }, { name = "queue", type = "string" }]

[[artifacts.metrics]]
name = "jobs_total"
kind = "counter"
labels = [{ field = "queue", allow = ["default"] }]
"#;

const ENV_KEYS: &[&str] = &[
    ENV_CONFIG_PATH,
    "ARTIFACTORY_DOCUMENTS_URL",
    "ART_USER",
    "ART_PASSWORD",
    "REQUEST_TIMEOUT",
    "SCHEDULE_INTERVAL",
    "EXPORTER_LISTEN",
];

fn clear_env() {
    for k in ENV_KEYS {
        std::env::remove_var(k);
    }
}

fn write_temp(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("tempfile");
    f.write_all(content.as_bytes()).expect("write config");
    f
}

#[test]
#[serial]
fn load_from_applies_defaults() {
    clear_env();
    let f = write_temp(MINIMAL);
    let cfg = config::load_from(f.path()).expect("valid config");
    assert_eq!(cfg.refresh.interval_secs, 300);
    assert_eq!(cfg.refresh.request_timeout_secs, 10);
    assert_eq!(cfg.artifacts.len(), 1);
    assert!(cfg.source.username.is_none());
}

#[test]
#[serial]
fn load_default_follows_env_path_and_overrides() {
    clear_env();
    let f = write_temp(MINIMAL);
    std::env::set_var(ENV_CONFIG_PATH, f.path());
    std::env::set_var("ARTIFACTORY_DOCUMENTS_URL", "https://mirror.example.com/docs");
    std::env::set_var("SCHEDULE_INTERVAL", "2");
    std::env::set_var("REQUEST_TIMEOUT", "3");
    std::env::set_var("ART_USER", "svc");

    let cfg = config::load_default().expect("valid config");
    assert_eq!(cfg.source.base_url, "https://mirror.example.com/docs");
    assert_eq!(cfg.refresh.interval_secs, 120);
    assert_eq!(cfg.refresh.request_timeout_secs, 3);
    assert_eq!(cfg.source.username.as_deref(), Some("svc"));
    clear_env();
}

#[test]
#[serial]
fn malformed_override_is_rejected() {
    clear_env();
    let f = write_temp(MINIMAL);
    std::env::set_var("SCHEDULE_INTERVAL", "five");
    let err = config::load_from(f.path()).unwrap_err();
    assert!(format!("{err:#}").contains("SCHEDULE_INTERVAL"));
    clear_env();
}

#[test]
#[serial]
fn shipped_config_is_valid() {
    clear_env();
    std::env::set_var("ART_USER", "svc");
    std::env::set_var("ART_PASSWORD", "secret");
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/exporter.toml");
    let cfg = config::load_from(&path).expect("shipped config loads");
    assert_eq!(cfg.source.password.as_deref(), Some("secret"));

    // Every metric resolves against its artifact's schema.
    let ex = Exporter::from_config(&cfg, std::sync::Arc::new(ScriptedFetcher::new(Vec::<FetchOutcome>::new())));
    assert!(ex.is_ok());
    clear_env();
}
