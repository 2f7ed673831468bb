//! CSV metrics exporter: binary entrypoint.
//! Loads config, starts one refresh pipeline per artifact, and serves
//! `/metrics` until Ctrl-C or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use csv_metrics_exporter::{
    api::{self, AppState},
    config,
    exporter::Exporter,
    metrics::Metrics,
    pipeline::fetcher::HttpFetcher,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` filter (default `info`); `LOG_FORMAT=json` for JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_default().context("loading exporter config")?;
    let telemetry = Metrics::init(cfg.artifacts.len())?;

    let fetcher = Arc::new(HttpFetcher::new(&cfg.source, cfg.refresh.request_timeout())?);
    let exporter = Arc::new(Exporter::from_config(&cfg, fetcher)?);
    exporter.start();

    let state = AppState {
        exposer: Arc::new(exporter.exposer().with_telemetry(telemetry.handle.clone())),
        exporter: exporter.clone(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.server.listen)
        .await
        .with_context(|| format!("binding {}", cfg.server.listen))?;
    tracing::info!(listen = %cfg.server.listen, artifacts = cfg.artifacts.len(), "exporter listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    exporter.stop().await;
    Ok(())
}
