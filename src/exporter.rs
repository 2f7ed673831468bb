// src/exporter.rs
//! Owns one refresh pipeline per configured artifact and their lifecycle.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ExporterConfig;
use crate::error::ConfigError;
use crate::exposition::MetricExposer;
use crate::pipeline::fetcher::{ArtifactFetcher, ArtifactHandle};
use crate::pipeline::scheduler::{RefreshScheduler, RefreshTrigger, SchedulerSettings, TriggerOutcome};
use crate::snapshot::{ArtifactView, SnapshotSlot};

/// Read side of one pipeline; stays valid after the scheduler is moved into its task.
#[derive(Clone)]
pub struct PipelineHandle {
    pub artifact: ArtifactHandle,
    pub slot: Arc<SnapshotSlot>,
    pub trigger: Arc<RefreshTrigger>,
}

pub struct Exporter {
    pipelines: Vec<PipelineHandle>,
    pending: Mutex<Vec<RefreshScheduler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Exporter {
    /// Build every pipeline from validated config. Nothing runs until `start`.
    pub fn from_config(
        cfg: &ExporterConfig,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Self, ConfigError> {
        let schedulers = cfg
            .artifacts
            .iter()
            .map(|a| {
                RefreshScheduler::new(
                    a.handle(),
                    a.schema(),
                    &a.metrics,
                    fetcher.clone(),
                    SchedulerSettings {
                        interval: cfg.refresh.interval(),
                        fetch_timeout: cfg.refresh.request_timeout(),
                        backoff: cfg.refresh.backoff(),
                    },
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(schedulers))
    }

    pub fn new(schedulers: Vec<RefreshScheduler>) -> Self {
        let pipelines = schedulers
            .iter()
            .map(|s| PipelineHandle {
                artifact: s.handle().clone(),
                slot: s.slot(),
                trigger: s.trigger(),
            })
            .collect();
        let (shutdown, _) = watch::channel(false);
        Self {
            pipelines,
            pending: Mutex::new(schedulers),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Spawn the scheduler tasks. Calling it again is a no-op.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> usize {
        let pending: Vec<RefreshScheduler> =
            std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        let spawned = pending.len();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for scheduler in pending {
            let rx = self.shutdown.subscribe();
            tasks.push(tokio::spawn(scheduler.run(rx)));
        }
        if spawned > 0 {
            tracing::info!(target: "exporter", pipelines = spawned, "refresh pipelines started");
        }
        spawned
    }

    /// Signal every scheduler and wait for it to exit. In-flight cycles are
    /// abandoned, so the last published snapshot stays as it was.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(target: "exporter", error = %e, "scheduler task ended abnormally");
            }
        }
        tracing::info!(target: "exporter", "refresh pipelines stopped");
    }

    pub fn pipelines(&self) -> &[PipelineHandle] {
        &self.pipelines
    }

    pub fn views(&self) -> Vec<Arc<ArtifactView>> {
        self.pipelines.iter().map(|p| p.slot.load()).collect()
    }

    /// Look up a pipeline by artifact name, configured path, or file name.
    pub fn find(&self, filename: &str) -> Option<&PipelineHandle> {
        self.pipelines.iter().find(|p| {
            p.artifact.name == filename
                || p.artifact.path == filename
                || p.artifact.path.rsplit('/').next() == Some(filename)
        })
    }

    pub fn trigger_all(&self) -> Vec<(String, TriggerOutcome)> {
        self.pipelines
            .iter()
            .map(|p| (p.artifact.name.clone(), p.trigger.request()))
            .collect()
    }

    pub fn exposer(&self) -> MetricExposer {
        MetricExposer::new(self.pipelines.iter().map(|p| p.slot.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ColumnSpec, CsvSchema, FieldType};
    use crate::pipeline::backoff::Backoff;
    use crate::pipeline::fetcher::{FetchOutcome, FetchedArtifact, ScriptedFetcher};
    use std::time::Duration;

    fn exporter(fetcher: Arc<ScriptedFetcher>) -> Exporter {
        let scheduler = RefreshScheduler::new(
            ArtifactHandle::new("jobs", "reports/jobs.csv"),
            CsvSchema::new(vec![ColumnSpec::new("id", FieldType::Integer)]),
            &[],
            fetcher,
            SchedulerSettings {
                interval: Duration::from_secs(60),
                fetch_timeout: Duration::from_secs(5),
                backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(10)),
            },
        )
        .unwrap();
        Exporter::new(vec![scheduler])
    }

    #[test]
    fn find_by_name_path_or_file_name() {
        let ex = exporter(Arc::new(ScriptedFetcher::new(Vec::<FetchOutcome>::new())));
        assert!(ex.find("jobs").is_some());
        assert!(ex.find("reports/jobs.csv").is_some());
        assert!(ex.find("jobs.csv").is_some());
        assert!(ex.find("other.csv").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_first_cycle_immediately_and_is_idempotent() {
        let fetcher = Arc::new(ScriptedFetcher::new([FetchOutcome::Success(
            FetchedArtifact::new("id\n1\n2\n"),
        )]));
        let ex = exporter(fetcher.clone());
        assert_eq!(ex.start(), 1);
        assert_eq!(ex.start(), 0);

        for _ in 0..50 {
            if ex.views()[0].snapshot.is_published() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ex.views()[0].snapshot.generation, 1);
        assert_eq!(ex.views()[0].snapshot.rows.parsed, 2);

        ex.stop().await;
        assert_eq!(fetcher.call_count(), 1);
    }
}
