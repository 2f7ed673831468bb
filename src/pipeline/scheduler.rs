// src/pipeline/scheduler.rs
//! Refresh loop for one artifact.
//!
//! Idle → Fetching → Parsing → Computing → Published, with ErrorBackoff on
//! retryable failures. The scheduler is the only writer of its slot; every
//! state change is published as a fresh `ArtifactView`.

use chrono::Utc;
use metrics::{counter, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

use crate::config::metric::MetricDefinition;
use crate::config::schema::CsvSchema;
use crate::error::{ConfigError, HeaderError};
use crate::pipeline::backoff::Backoff;
use crate::pipeline::compute::MetricComputer;
use crate::pipeline::fetcher::{ArtifactFetcher, ArtifactHandle, FetchOutcome, FetchedArtifact};
use crate::pipeline::{ensure_metrics_described, parser};
use crate::snapshot::{ArtifactView, CycleState, MetricSnapshot, PipelineHealth, RowStats, SnapshotSlot};

/// Row errors logged per cycle; the rest are only counted.
const LOGGED_ROW_ERRORS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Triggered,
    /// A cycle was already running; the request was folded into it.
    Coalesced,
}

/// Manual refresh requests from outside the scheduler task.
#[derive(Default)]
pub struct RefreshTrigger {
    notify: Notify,
    in_flight: AtomicBool,
}

impl RefreshTrigger {
    pub fn request(&self) -> TriggerOutcome {
        if self.in_flight.load(Ordering::SeqCst) {
            return TriggerOutcome::Coalesced;
        }
        self.notify.notify_one();
        TriggerOutcome::Triggered
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub fetch_timeout: Duration,
    pub backoff: Backoff,
}

/// What a single cycle ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Published { generation: u64 },
    NotModified,
    /// Retry after the given delay.
    Backoff(Duration),
    /// Not retry-eligible; wait for the next tick.
    Failed,
}

pub struct RefreshScheduler {
    handle: ArtifactHandle,
    schema: CsvSchema,
    computer: MetricComputer,
    fetcher: Arc<dyn ArtifactFetcher>,
    slot: Arc<SnapshotSlot>,
    trigger: Arc<RefreshTrigger>,
    settings: SchedulerSettings,
    state: CycleState,
    health: PipelineHealth,
    current: Arc<MetricSnapshot>,
}

impl RefreshScheduler {
    pub fn new(
        handle: ArtifactHandle,
        schema: CsvSchema,
        definitions: &[MetricDefinition],
        fetcher: Arc<dyn ArtifactFetcher>,
        settings: SchedulerSettings,
    ) -> Result<Self, ConfigError> {
        let computer = MetricComputer::new(&schema, definitions)?;
        let slot = Arc::new(SnapshotSlot::new(handle.name.clone()));
        Ok(Self {
            handle,
            schema,
            computer,
            fetcher,
            slot,
            trigger: Arc::new(RefreshTrigger::default()),
            settings,
            state: CycleState::Idle,
            health: PipelineHealth::default(),
            current: Arc::new(MetricSnapshot::empty()),
        })
    }

    pub fn handle(&self) -> &ArtifactHandle {
        &self.handle
    }

    pub fn slot(&self) -> Arc<SnapshotSlot> {
        self.slot.clone()
    }

    pub fn trigger(&self) -> Arc<RefreshTrigger> {
        self.trigger.clone()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn health(&self) -> &PipelineHealth {
        &self.health
    }

    pub fn current(&self) -> Arc<MetricSnapshot> {
        self.current.clone()
    }

    /// Run cycles until `shutdown` flips to true or its sender goes away.
    /// The first cycle starts immediately.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        ensure_metrics_described();
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retry_in: Option<Duration> = None;

        tracing::info!(
            target: "refresh",
            artifact = %self.handle.name,
            interval_secs = self.settings.interval.as_secs(),
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let trigger = self.trigger.clone();
            let wait = retry_in;
            let retry = async move {
                match wait {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick(), if retry_in.is_none() => {}
                _ = trigger.notify.notified() => {}
                _ = retry => {}
            }

            let outcome = tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!(target: "refresh", artifact = %self.handle.name, "refresh cycle abandoned on shutdown");
                    break;
                }
                outcome = self.run_cycle() => outcome,
            };
            // Next tick is one full interval after this cycle; ticks that
            // elapsed during the cycle or a backoff are dropped.
            ticker.reset();
            retry_in = match outcome {
                CycleOutcome::Backoff(d) => Some(d),
                _ => None,
            };
        }

        self.trigger.in_flight.store(false, Ordering::SeqCst);
        tracing::info!(target: "refresh", artifact = %self.handle.name, "scheduler stopped");
    }

    /// One fetch → parse → compute → publish pass.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.trigger.in_flight.store(true, Ordering::SeqCst);
        self.health.last_attempt_at = Some(Utc::now());
        self.enter(CycleState::Fetching);

        let outcome = self.fetch().await;
        let result = match outcome {
            FetchOutcome::Success(fetched) => self.process(fetched),
            FetchOutcome::NotModified => {
                tracing::debug!(target: "refresh", artifact = %self.handle.name, "artifact not modified");
                self.mark_healthy();
                self.enter(CycleState::Idle);
                CycleOutcome::NotModified
            }
            FetchOutcome::TransientFailure(reason) => self.transient(reason),
            FetchOutcome::PermanentFailure(reason) => self.permanent(reason),
        };

        counter!(
            "csv_exporter_cycles_total",
            "artifact" => self.handle.name.clone(),
            "result" => cycle_label(&result)
        )
        .increment(1);
        self.trigger.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn fetch(&self) -> FetchOutcome {
        let previous = self
            .current
            .is_published()
            .then_some(&self.current.validators)
            .filter(|v| !v.is_empty());

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.settings.fetch_timeout,
            self.fetcher.fetch(&self.handle, previous),
        )
        .await
        {
            Ok(o) => o,
            Err(_) => FetchOutcome::TransientFailure(format!(
                "fetch timed out after {}s",
                self.settings.fetch_timeout.as_secs_f64()
            )),
        };

        histogram!("csv_exporter_fetch_duration_ms", "artifact" => self.handle.name.clone())
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        counter!(
            "csv_exporter_fetch_outcomes_total",
            "artifact" => self.handle.name.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);
        outcome
    }

    fn process(&mut self, fetched: FetchedArtifact) -> CycleOutcome {
        self.enter(CycleState::Parsing);
        let parsed = match parser::parse(&fetched.body, &self.schema) {
            Ok(p) => p,
            Err(e) => return self.header_mismatch(e),
        };

        for err in parsed.errors.iter().take(LOGGED_ROW_ERRORS) {
            tracing::debug!(target: "refresh", artifact = %self.handle.name, %err, "row dropped");
        }
        counter!("csv_exporter_rows_total", "artifact" => self.handle.name.clone())
            .increment(parsed.total_rows as u64);

        self.enter(CycleState::Computing);
        let families = self.computer.compute(&parsed.records);

        let rows = RowStats {
            total: parsed.total_rows,
            parsed: parsed.records.len(),
            dropped: parsed.dropped,
        };
        let generation = self.current.generation + 1;
        self.current = Arc::new(MetricSnapshot {
            generation,
            fetched_at: Some(Utc::now()),
            families,
            rows,
            validators: fetched.validators,
            payload: fetched.body,
        });
        self.mark_healthy();
        self.enter(CycleState::Published);

        tracing::info!(
            target: "refresh",
            artifact = %self.handle.name,
            generation,
            rows = rows.total,
            dropped = rows.dropped,
            "snapshot published"
        );

        self.state = CycleState::Idle;
        CycleOutcome::Published { generation }
    }

    fn transient(&mut self, reason: String) -> CycleOutcome {
        self.health.transient_failures_total += 1;
        self.record_failure(&reason);
        let delay = self.settings.backoff.next_delay();
        tracing::warn!(
            target: "refresh",
            artifact = %self.handle.name,
            %reason,
            retry_in_ms = delay.as_millis() as u64,
            failures = self.health.consecutive_failures,
            "transient failure, backing off"
        );
        self.enter(CycleState::ErrorBackoff);
        CycleOutcome::Backoff(delay)
    }

    fn permanent(&mut self, reason: String) -> CycleOutcome {
        self.health.permanent_failures_total += 1;
        self.record_failure(&reason);
        tracing::error!(
            target: "refresh",
            artifact = %self.handle.name,
            %reason,
            "permanent failure, keeping previous snapshot"
        );
        self.enter(CycleState::Idle);
        CycleOutcome::Failed
    }

    fn header_mismatch(&mut self, err: HeaderError) -> CycleOutcome {
        self.health.permanent_failures_total += 1;
        let reason = format!("schema mismatch: {err}");
        self.record_failure(&reason);
        let delay = self.settings.backoff.next_delay();
        tracing::error!(
            target: "refresh",
            artifact = %self.handle.name,
            %reason,
            retry_in_ms = delay.as_millis() as u64,
            "header does not match schema"
        );
        self.enter(CycleState::ErrorBackoff);
        CycleOutcome::Backoff(delay)
    }

    fn record_failure(&mut self, reason: &str) {
        self.health.consecutive_failures += 1;
        self.health.last_error = Some(reason.to_string());
    }

    fn mark_healthy(&mut self) {
        self.health.consecutive_failures = 0;
        self.health.last_error = None;
        self.settings.backoff.reset();
    }

    fn enter(&mut self, state: CycleState) {
        self.state = state;
        self.slot.publish(ArtifactView {
            artifact: self.handle.name.clone(),
            state,
            snapshot: self.current.clone(),
            health: self.health.clone(),
        });
    }
}

fn cycle_label(outcome: &CycleOutcome) -> &'static str {
    match outcome {
        CycleOutcome::Published { .. } => "published",
        CycleOutcome::NotModified => "not_modified",
        CycleOutcome::Backoff(_) => "backoff",
        CycleOutcome::Failed => "failed",
    }
}
