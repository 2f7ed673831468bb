// src/pipeline/fetcher.rs
//! Artifact retrieval and failure classification.
//!
//! A fetcher performs network I/O only. It never touches shared state, so the
//! scheduler can drop an in-flight fetch at any point.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{
    HeaderName, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::{Client, StatusCode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SourceConfig;

/// Identifies one remote CSV resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    pub name: String,
    /// Repository-relative path or absolute URL.
    pub path: String,
    pub content_type: Option<String>,
}

impl ArtifactHandle {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            content_type: None,
        }
    }
}

/// HTTP caching tokens from the last successful retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheValidators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheValidators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedArtifact {
    pub body: Bytes,
    pub validators: CacheValidators,
}

impl FetchedArtifact {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            validators: CacheValidators::default(),
        }
    }
}

/// Result of one retrieval attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(FetchedArtifact),
    NotModified,
    /// Retryable: 5xx, timeouts, resets.
    TransientFailure(String),
    /// Needs operator action: 4xx, wrong content type, oversized body.
    PermanentFailure(String),
}

impl FetchOutcome {
    /// Short tag used in logs and telemetry labels.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::NotModified => "not_modified",
            FetchOutcome::TransientFailure(_) => "transient",
            FetchOutcome::PermanentFailure(_) => "permanent",
        }
    }
}

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, handle: &ArtifactHandle, previous: Option<&CacheValidators>) -> FetchOutcome;
}

/// Classify a non-2xx, non-304 status.
pub fn classify_status(status: StatusCode) -> FetchOutcome {
    let reason = format!("HTTP {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        FetchOutcome::TransientFailure(reason)
    } else {
        FetchOutcome::PermanentFailure(reason)
    }
}

fn classify_error(err: &reqwest::Error) -> FetchOutcome {
    if err.is_builder() {
        FetchOutcome::PermanentFailure(format!("invalid request: {err}"))
    } else {
        FetchOutcome::TransientFailure(format!("request failed: {err}"))
    }
}

/// Media type without parameters, lowercased.
fn media_type(raw: &str) -> String {
    raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

/// Fetches artifacts over HTTP(S) with optional basic auth.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    max_body_bytes: u64,
}

impl HttpFetcher {
    pub fn new(source: &SourceConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!source.verify_tls)
            .build()?;
        Ok(Self {
            client,
            base_url: source.base_url.trim_end_matches('/').to_string(),
            username: source.username.clone(),
            password: source.password.clone(),
            max_body_bytes: source.max_body_bytes,
        })
    }

    pub fn url_for(&self, handle: &ArtifactHandle) -> String {
        if handle.path.starts_with("http://") || handle.path.starts_with("https://") {
            handle.path.clone()
        } else {
            format!("{}/{}", self.base_url, handle.path.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, handle: &ArtifactHandle, previous: Option<&CacheValidators>) -> FetchOutcome {
        let url = self.url_for(handle);
        tracing::debug!(target: "fetch", artifact = %handle.name, %url, "fetching artifact");

        let mut req = self.client.get(&url);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_ref());
        }
        if let Some(v) = previous {
            if let Some(etag) = &v.etag {
                req = req.header(IF_NONE_MATCH, etag);
            }
            if let Some(lm) = &v.last_modified {
                req = req.header(IF_MODIFIED_SINCE, lm);
            }
        }

        let mut resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return classify_error(&e),
        };

        let status = resp.status();
        if status == StatusCode::NOT_MODIFIED {
            return FetchOutcome::NotModified;
        }
        if !status.is_success() {
            return classify_status(status);
        }

        let header = |name: HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        if let (Some(expected), Some(actual)) = (&handle.content_type, header(CONTENT_TYPE)) {
            if media_type(&actual) != media_type(expected) {
                return FetchOutcome::PermanentFailure(format!(
                    "unexpected content type '{actual}', expected '{expected}'"
                ));
            }
        }
        let declared_len = header(CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
        if declared_len.is_some_and(|n| n > self.max_body_bytes) {
            return FetchOutcome::PermanentFailure(format!(
                "artifact exceeds {} bytes",
                self.max_body_bytes
            ));
        }

        let validators = CacheValidators {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        };

        // Chunked responses carry no length; stop reading once over the limit.
        let mut body = BytesMut::with_capacity(declared_len.unwrap_or(0) as usize);
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    if (body.len() + chunk.len()) as u64 > self.max_body_bytes {
                        return FetchOutcome::PermanentFailure(format!(
                            "artifact exceeds {} bytes",
                            self.max_body_bytes
                        ));
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return FetchOutcome::TransientFailure(format!("reading body: {e}")),
            }
        }

        FetchOutcome::Success(FetchedArtifact {
            body: body.freeze(),
            validators,
        })
    }
}

// --- Test helper ---

/// Replays a fixed script of outcomes; repeats the last one when exhausted.
/// Tracks how many fetches run at once so tests can assert there is no overlap.
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<(Duration, FetchOutcome)>>,
    last: Mutex<Option<(Duration, FetchOutcome)>>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub seen_validators: Mutex<Vec<Option<CacheValidators>>>,
}

impl ScriptedFetcher {
    pub fn new<I>(script: I) -> Self
    where
        I: IntoIterator<Item = FetchOutcome>,
    {
        Self::with_delays(script.into_iter().map(|o| (Duration::ZERO, o)))
    }

    /// Each outcome is returned after sleeping for its delay.
    pub fn with_delays<I>(script: I) -> Self
    where
        I: IntoIterator<Item = (Duration, FetchOutcome)>,
    {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            seen_validators: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> (Duration, FetchOutcome) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match script.pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last
                .clone()
                .unwrap_or((Duration::ZERO, FetchOutcome::NotModified)),
        }
    }
}

#[async_trait]
impl ArtifactFetcher for ScriptedFetcher {
    async fn fetch(&self, _handle: &ArtifactHandle, previous: Option<&CacheValidators>) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_validators
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(previous.cloned());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Decrements even when the scheduler drops this future mid-sleep.
        let _guard = InFlightGuard(&self.in_flight);

        let (delay, outcome) = self.next_step();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
