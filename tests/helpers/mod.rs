//! In-memory collaborators for driving the pipeline in tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use creator_demographics::config::PipelineConfig;
use creator_demographics::models::{PredictionResult, ThumbnailAsset, UserVerdict};
use creator_demographics::pipeline::{
    FetchError, JobSource, JobSourceError, PredictError, Predictor, Sink, SinkError,
    ThumbnailSource,
};

use crate::fixtures;

/// Scripted result of one `ThumbnailSource::fetch` call.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// `n` downloadable images
    Images(usize),
    /// `ok` downloadable images followed by `failed` broken downloads
    Partial { ok: usize, failed: usize },
    Fail(FetchError),
    /// Never resolves; only a deadline or cancellation ends it
    Hang,
}

/// Image bytes encode their owner so the predictor can look up scripted output.
pub fn image_bytes(username: &str, index: usize) -> Vec<u8> {
    format!("{username}#{index}").into_bytes()
}

fn owner_of(image: &[u8]) -> (String, usize) {
    let text = String::from_utf8_lossy(image);
    let (name, index) = text.rsplit_once('#').unwrap_or((&text, "0"));
    (name.to_string(), index.parse().unwrap_or(0))
}

pub struct FakeThumbnails {
    scripts: Mutex<HashMap<String, VecDeque<FetchOutcome>>>,
    default: FetchOutcome,
    calls: Mutex<HashMap<String, u32>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeThumbnails {
    /// Every username yields `images` thumbnails unless scripted otherwise.
    pub fn new(images: usize) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default: FetchOutcome::Images(images),
            calls: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Outcomes for successive calls; the default applies once exhausted.
    pub fn script(self, username: &str, outcomes: Vec<FetchOutcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(username.to_string(), outcomes.into());
        self
    }

    pub fn calls(&self, username: &str) -> u32 {
        self.calls.lock().unwrap().get(username).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThumbnailSource for FakeThumbnails {
    async fn fetch(&self, username: &str, max_count: usize) -> Result<Vec<ThumbnailAsset>, FetchError> {
        *self.calls.lock().unwrap().entry(username.to_string()).or_default() += 1;
        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(username)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| self.default.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            FetchOutcome::Images(n) => Ok((0..n.min(max_count))
                .map(|i| ThumbnailAsset::fetched(format!("cover-{i}"), image_bytes(username, i)))
                .collect()),
            FetchOutcome::Partial { ok, failed } => {
                let mut assets: Vec<ThumbnailAsset> = (0..ok)
                    .map(|i| ThumbnailAsset::fetched(format!("cover-{i}"), image_bytes(username, i)))
                    .collect();
                assets.extend((ok..ok + failed).map(|i| ThumbnailAsset::failed(format!("cover-{i}"), "HTTP 403")));
                Ok(assets)
            }
            FetchOutcome::Fail(error) => Err(error),
            FetchOutcome::Hang => std::future::pending().await,
        }
    }
}

pub struct FakePredictor {
    outputs: Mutex<HashMap<String, Vec<Option<PredictionResult>>>>,
    failures_left: AtomicU32,
    always_fail: bool,
    misaligned: bool,
    latency: Duration,
    batches: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakePredictor {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            failures_left: AtomicU32::new(0),
            always_fail: false,
            misaligned: false,
            latency: Duration::ZERO,
            batches: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Per-image outputs for a username's thumbnails, by index.
    pub fn outputs(self, username: &str, outputs: Vec<Option<PredictionResult>>) -> Self {
        self.outputs
            .lock()
            .unwrap()
            .insert(username.to_string(), outputs);
        self
    }

    /// Fail the next `n` calls wholesale.
    pub fn failing(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Answer every batch with one result too few.
    pub fn misaligned(mut self) -> Self {
        self.misaligned = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Predictor for FakePredictor {
    async fn infer(&self, images: &[Arc<[u8]>]) -> Result<Vec<Option<PredictionResult>>, PredictError> {
        self.batches.lock().unwrap().push(images.len());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.always_fail {
            return Err(PredictError::ResourceExhausted("CUDA out of memory".to_string()));
        }
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PredictError::ModelError("injected failure".to_string()));
        }

        let outputs = self.outputs.lock().unwrap();
        let mut results: Vec<_> = images
            .iter()
            .map(|image| {
                let (username, index) = owner_of(image);
                match outputs.get(&username) {
                    Some(scripted) => scripted.get(index).copied().flatten(),
                    None => Some(fixtures::default_prediction()),
                }
            })
            .collect();
        if self.misaligned {
            results.pop();
        }
        Ok(results)
    }
}

/// In-memory job source remembering which deliveries the pipeline rejected.
pub struct RecordingJobSource {
    pending: VecDeque<String>,
    rejected: Arc<Mutex<Vec<String>>>,
}

impl RecordingJobSource {
    pub fn new(names: &[&str]) -> Self {
        Self {
            pending: usernames(names).into(),
            rejected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle that stays readable after the source is moved into a run.
    pub fn rejected(&self) -> Arc<Mutex<Vec<String>>> {
        self.rejected.clone()
    }
}

#[async_trait]
impl JobSource for RecordingJobSource {
    async fn next(&mut self) -> Result<Option<String>, JobSourceError> {
        Ok(self.pending.pop_front())
    }

    async fn reject(&mut self, username: &str) -> Result<(), JobSourceError> {
        self.rejected.lock().unwrap().push(username.to_string());
        Ok(())
    }
}

/// Sink keeping every verdict in emission order.
#[derive(Default)]
pub struct RecordingSink {
    verdicts: Mutex<Vec<UserVerdict>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broken() -> Self {
        Self {
            verdicts: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn verdicts(&self) -> Vec<UserVerdict> {
        self.verdicts.lock().unwrap().clone()
    }

    pub fn verdict(&self, username: &str) -> Option<UserVerdict> {
        self.verdicts
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.username == username)
            .cloned()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn emit(&self, verdict: &UserVerdict) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Backend("disk full".to_string()));
        }
        self.verdicts.lock().unwrap().push(verdict.clone());
        Ok(())
    }
}

/// Small, fast configuration for tests running on paused time.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        batch_size: 4,
        batch_max_wait: Duration::from_millis(250),
        max_fetch_attempts: 3,
        max_infer_attempts: 3,
        retry_base_delay: Duration::from_millis(100),
        retry_delay_ceiling: Duration::from_secs(2),
        retry_jitter: false,
        rate_limit_backoff_factor: 4,
        fetch_concurrency: 8,
        fetch_timeout: Duration::from_secs(60),
        infer_timeout: Duration::from_secs(30),
        thumbnails_per_user: 10,
        max_consecutive_batch_failures: 5,
    }
}

pub fn usernames(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}
