//! Batch-oriented inference pipeline.
//!
//! Usernames flow from a [`JobSource`] through concurrent thumbnail fetches
//! into the [`BatchAssembler`], whose batches are sent one at a time to the
//! [`Predictor`]. Results are routed back to the [`JobTracker`] by username
//! and every job's single verdict is handed to the [`Sink`].

pub mod aggregate;
pub mod batch;
pub mod error;
pub mod retry;
pub mod tracker;
pub mod traits;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use garde::Validate;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::models::{PredictionResult, UserVerdict};

pub use aggregate::ResultAggregator;
pub use batch::{Batch, BatchAssembler, BatchTrigger};
pub use error::{FetchError, JobSourceError, PipelineError, PredictError, SinkError, TrackerError};
pub use retry::RetryPolicy;
pub use tracker::{Failure, JobTracker, Transition};
pub use traits::{IterJobSource, JobSource, MetricsSink, NoopMetrics, Predictor, Sink, ThumbnailSource};

/// Totals for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub submitted: u64,
    pub duplicates: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub emitted: u64,
    pub batches_dispatched: u64,
    pub units_inferred: u64,
    /// Mean fraction of `batch_size` filled by dispatched batches.
    pub average_batch_fill: f64,
    /// Jobs left non-terminal by cancellation or a halt; they got no verdict.
    pub abandoned: Vec<String>,
}

#[derive(Debug, Default)]
struct RunCounters {
    submitted: AtomicU64,
    duplicates: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    emitted: AtomicU64,
    batches: AtomicU64,
    units: AtomicU64,
}

impl RunCounters {
    fn summary(&self, batch_size: usize, abandoned: Vec<String>) -> RunSummary {
        let batches = self.batches.load(Ordering::Relaxed);
        let units = self.units.load(Ordering::Relaxed);
        let average_batch_fill = if batches == 0 {
            0.0
        } else {
            units as f64 / (batches as f64 * batch_size as f64)
        };
        RunSummary {
            submitted: self.submitted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            batches_dispatched: batches,
            units_inferred: units,
            average_batch_fill,
            abandoned,
        }
    }
}

/// First systemic error of a run. Tripping it shuts the run down.
struct Halt {
    error: Mutex<Option<PipelineError>>,
    shutdown: CancellationToken,
}

impl Halt {
    /// The first error wins; later ones are only logged at debug.
    fn trip(&self, err: PipelineError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            error!(error = %err, "Pipeline halting");
            *slot = Some(err);
        } else {
            debug!(error = %err, "Pipeline already halting, ignoring later error");
        }
        drop(slot);
        self.shutdown.cancel();
    }

    fn is_tripped(&self) -> bool {
        self.error.lock().is_some()
    }

    fn take(&self) -> Option<PipelineError> {
        self.error.lock().take()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Self {
            config,
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process every username from `jobs` and emit one verdict per username.
    ///
    /// Returns once the source is exhausted and every job is terminal, or once
    /// `cancel` fires and in-flight work has drained. Per-username failures
    /// become degraded verdicts; only systemic failures return `Err`, after
    /// already-final verdicts have been flushed to the sink.
    pub async fn run<J>(
        &self,
        mut jobs: J,
        thumbnails: Arc<dyn ThumbnailSource>,
        predictor: Arc<dyn Predictor>,
        sink: Arc<dyn Sink>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, PipelineError>
    where
        J: JobSource,
    {
        let assembler = Arc::new(BatchAssembler::new(
            self.config.batch_size,
            self.config.batch_max_wait,
        ));
        let tracker = Arc::new(JobTracker::new(
            self.config.retry_policy(),
            assembler.clone(),
        ));
        let shutdown = cancel.child_token();
        let halt = Arc::new(Halt {
            error: Mutex::new(None),
            shutdown: shutdown.clone(),
        });
        let counters = Arc::new(RunCounters::default());

        let (verdict_tx, verdict_rx) = mpsc::unbounded_channel();
        let emitter = tokio::spawn(emit_verdicts(
            verdict_rx,
            sink,
            halt.clone(),
            counters.clone(),
        ));

        let driver = Driver {
            tracker: tracker.clone(),
            thumbnails,
            verdicts: verdict_tx,
            fetch_permits: Arc::new(Semaphore::new(self.config.fetch_concurrency)),
            tasks: TaskTracker::new(),
            shutdown: shutdown.clone(),
            halt: halt.clone(),
            metrics: self.metrics.clone(),
            counters: counters.clone(),
            fetch_timeout: self.config.fetch_timeout,
            thumbnails_per_user: self.config.thumbnails_per_user,
        };

        let inference = tokio::spawn(run_inference_stream(
            driver.clone(),
            assembler.clone(),
            predictor,
            self.config.infer_timeout,
            self.config.max_consecutive_batch_failures,
        ));

        info!(
            batch_size = self.config.batch_size,
            fetch_concurrency = self.config.fetch_concurrency,
            "Pipeline run started"
        );

        // Intake
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = jobs.next() => next,
            };
            let username = match next {
                Ok(Some(username)) => username.trim().to_string(),
                Ok(None) => break,
                Err(e) => {
                    halt.trip(PipelineError::JobSource(e));
                    break;
                }
            };
            if username.is_empty() {
                continue;
            }
            match tracker.submit(&username) {
                Ok(()) => {
                    counters.submitted.fetch_add(1, Ordering::Relaxed);
                    driver.spawn_fetch(username, Duration::ZERO);
                }
                Err(TrackerError::DuplicateJob(name)) => {
                    warn!(username = %name, "Duplicate username in job stream, ignoring");
                    counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = jobs.reject(&name).await {
                        warn!(username = %name, error = %e, "Failed to release duplicate delivery");
                    }
                }
                Err(e) => {
                    halt.trip(e.into());
                    break;
                }
            }
        }

        if !shutdown.is_cancelled() {
            debug!(outstanding = tracker.outstanding(), "Intake finished, waiting for jobs");
            let mut outstanding = tracker.subscribe();
            tokio::select! {
                _ = outstanding.wait_for(|n| *n == 0) => {}
                _ = shutdown.cancelled() => {}
            }
        }

        // Drain: abandon scheduled retries, let running fetches finish, then
        // flush whatever the assembler still holds.
        shutdown.cancel();
        driver.tasks.close();
        driver.tasks.wait().await;
        assembler.close();
        if let Err(e) = inference.await {
            error!(error = %e, "Inference stream task failed");
        }
        driver.tasks.wait().await;
        drop(driver);
        if let Err(e) = emitter.await {
            error!(error = %e, "Verdict emitter task failed");
        }

        let abandoned = tracker.unfinished();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Run ended with unfinished jobs");
        }
        let summary = counters.summary(self.config.batch_size, abandoned);
        info!(
            submitted = summary.submitted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            abandoned = summary.abandoned.len(),
            batches = summary.batches_dispatched,
            average_batch_fill = summary.average_batch_fill,
            "Pipeline run finished"
        );

        match halt.take() {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

/// Shared handles for the tasks of one run.
#[derive(Clone)]
struct Driver {
    tracker: Arc<JobTracker>,
    thumbnails: Arc<dyn ThumbnailSource>,
    verdicts: mpsc::UnboundedSender<UserVerdict>,
    fetch_permits: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    halt: Arc<Halt>,
    metrics: Arc<dyn MetricsSink>,
    counters: Arc<RunCounters>,
    fetch_timeout: Duration,
    thumbnails_per_user: usize,
}

impl Driver {
    fn spawn_fetch(&self, username: String, delay: Duration) {
        let driver = self.clone();
        self.tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = driver.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let _permit = tokio::select! {
                biased;
                _ = driver.shutdown.cancelled() => return,
                permit = driver.fetch_permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            driver.fetch(&username).await;
        });
    }

    async fn fetch(&self, username: &str) {
        let attempt = match self.tracker.begin_fetch(username) {
            Ok(attempt) => attempt,
            Err(e) => return self.halt.trip(e.into()),
        };
        debug!(username = %username, attempt, "Fetching thumbnails");

        let started = std::time::Instant::now();
        let result = match timeout(
            self.fetch_timeout,
            self.thumbnails.fetch(username, self.thumbnails_per_user),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };

        let transition = match result {
            Ok(assets) => {
                info!(
                    username = %username,
                    attempt,
                    thumbnails = assets.len(),
                    fetch_duration_ms = started.elapsed().as_millis() as u64,
                    "Thumbnails fetched"
                );
                self.tracker.on_fetch_complete(username, assets)
            }
            Err(error) => self.tracker.on_failure(username, Failure::Fetch(error)),
        };
        self.apply(username, transition);
    }

    fn spawn_requeue(&self, username: String, delay: Duration) {
        let driver = self.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = driver.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let transition = driver.tracker.requeue_inference(&username);
            driver.apply(&username, transition);
        });
    }

    fn apply(&self, username: &str, transition: Result<Transition, TrackerError>) {
        match transition {
            Ok(Transition::Idle) => {}
            Ok(Transition::RetryFetch { delay }) => {
                self.metrics.fetch_retried();
                self.spawn_fetch(username.to_string(), delay);
            }
            Ok(Transition::RetryInference { delay }) => {
                self.spawn_requeue(username.to_string(), delay);
            }
            Ok(Transition::Emit(verdict)) => {
                if verdict.is_success() {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    self.metrics.job_completed();
                } else {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    self.metrics.job_failed(&verdict.status.to_string());
                }
                if self.verdicts.send(verdict).is_err() {
                    debug!(username = %username, "Verdict channel closed, dropping verdict");
                }
            }
            Err(e) => self.halt.trip(e.into()),
        }
    }
}

/// Single GPU execution stream: at most one batch is with the predictor.
async fn run_inference_stream(
    driver: Driver,
    assembler: Arc<BatchAssembler>,
    predictor: Arc<dyn Predictor>,
    infer_timeout: Duration,
    max_consecutive_failures: u32,
) {
    let mut consecutive_failures = 0u32;

    while let Some(batch) = assembler.next_batch().await {
        if driver.halt.is_tripped() {
            debug!(dropped = batch.len(), "Pipeline halted, dropping batch");
            continue;
        }

        let mut units = Vec::with_capacity(batch.len());
        for unit in batch.units {
            match driver.tracker.begin_inference(&unit.username, unit.attempt) {
                Ok(true) => units.push(unit),
                Ok(false) => {
                    debug!(username = %unit.username, attempt = unit.attempt, "Skipping superseded unit")
                }
                Err(e) => driver.halt.trip(e.into()),
            }
        }
        if units.is_empty() {
            continue;
        }

        driver.counters.batches.fetch_add(1, Ordering::Relaxed);
        driver
            .counters
            .units
            .fetch_add(units.len() as u64, Ordering::Relaxed);
        driver
            .metrics
            .batch_dispatched(units.len(), assembler.batch_size());

        let images: Vec<Arc<[u8]>> = units.iter().map(|u| u.image.clone()).collect();
        let started = std::time::Instant::now();
        let outcome = match timeout(infer_timeout, predictor.infer(&images)).await {
            Ok(Ok(results)) if results.len() == images.len() => checked(results),
            Ok(Ok(results)) => Err(PredictError::Misaligned {
                expected: images.len(),
                got: results.len(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PredictError::Timeout),
        };

        match outcome {
            Ok(results) => {
                consecutive_failures = 0;
                info!(
                    batch_size = units.len(),
                    trigger = ?batch.trigger,
                    infer_duration_ms = started.elapsed().as_millis() as u64,
                    "Batch inferred"
                );
                let mut routed: HashMap<(Arc<str>, u32), Vec<Option<PredictionResult>>> =
                    HashMap::new();
                for (unit, result) in units.into_iter().zip(results) {
                    routed
                        .entry((unit.username, unit.attempt))
                        .or_default()
                        .push(result);
                }
                for ((username, attempt), results) in routed {
                    let transition = driver
                        .tracker
                        .on_inference_complete(&username, attempt, results);
                    driver.apply(&username, transition);
                }
            }
            Err(error) => {
                consecutive_failures += 1;
                warn!(
                    batch_size = units.len(),
                    consecutive_failures,
                    error = %error,
                    "Batch inference failed"
                );
                let mut owners: Vec<(Arc<str>, u32)> = units
                    .into_iter()
                    .map(|u| (u.username, u.attempt))
                    .collect();
                owners.sort();
                owners.dedup();
                for (username, attempt) in owners {
                    let transition = driver.tracker.on_failure(
                        &username,
                        Failure::Inference {
                            attempt,
                            error: error.clone(),
                        },
                    );
                    driver.apply(&username, transition);
                }
                if consecutive_failures >= max_consecutive_failures {
                    driver.halt.trip(PipelineError::PredictorUnavailable {
                        consecutive_failures,
                        last_error: error,
                    });
                }
            }
        }
    }
}

/// Reject a batch whose predictions are out of range or not finite.
fn checked(
    results: Vec<Option<PredictionResult>>,
) -> Result<Vec<Option<PredictionResult>>, PredictError> {
    for (position, prediction) in results.iter().enumerate() {
        if let Some(prediction) = prediction {
            prediction.validate().map_err(|e| {
                PredictError::ModelError(format!("invalid prediction at position {position}: {e}"))
            })?;
        }
    }
    Ok(results)
}

async fn emit_verdicts(
    mut verdicts: mpsc::UnboundedReceiver<UserVerdict>,
    sink: Arc<dyn Sink>,
    halt: Arc<Halt>,
    counters: Arc<RunCounters>,
) {
    while let Some(verdict) = verdicts.recv().await {
        if let Err(e) = sink.emit(&verdict).await {
            halt.trip(PipelineError::Sink(e));
            return;
        }
        counters.emitted.fetch_add(1, Ordering::Relaxed);
        info!(
            username = %verdict.username,
            status = %verdict.status,
            age = ?verdict.rounded_age(),
            gender = ?verdict.predicted_gender,
            thumbnails_used = verdict.thumbnails_used,
            "Verdict emitted"
        );
    }
    if let Err(e) = sink.flush().await {
        halt.trip(PipelineError::Sink(e));
    }
}
