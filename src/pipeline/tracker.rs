//! Per-username lifecycle tracking.
//!
//! Every legal `Job` transition happens here. Each job sits behind its own
//! mutex so transitions for one username are serialized while different
//! usernames never contend. A job reaches `Done` or `Failed` at most once and
//! only that transition yields its verdict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::models::{Job, JobState, PredictionResult, ThumbnailAsset, UserVerdict, VerdictStatus};
use crate::pipeline::aggregate::{Attempts, ResultAggregator};
use crate::pipeline::batch::BatchAssembler;
use crate::pipeline::error::{FetchError, PredictError, TrackerError};
use crate::pipeline::retry::RetryPolicy;

/// What the driver must do after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing to schedule; the job waits for its next event.
    Idle,
    RetryFetch { delay: Duration },
    RetryInference { delay: Duration },
    /// The job became terminal; hand the verdict to the sink.
    Emit(UserVerdict),
}

/// A failed unit of work for one username.
#[derive(Debug, Clone)]
pub enum Failure {
    Fetch(FetchError),
    Inference { attempt: u32, error: PredictError },
}

#[derive(Debug)]
struct TrackedJob {
    job: Job,
    pending_units: usize,
    predictions: Vec<PredictionResult>,
    emitted: bool,
}

impl TrackedJob {
    fn attempts(&self) -> Attempts {
        Attempts {
            fetch: self.job.fetch_attempts,
            infer: self.job.infer_attempts,
        }
    }

    fn expect_state(&self, expected: JobState, operation: &str) -> Result<(), TrackerError> {
        if self.job.state == expected {
            return Ok(());
        }
        Err(TrackerError::InvariantViolation {
            username: self.job.username.clone(),
            detail: format!(
                "{operation} requires state {expected}, found {}",
                self.job.state
            ),
        })
    }

    /// True while `attempt` is the inference attempt currently in flight.
    fn is_current_inference(&self, attempt: u32) -> bool {
        self.job.state == JobState::Inferring && attempt == self.job.infer_attempts
    }
}

pub struct JobTracker {
    jobs: RwLock<HashMap<String, Arc<Mutex<TrackedJob>>>>,
    assembler: Arc<BatchAssembler>,
    retry: RetryPolicy,
    aggregator: ResultAggregator,
    outstanding: watch::Sender<usize>,
}

impl JobTracker {
    pub fn new(retry: RetryPolicy, assembler: Arc<BatchAssembler>) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            jobs: RwLock::new(HashMap::new()),
            assembler,
            retry,
            aggregator: ResultAggregator,
            outstanding,
        }
    }

    /// Start tracking `username` in `Pending`.
    pub fn submit(&self, username: &str) -> Result<(), TrackerError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(username) {
            return Err(TrackerError::DuplicateJob(username.to_string()));
        }
        jobs.insert(
            username.to_string(),
            Arc::new(Mutex::new(TrackedJob {
                job: Job::new(username),
                pending_units: 0,
                predictions: Vec::new(),
                emitted: false,
            })),
        );
        self.outstanding.send_modify(|n| *n += 1);
        Ok(())
    }

    /// `Pending -> Fetching`. Returns the attempt number being started.
    pub fn begin_fetch(&self, username: &str) -> Result<u32, TrackerError> {
        let entry = self.entry(username)?;
        let mut tracked = entry.lock();
        tracked.expect_state(JobState::Pending, "begin_fetch")?;
        tracked.job.state = JobState::Fetching;
        tracked.job.fetch_attempts += 1;
        Ok(tracked.job.fetch_attempts)
    }

    /// `Fetching -> Batched`, registering the usable thumbnails with the
    /// assembler. An empty result is terminal (`no_thumbnails`); a result in
    /// which every download failed goes through the fetch retry path.
    pub fn on_fetch_complete(
        &self,
        username: &str,
        thumbnails: Vec<ThumbnailAsset>,
    ) -> Result<Transition, TrackerError> {
        let entry = self.entry(username)?;
        let mut tracked = entry.lock();
        tracked.expect_state(JobState::Fetching, "on_fetch_complete")?;

        if thumbnails.is_empty() {
            let verdict = self.aggregator.degraded(
                username,
                VerdictStatus::NoThumbnails,
                tracked.attempts(),
                None,
            );
            return self.finalize(&mut tracked, JobState::Failed, verdict);
        }

        tracked.job.thumbnails = thumbnails;
        if tracked.job.usable_thumbnails().next().is_none() {
            let error = FetchError::TransientNetwork(format!(
                "none of {} thumbnails could be downloaded",
                tracked.job.thumbnails.len()
            ));
            return self.fail_fetch(&mut tracked, error);
        }

        self.register(&mut tracked);
        Ok(Transition::Idle)
    }

    /// `Batched -> Inferring` when a unit of `attempt` is about to be sent to
    /// the predictor. Returns false for units of a superseded attempt, which
    /// must be dropped from the batch.
    pub fn begin_inference(&self, username: &str, attempt: u32) -> Result<bool, TrackerError> {
        let entry = self.entry(username)?;
        let mut tracked = entry.lock();
        if tracked.job.state == JobState::Batched && attempt == tracked.job.infer_attempts + 1 {
            tracked.job.state = JobState::Inferring;
            tracked.job.infer_attempts = attempt;
            return Ok(true);
        }
        Ok(tracked.is_current_inference(attempt))
    }

    /// Record results for some of the job's units. The job reaches `Done`
    /// once every registered unit has resolved.
    pub fn on_inference_complete(
        &self,
        username: &str,
        attempt: u32,
        results: Vec<Option<PredictionResult>>,
    ) -> Result<Transition, TrackerError> {
        let entry = self.entry(username)?;
        let mut tracked = entry.lock();
        if !tracked.is_current_inference(attempt) {
            debug!(username = %username, attempt, "Discarding results of superseded attempt");
            return Ok(Transition::Idle);
        }
        if results.len() > tracked.pending_units {
            return Err(TrackerError::InvariantViolation {
                username: username.to_string(),
                detail: format!(
                    "{} results for {} pending units",
                    results.len(),
                    tracked.pending_units
                ),
            });
        }

        tracked.pending_units -= results.len();
        tracked.predictions.extend(results.into_iter().flatten());
        if tracked.pending_units > 0 {
            return Ok(Transition::Idle);
        }

        let verdict = self
            .aggregator
            .aggregate(username, &tracked.predictions, tracked.attempts());
        self.finalize(&mut tracked, JobState::Done, verdict)
    }

    /// Consult the retry policy: either back to `Pending` with a delay, or
    /// terminal `Failed` with a degraded verdict.
    pub fn on_failure(&self, username: &str, failure: Failure) -> Result<Transition, TrackerError> {
        let entry = self.entry(username)?;
        let mut tracked = entry.lock();
        match failure {
            Failure::Fetch(error) => {
                tracked.expect_state(JobState::Fetching, "on_failure(fetch)")?;
                self.fail_fetch(&mut tracked, error)
            }
            Failure::Inference { attempt, error } => {
                if !tracked.is_current_inference(attempt) {
                    return Ok(Transition::Idle);
                }
                tracked.job.last_error = Some(error.to_string());
                tracked.pending_units = 0;
                tracked.predictions.clear();

                let attempts = tracked.job.infer_attempts;
                if self.retry.retry_inference(attempts) {
                    tracked.job.state = JobState::Pending;
                    let delay = self.retry.inference_delay(attempts);
                    warn!(
                        username = %username,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Inference failed, scheduling retry"
                    );
                    return Ok(Transition::RetryInference { delay });
                }

                let verdict = self.aggregator.degraded(
                    username,
                    VerdictStatus::InferenceFailed,
                    tracked.attempts(),
                    Some(format!("Inference failed after {attempts} attempts: {error}")),
                );
                self.finalize(&mut tracked, JobState::Failed, verdict)
            }
        }
    }

    /// `Pending -> Batched` for an inference retry, re-registering the
    /// thumbnails already fetched.
    pub fn requeue_inference(&self, username: &str) -> Result<Transition, TrackerError> {
        let entry = self.entry(username)?;
        let mut tracked = entry.lock();
        tracked.expect_state(JobState::Pending, "requeue_inference")?;
        self.register(&mut tracked);
        Ok(Transition::Idle)
    }

    /// Number of submitted jobs not yet terminal.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.outstanding.subscribe()
    }

    /// Snapshot of a job for inspection.
    pub fn job(&self, username: &str) -> Option<Job> {
        let entry = self.jobs.read().get(username).cloned()?;
        let tracked = entry.lock();
        Some(tracked.job.clone())
    }

    /// Usernames whose jobs have not reached a terminal state.
    pub fn unfinished(&self) -> Vec<String> {
        let jobs = self.jobs.read();
        let mut names: Vec<String> = jobs
            .iter()
            .filter(|(_, entry)| !entry.lock().job.state.is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn entry(&self, username: &str) -> Result<Arc<Mutex<TrackedJob>>, TrackerError> {
        self.jobs
            .read()
            .get(username)
            .cloned()
            .ok_or_else(|| TrackerError::UnknownJob(username.to_string()))
    }

    fn register(&self, tracked: &mut TrackedJob) {
        let attempt = tracked.job.infer_attempts + 1;
        tracked.predictions.clear();
        tracked.pending_units =
            self.assembler
                .add(&tracked.job.username, attempt, &tracked.job.thumbnails);
        tracked.job.state = JobState::Batched;
        debug!(
            username = %tracked.job.username,
            attempt,
            units = tracked.pending_units,
            "Thumbnails registered for inference"
        );
    }

    fn fail_fetch(
        &self,
        tracked: &mut TrackedJob,
        error: FetchError,
    ) -> Result<Transition, TrackerError> {
        tracked.job.state = JobState::FetchFailed;
        tracked.job.last_error = Some(error.to_string());

        let attempts = tracked.job.fetch_attempts;
        if !error.is_permanent() && self.retry.retry_fetch(attempts) {
            tracked.job.state = JobState::Pending;
            let delay = self.retry.fetch_delay(attempts, &error);
            warn!(
                username = %tracked.job.username,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Fetch failed, scheduling retry"
            );
            return Ok(Transition::RetryFetch { delay });
        }

        let detail = if error.is_permanent() {
            error.to_string()
        } else {
            format!("Fetch failed after {attempts} attempts: {error}")
        };
        let verdict = self.aggregator.degraded(
            &tracked.job.username,
            VerdictStatus::FetchFailed,
            tracked.attempts(),
            Some(detail),
        );
        self.finalize(tracked, JobState::Failed, verdict)
    }

    fn finalize(
        &self,
        tracked: &mut TrackedJob,
        state: JobState,
        verdict: UserVerdict,
    ) -> Result<Transition, TrackerError> {
        if tracked.emitted || tracked.job.state.is_terminal() {
            return Err(TrackerError::InvariantViolation {
                username: tracked.job.username.clone(),
                detail: "verdict already emitted".to_string(),
            });
        }
        tracked.emitted = true;
        tracked.job.state = state;
        tracked.job.thumbnails.clear();
        tracked.predictions.clear();
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        Ok(Transition::Emit(verdict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Gender;

    fn policy(max_fetch: u32, max_infer: u32) -> RetryPolicy {
        RetryPolicy {
            max_fetch_attempts: max_fetch,
            max_infer_attempts: max_infer,
            base_delay: Duration::from_millis(10),
            delay_ceiling: Duration::from_secs(1),
            rate_limit_factor: 4,
            jitter: false,
        }
    }

    fn tracker(max_fetch: u32, max_infer: u32) -> (JobTracker, Arc<BatchAssembler>) {
        let assembler = Arc::new(BatchAssembler::new(8, Duration::from_millis(50)));
        (JobTracker::new(policy(max_fetch, max_infer), assembler.clone()), assembler)
    }

    fn thumbs(n: usize) -> Vec<ThumbnailAsset> {
        (0..n)
            .map(|i| ThumbnailAsset::fetched(format!("t{i}.jpg"), vec![i as u8]))
            .collect()
    }

    fn prediction(age: f64) -> Option<PredictionResult> {
        Some(PredictionResult::new(age, Gender::Female, 0.9))
    }

    fn emitted(transition: Transition) -> UserVerdict {
        match transition {
            Transition::Emit(v) => v,
            other => panic!("expected Emit, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_submit_rejected() {
        let (tracker, _) = tracker(3, 3);
        tracker.submit("alice").unwrap();
        assert!(matches!(
            tracker.submit("alice"),
            Err(TrackerError::DuplicateJob(name)) if name == "alice"
        ));
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn test_unknown_username_rejected() {
        let (tracker, _) = tracker(3, 3);
        assert!(matches!(
            tracker.begin_fetch("ghost"),
            Err(TrackerError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_happy_path_reaches_done() {
        let (tracker, assembler) = tracker(3, 3);
        tracker.submit("alice").unwrap();
        assert_eq!(tracker.begin_fetch("alice").unwrap(), 1);
        assert_eq!(
            tracker.on_fetch_complete("alice", thumbs(2)).unwrap(),
            Transition::Idle
        );
        assert_eq!(tracker.job("alice").unwrap().state, JobState::Batched);
        assert_eq!(assembler.len(), 2);

        assert!(tracker.begin_inference("alice", 1).unwrap());
        assert_eq!(tracker.job("alice").unwrap().state, JobState::Inferring);

        let partial = tracker
            .on_inference_complete("alice", 1, vec![prediction(20.0)])
            .unwrap();
        assert_eq!(partial, Transition::Idle);

        let verdict = emitted(
            tracker
                .on_inference_complete("alice", 1, vec![prediction(30.0)])
                .unwrap(),
        );
        assert_eq!(verdict.status, VerdictStatus::Success);
        assert_eq!(verdict.thumbnails_used, 2);
        assert_eq!(verdict.infer_attempts, 1);
        assert_eq!(tracker.job("alice").unwrap().state, JobState::Done);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_empty_fetch_is_terminal_no_thumbnails() {
        let (tracker, assembler) = tracker(3, 3);
        tracker.submit("bob").unwrap();
        tracker.begin_fetch("bob").unwrap();
        let verdict = emitted(tracker.on_fetch_complete("bob", vec![]).unwrap());
        assert_eq!(verdict.status, VerdictStatus::NoThumbnails);
        assert_eq!(verdict.infer_attempts, 0);
        assert!(assembler.is_empty());
        assert_eq!(tracker.job("bob").unwrap().state, JobState::Failed);
    }

    #[test]
    fn test_transient_fetch_failure_retries_until_exhausted() {
        let (tracker, _) = tracker(2, 3);
        tracker.submit("carol").unwrap();

        tracker.begin_fetch("carol").unwrap();
        let first = tracker
            .on_failure("carol", Failure::Fetch(FetchError::Timeout))
            .unwrap();
        assert_eq!(
            first,
            Transition::RetryFetch {
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(tracker.job("carol").unwrap().state, JobState::Pending);

        assert_eq!(tracker.begin_fetch("carol").unwrap(), 2);
        let verdict = emitted(
            tracker
                .on_failure("carol", Failure::Fetch(FetchError::Timeout))
                .unwrap(),
        );
        assert_eq!(verdict.status, VerdictStatus::FetchFailed);
        assert_eq!(verdict.fetch_attempts, 2);
    }

    #[test]
    fn test_user_not_found_short_circuits_retries() {
        let (tracker, _) = tracker(5, 3);
        tracker.submit("dave").unwrap();
        tracker.begin_fetch("dave").unwrap();
        let verdict = emitted(
            tracker
                .on_failure("dave", Failure::Fetch(FetchError::UserNotFound))
                .unwrap(),
        );
        assert_eq!(verdict.status, VerdictStatus::FetchFailed);
        assert_eq!(verdict.fetch_attempts, 1);
    }

    #[test]
    fn test_all_downloads_failed_is_retried_as_fetch_failure() {
        let (tracker, assembler) = tracker(2, 3);
        tracker.submit("erin").unwrap();
        tracker.begin_fetch("erin").unwrap();
        let transition = tracker
            .on_fetch_complete("erin", vec![ThumbnailAsset::failed("a.jpg", "404")])
            .unwrap();
        assert!(matches!(transition, Transition::RetryFetch { .. }));
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_inference_failure_requeues_then_fails() {
        let (tracker, assembler) = tracker(3, 2);
        tracker.submit("frank").unwrap();
        tracker.begin_fetch("frank").unwrap();
        tracker.on_fetch_complete("frank", thumbs(1)).unwrap();
        assert!(tracker.begin_inference("frank", 1).unwrap());

        let retry = tracker
            .on_failure(
                "frank",
                Failure::Inference {
                    attempt: 1,
                    error: PredictError::ResourceExhausted("oom".into()),
                },
            )
            .unwrap();
        assert!(matches!(retry, Transition::RetryInference { .. }));

        tracker.requeue_inference("frank").unwrap();
        assert_eq!(assembler.len(), 2);
        assert!(!tracker.begin_inference("frank", 1).unwrap());
        assert!(tracker.begin_inference("frank", 2).unwrap());

        let verdict = emitted(
            tracker
                .on_failure(
                    "frank",
                    Failure::Inference {
                        attempt: 2,
                        error: PredictError::ModelError("nan".into()),
                    },
                )
                .unwrap(),
        );
        assert_eq!(verdict.status, VerdictStatus::InferenceFailed);
        assert_eq!(verdict.infer_attempts, 2);
    }

    #[test]
    fn test_stale_results_discarded() {
        let (tracker, _) = tracker(3, 3);
        tracker.submit("gina").unwrap();
        tracker.begin_fetch("gina").unwrap();
        tracker.on_fetch_complete("gina", thumbs(2)).unwrap();
        tracker.begin_inference("gina", 1).unwrap();
        tracker
            .on_failure(
                "gina",
                Failure::Inference {
                    attempt: 1,
                    error: PredictError::Timeout,
                },
            )
            .unwrap();

        let late = tracker
            .on_inference_complete("gina", 1, vec![prediction(40.0)])
            .unwrap();
        assert_eq!(late, Transition::Idle);
        let late_failure = tracker
            .on_failure(
                "gina",
                Failure::Inference {
                    attempt: 1,
                    error: PredictError::Timeout,
                },
            )
            .unwrap();
        assert_eq!(late_failure, Transition::Idle);
        assert_eq!(tracker.job("gina").unwrap().state, JobState::Pending);
    }

    #[test]
    fn test_no_second_emission() {
        let (tracker, _) = tracker(3, 3);
        tracker.submit("hank").unwrap();
        tracker.begin_fetch("hank").unwrap();
        emitted(tracker.on_fetch_complete("hank", vec![]).unwrap());

        let again = tracker.on_fetch_complete("hank", vec![]);
        assert!(matches!(again, Err(TrackerError::InvariantViolation { .. })));
        let fetch_again = tracker.begin_fetch("hank");
        assert!(matches!(
            fetch_again,
            Err(TrackerError::InvariantViolation { .. })
        ));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_excess_results_are_invariant_violation() {
        let (tracker, _) = tracker(3, 3);
        tracker.submit("ivy").unwrap();
        tracker.begin_fetch("ivy").unwrap();
        tracker.on_fetch_complete("ivy", thumbs(1)).unwrap();
        tracker.begin_inference("ivy", 1).unwrap();
        let result = tracker.on_inference_complete("ivy", 1, vec![prediction(1.0), prediction(2.0)]);
        assert!(matches!(result, Err(TrackerError::InvariantViolation { .. })));
    }

    #[test]
    fn test_unfinished_lists_in_flight_jobs() {
        let (tracker, _) = tracker(3, 3);
        for name in ["b", "a", "c"] {
            tracker.submit(name).unwrap();
        }
        tracker.begin_fetch("c").unwrap();
        tracker.on_fetch_complete("c", vec![]).unwrap();
        assert_eq!(tracker.unfinished(), vec!["a".to_string(), "b".to_string()]);
    }
}
