//! Contracts for the collaborators the pipeline drives.
//!
//! Implementations must be thread-safe; the pipeline shares them across
//! fetch tasks and the inference stream.

use async_trait::async_trait;
use std::sync::Arc;

use crate::models::{PredictionResult, ThumbnailAsset, UserVerdict};
use crate::pipeline::error::{FetchError, JobSourceError, PredictError, SinkError};

/// Supplies thumbnail images for a username.
#[async_trait]
pub trait ThumbnailSource: Send + Sync + 'static {
    /// Fetch up to `max_count` thumbnails. Individual images may carry a
    /// `fetch_error`; an empty result means the user has no thumbnails.
    async fn fetch(&self, username: &str, max_count: usize)
        -> Result<Vec<ThumbnailAsset>, FetchError>;
}

/// Runs the age/gender model over a batch of images.
#[async_trait]
pub trait Predictor: Send + Sync + 'static {
    /// Results are aligned positionally with `images`. `None` means the model
    /// found no person in that image.
    async fn infer(
        &self,
        images: &[Arc<[u8]>],
    ) -> Result<Vec<Option<PredictionResult>>, PredictError>;
}

/// Receives every final verdict exactly once. Append-only.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    async fn emit(&self, verdict: &UserVerdict) -> Result<(), SinkError>;

    /// Called once after the last verdict of a run.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Lazy, finite sequence of usernames.
#[async_trait]
pub trait JobSource: Send {
    async fn next(&mut self) -> Result<Option<String>, JobSourceError>;

    /// Called for a delivered username the run refuses to track (a repeat of
    /// one already submitted). It will never reach the sink, so sources that
    /// hold deliveries until acknowledged must release it here.
    async fn reject(&mut self, _username: &str) -> Result<(), JobSourceError> {
        Ok(())
    }
}

/// Optional counters. Implementations must not fail or block.
pub trait MetricsSink: Send + Sync + 'static {
    fn job_completed(&self) {}
    fn job_failed(&self, _status: &str) {}
    fn fetch_retried(&self) {}
    fn batch_dispatched(&self, _fill: usize, _capacity: usize) {}
}

/// Metrics sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Job source over an in-memory list, mostly for tests and one-off runs.
pub struct IterJobSource<I> {
    inner: I,
}

impl<I> IterJobSource<I>
where
    I: Iterator<Item = String> + Send,
{
    pub fn new(inner: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            inner: inner.into_iter(),
        }
    }
}

#[async_trait]
impl<I> JobSource for IterJobSource<I>
where
    I: Iterator<Item = String> + Send,
{
    async fn next(&mut self) -> Result<Option<String>, JobSourceError> {
        Ok(self.inner.next())
    }
}
