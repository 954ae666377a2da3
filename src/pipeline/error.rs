use std::time::Duration;

/// Failure fetching thumbnails for one username.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Rate limited by thumbnail source")]
    RateLimited { retry_after: Option<Duration> },

    #[error("User not found")]
    UserNotFound,

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Fetch deadline exceeded")]
    Timeout,
}

impl FetchError {
    /// Permanent failures short-circuit the retry budget.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::UserNotFound)
    }
}

/// Wholesale failure of one Predictor call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PredictError {
    #[error("Model error: {0}")]
    ModelError(String),

    #[error("GPU resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Inference deadline exceeded")]
    Timeout,

    #[error("Predictor returned {got} results for a batch of {expected}")]
    Misaligned { expected: usize, got: usize },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackerError {
    #[error("Username already submitted in this run: {0}")]
    DuplicateJob(String),

    #[error("Username not tracked in this run: {0}")]
    UnknownJob(String),

    #[error("Job invariant violated for {username}: {detail}")]
    InvariantViolation { username: String, detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Sink backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum JobSourceError {
    #[error("Job source I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job source backend error: {0}")]
    Backend(String),

    #[error("Malformed job source input: {0}")]
    Malformed(String),
}

/// Systemic failures that stop a run. Per-username failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    #[error("Job source failed: {0}")]
    JobSource(#[from] JobSourceError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Predictor unavailable after {consecutive_failures} consecutive batch failures: {last_error}")]
    PredictorUnavailable {
        consecutive_failures: u32,
        last_error: PredictError,
    },

    #[error("Sink failed: {0}")]
    Sink(#[from] SinkError),
}
