use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};

/// Lifecycle state of one username's job within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Fetching,
    FetchFailed,
    Batched,
    Inferring,
    Done,
    Failed,
}

impl JobState {
    /// `Done` and `Failed` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// One fetched (or failed-to-fetch) image belonging to a job.
#[derive(Debug, Clone)]
pub struct ThumbnailAsset {
    /// Opaque identifier from the thumbnail source (usually the cover URL).
    pub source_ref: String,
    pub bytes: Option<Arc<[u8]>>,
    pub fetch_error: Option<String>,
}

impl ThumbnailAsset {
    pub fn fetched(source_ref: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            source_ref: source_ref.into(),
            bytes: Some(bytes.into()),
            fetch_error: None,
        }
    }

    pub fn failed(source_ref: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            bytes: None,
            fetch_error: Some(error.into()),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.bytes.is_some()
    }
}

/// A username tracked through fetch, inference and verdict emission.
#[derive(Debug, Clone)]
pub struct Job {
    pub username: String,
    pub state: JobState,
    /// Fetch attempts started so far, first try included.
    pub fetch_attempts: u32,
    /// Inference attempts started so far, first try included.
    pub infer_attempts: u32,
    pub thumbnails: Vec<ThumbnailAsset>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            state: JobState::Pending,
            fetch_attempts: 0,
            infer_attempts: 0,
            thumbnails: Vec::new(),
            last_error: None,
        }
    }

    pub fn usable_thumbnails(&self) -> impl Iterator<Item = &ThumbnailAsset> {
        self.thumbnails.iter().filter(|t| t.is_usable())
    }
}
