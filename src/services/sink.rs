use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::models::{Gender, UserVerdict, VerdictStatus};
use crate::pipeline::error::SinkError;
use crate::pipeline::traits::Sink;
use crate::services::queue::UsernameQueue;

/// One line of the run report.
#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    username: &'a str,
    predicted_age: Option<f64>,
    predicted_gender: Option<Gender>,
    mean_confidence: Option<f64>,
    thumbnails_used: usize,
    status: VerdictStatus,
    fetch_attempts: u32,
    infer_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    completed_at: DateTime<Utc>,
}

impl<'a> From<&'a UserVerdict> for ReportRow<'a> {
    fn from(verdict: &'a UserVerdict) -> Self {
        Self {
            username: &verdict.username,
            predicted_age: verdict.rounded_age(),
            predicted_gender: verdict.predicted_gender,
            mean_confidence: verdict.mean_confidence.map(|c| (c * 1000.0).round() / 1000.0),
            thumbnails_used: verdict.thumbnails_used,
            status: verdict.status,
            fetch_attempts: verdict.fetch_attempts,
            infer_attempts: verdict.infer_attempts,
            error: verdict.error.as_deref(),
            completed_at: verdict.completed_at,
        }
    }
}

/// Appends each verdict as a JSON line to a local report file.
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Create (or truncate) the report file, making parent directories as needed.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    async fn emit(&self, verdict: &UserVerdict) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&ReportRow::from(verdict))?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.get_mut().sync_all().await?;
        Ok(())
    }
}

/// Wraps a sink and acknowledges each username on the queue once its
/// verdict has been stored.
pub struct AckingSink<S> {
    inner: S,
    queue: UsernameQueue,
}

impl<S: Sink> AckingSink<S> {
    pub fn new(inner: S, queue: UsernameQueue) -> Self {
        Self { inner, queue }
    }
}

#[async_trait]
impl<S: Sink> Sink for AckingSink<S> {
    async fn emit(&self, verdict: &UserVerdict) -> Result<(), SinkError> {
        self.inner.emit(verdict).await?;
        self.queue
            .complete(&verdict.username)
            .await
            .map_err(|e| SinkError::Backend(e.to_string()))
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush().await
    }
}
