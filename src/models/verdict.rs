use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::prediction::Gender;

/// Outcome class of a user's verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerdictStatus {
    Success,
    NoThumbnails,
    /// Thumbnails were inferred but the model found no person in any of them.
    NoSubject,
    FetchFailed,
    InferenceFailed,
}

/// Final per-username output. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserVerdict {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_age: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_gender: Option<Gender>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_confidence: Option<f64>,
    pub thumbnails_used: usize,
    pub status: VerdictStatus,
    pub fetch_attempts: u32,
    pub infer_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl UserVerdict {
    pub fn is_success(&self) -> bool {
        self.status == VerdictStatus::Success
    }

    /// Age rounded to one decimal for reports.
    pub fn rounded_age(&self) -> Option<f64> {
        self.predicted_age.map(|age| (age * 10.0).round() / 10.0)
    }
}
