use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::time::Instant;

/// Gender classes produced by the age/gender model.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Gender {
    Female,
    Male,
}

/// Per-image model output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct PredictionResult {
    #[garde(custom(finite), range(min = 0.0))]
    pub age: f64,

    #[garde(skip)]
    pub gender: Gender,

    #[garde(custom(finite), range(min = 0.0, max = 1.0))]
    pub confidence: f64,
}

fn finite(value: &f64, _ctx: &()) -> garde::Result {
    if !value.is_finite() {
        return Err(garde::Error::new("must be a finite number"));
    }
    Ok(())
}

impl PredictionResult {
    pub fn new(age: f64, gender: Gender, confidence: f64) -> Self {
        Self {
            age,
            gender,
            confidence,
        }
    }
}

/// One image queued for a GPU batch, tagged with the job it routes back to.
#[derive(Debug, Clone)]
pub struct InferenceUnit {
    pub username: Arc<str>,
    /// Inference attempt this unit belongs to; results for older attempts are discarded.
    pub attempt: u32,
    pub source_ref: String,
    pub image: Arc<[u8]>,
    pub enqueued_at: Instant,
}
