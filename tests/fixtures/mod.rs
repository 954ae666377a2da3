//! Canned model outputs

#![allow(dead_code)]

use creator_demographics::models::{Gender, PredictionResult};

/// Output for any image not otherwise scripted.
pub fn default_prediction() -> PredictionResult {
    PredictionResult::new(30.0, Gender::Female, 0.9)
}

pub fn female(age: f64, confidence: f64) -> Option<PredictionResult> {
    Some(PredictionResult::new(age, Gender::Female, confidence))
}

pub fn male(age: f64, confidence: f64) -> Option<PredictionResult> {
    Some(PredictionResult::new(age, Gender::Male, confidence))
}

/// No person detected in the image.
pub fn nobody() -> Option<PredictionResult> {
    None
}
