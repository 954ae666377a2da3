use chrono::Utc;

use crate::models::{Gender, PredictionResult, UserVerdict, VerdictStatus};

/// Reduces the per-image predictions of one username to a single verdict.
///
/// - gender: majority vote; ties go to the higher cumulative confidence, then
///   to `Gender::Female`
/// - age: confidence-weighted mean over all predictions, regardless of the
///   predicted gender of each image
/// - mean_confidence: arithmetic mean of the per-image confidences
#[derive(Debug, Default, Clone, Copy)]
pub struct ResultAggregator;

/// Attempt counters copied onto the verdict.
#[derive(Debug, Default, Clone, Copy)]
pub struct Attempts {
    pub fetch: u32,
    pub infer: u32,
}

impl ResultAggregator {
    /// Build the verdict for a job whose every unit resolved.
    ///
    /// An empty `predictions` slice means the model found no person in any
    /// thumbnail.
    pub fn aggregate(
        &self,
        username: &str,
        predictions: &[PredictionResult],
        attempts: Attempts,
    ) -> UserVerdict {
        let Some((age, gender, confidence)) = reduce(predictions) else {
            return self.degraded(
                username,
                VerdictStatus::NoSubject,
                attempts,
                Some("No person detected in any thumbnail".to_string()),
            );
        };

        UserVerdict {
            username: username.to_string(),
            predicted_age: Some(age),
            predicted_gender: Some(gender),
            mean_confidence: Some(confidence),
            thumbnails_used: predictions.len(),
            status: VerdictStatus::Success,
            fetch_attempts: attempts.fetch,
            infer_attempts: attempts.infer,
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// Verdict without age/gender for a job that could not produce predictions.
    pub fn degraded(
        &self,
        username: &str,
        status: VerdictStatus,
        attempts: Attempts,
        error: Option<String>,
    ) -> UserVerdict {
        UserVerdict {
            username: username.to_string(),
            predicted_age: None,
            predicted_gender: None,
            mean_confidence: None,
            thumbnails_used: 0,
            status,
            fetch_attempts: attempts.fetch,
            infer_attempts: attempts.infer,
            error,
            completed_at: Utc::now(),
        }
    }
}

fn reduce(predictions: &[PredictionResult]) -> Option<(f64, Gender, f64)> {
    match predictions {
        [] => None,
        [only] => Some((only.age, only.gender, only.confidence)),
        _ => Some((
            weighted_age(predictions),
            majority_gender(predictions),
            predictions.iter().map(|p| p.confidence).sum::<f64>() / predictions.len() as f64,
        )),
    }
}

fn weighted_age(predictions: &[PredictionResult]) -> f64 {
    let total_weight: f64 = predictions.iter().map(|p| p.confidence).sum();
    if total_weight <= 0.0 {
        return predictions.iter().map(|p| p.age).sum::<f64>() / predictions.len() as f64;
    }
    predictions.iter().map(|p| p.age * p.confidence).sum::<f64>() / total_weight
}

fn majority_gender(predictions: &[PredictionResult]) -> Gender {
    let tally = |gender: Gender| {
        predictions
            .iter()
            .filter(|p| p.gender == gender)
            .fold((0usize, 0.0f64), |(votes, conf), p| (votes + 1, conf + p.confidence))
    };
    let (female_votes, female_conf) = tally(Gender::Female);
    let (male_votes, male_conf) = tally(Gender::Male);

    if male_votes > female_votes || (male_votes == female_votes && male_conf > female_conf) {
        Gender::Male
    } else {
        Gender::Female
    }
}
