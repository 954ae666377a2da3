use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::{Gender, PredictionResult};
use crate::pipeline::error::PredictError;
use crate::pipeline::traits::Predictor;

/// Client for the age/gender model server.
///
/// The server runs person/face detection and the age/gender model on each
/// image of a batch and answers with one entry per image, `null` when nobody
/// was detected.
pub struct ModelServerClient {
    http: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<Option<RawPrediction>>,
}

#[derive(Deserialize)]
struct RawPrediction {
    age: f64,
    gender: String,
    confidence: f64,
}

impl RawPrediction {
    fn into_result(self) -> Result<PredictionResult, PredictError> {
        let gender: Gender = self
            .gender
            .parse()
            .map_err(|_| PredictError::ModelError(format!("unknown gender label '{}'", self.gender)))?;
        Ok(PredictionResult {
            age: self.age.max(0.0),
            gender,
            confidence: self.confidence.clamp(0.0, 1.0),
        })
    }
}

impl ModelServerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Check the model server answers (for health checks).
    pub async fn health_check(&self) -> Result<(), PredictError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).send().await.map_err(model_error)?;
        if !response.status().is_success() {
            return Err(PredictError::ModelError(format!(
                "health check returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Predictor for ModelServerClient {
    async fn infer(&self, images: &[Arc<[u8]>]) -> Result<Vec<Option<PredictionResult>>, PredictError> {
        let encoded: Vec<String> = images
            .iter()
            .map(|image| base64::engine::general_purpose::STANDARD.encode(image))
            .collect();

        let request_body = serde_json::json!({ "images": encoded });

        let response = self
            .http
            .post(format!("{}/predict", self.base_url))
            .json(&request_body)
            .send()
            .await
            .map_err(model_error)?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                return Err(PredictError::ResourceExhausted(format!(
                    "model server returned HTTP {}",
                    response.status()
                )));
            }
            status => {
                return Err(PredictError::ModelError(format!(
                    "model server returned HTTP {status}"
                )));
            }
        }

        let body: PredictResponse = response.json().await.map_err(model_error)?;
        if body.predictions.len() != images.len() {
            return Err(PredictError::Misaligned {
                expected: images.len(),
                got: body.predictions.len(),
            });
        }

        body.predictions
            .into_iter()
            .map(|p| p.map(RawPrediction::into_result).transpose())
            .collect()
    }
}

fn model_error(e: reqwest::Error) -> PredictError {
    if e.is_timeout() {
        PredictError::Timeout
    } else {
        PredictError::ModelError(e.to_string())
    }
}
