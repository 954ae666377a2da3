use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::UserVerdict;

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitJobsRequest {
    #[garde(length(min = 1, max = 1000), inner(length(min = 1, max = 64)))]
    pub usernames: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobsResponse {
    pub enqueued: usize,
    pub queue_depth: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

/// Trimmed, `@`-stripped usernames in submission order, without repeats.
fn normalize(usernames: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    usernames
        .iter()
        .map(|name| name.trim().trim_start_matches('@').to_string())
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect()
}

/// POST /api/v1/jobs: queue usernames for demographic estimation.
pub async fn submit_jobs(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobsRequest>,
) -> Result<(StatusCode, Json<SubmitJobsResponse>), ApiError> {
    request
        .validate()
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    let usernames = normalize(&request.usernames);
    if usernames.is_empty() {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "no usable usernames"));
    }

    state.queue.enqueue(&usernames).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to enqueue usernames");
        api_error(StatusCode::SERVICE_UNAVAILABLE, "queue unavailable")
    })?;

    let queue_depth = state.queue.queue_depth().await.unwrap_or_default();
    metrics::gauge!("demographics_queue_depth").set(queue_depth as f64);
    tracing::info!(enqueued = usernames.len(), queue_depth, "Usernames enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobsResponse {
            enqueued: usernames.len(),
            queue_depth,
        }),
    ))
}

/// GET /api/v1/verdicts/{username}: latest stored verdict.
pub async fn get_verdict(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<UserVerdict>, ApiError> {
    let verdict = queries::get_latest_verdict(&state.db, &username)
        .await
        .map_err(|e| {
            tracing::error!(username = %username, error = %e, "Verdict lookup failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        })?;

    verdict
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no verdict for '{username}'")))
}
