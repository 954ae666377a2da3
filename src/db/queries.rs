use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{Gender, UserVerdict, VerdictStatus};
use crate::pipeline::error::SinkError;
use crate::pipeline::traits::Sink;

/// Store a finished verdict. Returns the row ID.
pub async fn insert_verdict(pool: &PgPool, verdict: &UserVerdict) -> Result<Uuid, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO user_verdicts (username, predicted_age, predicted_gender, mean_confidence,
                                   thumbnails_used, status, fetch_attempts, infer_attempts,
                                   error, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(&verdict.username)
    .bind(verdict.predicted_age)
    .bind(verdict.predicted_gender.map(|g| g.to_string()))
    .bind(verdict.mean_confidence)
    .bind(verdict.thumbnails_used as i32)
    .bind(verdict.status.to_string())
    .bind(verdict.fetch_attempts as i32)
    .bind(verdict.infer_attempts as i32)
    .bind(verdict.error.as_deref())
    .bind(verdict.completed_at)
    .fetch_one(pool)
    .await?;

    row.try_get("id")
}

/// Most recent verdict for a username
pub async fn get_latest_verdict(
    pool: &PgPool,
    username: &str,
) -> Result<Option<UserVerdict>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT username, predicted_age, predicted_gender, mean_confidence, thumbnails_used,
               status, fetch_attempts, infer_attempts, error, completed_at
        FROM user_verdicts
        WHERE username = $1
        ORDER BY completed_at DESC
        LIMIT 1
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;

    row.map(|r| verdict_from_row(&r)).transpose()
}

fn verdict_from_row(row: &PgRow) -> Result<UserVerdict, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<VerdictStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let gender: Option<String> = row.try_get("predicted_gender")?;
    let predicted_gender = gender
        .map(|g| g.parse::<Gender>())
        .transpose()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let thumbnails_used: i32 = row.try_get("thumbnails_used")?;
    let fetch_attempts: i32 = row.try_get("fetch_attempts")?;
    let infer_attempts: i32 = row.try_get("infer_attempts")?;

    Ok(UserVerdict {
        username: row.try_get("username")?,
        predicted_age: row.try_get("predicted_age")?,
        predicted_gender,
        mean_confidence: row.try_get("mean_confidence")?,
        thumbnails_used: thumbnails_used.max(0) as usize,
        status,
        fetch_attempts: fetch_attempts.max(0) as u32,
        infer_attempts: infer_attempts.max(0) as u32,
        error: row.try_get("error")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Sink writing each verdict to `user_verdicts`.
pub struct PgVerdictSink {
    pool: PgPool,
}

impl PgVerdictSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Sink for PgVerdictSink {
    async fn emit(&self, verdict: &UserVerdict) -> Result<(), SinkError> {
        insert_verdict(&self.pool, verdict)
            .await
            .map_err(|e| SinkError::Backend(e.to_string()))?;
        Ok(())
    }
}
