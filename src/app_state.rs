use sqlx::PgPool;
use std::sync::Arc;

use crate::services::queue::UsernameQueue;

/// Shared state for the worker's HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<UsernameQueue>,
}

impl AppState {
    pub fn new(db: PgPool, queue: UsernameQueue) -> Self {
        Self {
            db,
            queue: Arc::new(queue),
        }
    }
}
