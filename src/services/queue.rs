use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::pipeline::error::JobSourceError;
use crate::pipeline::traits::JobSource;

const QUEUE_KEY: &str = "demographics:usernames";
const PROCESSING_KEY: &str = "demographics:processing";

/// Redis-backed username queue.
///
/// Dequeued usernames move to a processing list and stay there until
/// `complete` is called, so a crashed worker leaves them recoverable.
#[derive(Clone)]
pub struct UsernameQueue {
    client: redis::Client,
}

impl UsernameQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Enqueue usernames for processing.
    pub async fn enqueue(&self, usernames: &[String]) -> Result<(), QueueError> {
        if usernames.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, usernames)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Dequeue a username (non-blocking pop with move to processing list).
    pub async fn dequeue(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.connection().await?;
        let username: Option<String> = conn
            .rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;
        Ok(username)
    }

    /// Acknowledge a username whose verdict has been stored.
    pub async fn complete(&self, username: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, username)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Move every unacknowledged username back to the queue (worker start-up).
    pub async fn requeue_unacknowledged(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let mut moved = 0;
        loop {
            let username: Option<String> = conn
                .rpoplpush(PROCESSING_KEY, QUEUE_KEY)
                .await
                .map_err(QueueError::Redis)?;
            if username.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Get the current queue depth (pending usernames).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

/// Job source draining the queue until it is empty.
pub struct QueueJobSource {
    queue: UsernameQueue,
}

impl QueueJobSource {
    pub fn new(queue: UsernameQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl JobSource for QueueJobSource {
    async fn next(&mut self) -> Result<Option<String>, JobSourceError> {
        self.queue
            .dequeue()
            .await
            .map_err(|e| JobSourceError::Backend(e.to_string()))
    }

    /// Drop the repeated copy from the processing list; the first copy is
    /// acknowledged by the sink once its verdict is stored.
    async fn reject(&mut self, username: &str) -> Result<(), JobSourceError> {
        self.queue
            .complete(username)
            .await
            .map_err(|e| JobSourceError::Backend(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
