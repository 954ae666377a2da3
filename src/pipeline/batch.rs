//! Batch assembly
//!
//! Collects inference units from many concurrently fetched usernames and
//! releases them as GPU-sized batches. A batch closes when it is full or when
//! its oldest unit has waited `max_wait`, whichever comes first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::models::{InferenceUnit, ThumbnailAsset};

/// Why a batch was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTrigger {
    Full,
    Timeout,
    Drain,
}

#[derive(Debug)]
pub struct Batch {
    pub units: Vec<InferenceUnit>,
    pub trigger: BatchTrigger,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

struct QueueState {
    units: VecDeque<InferenceUnit>,
    closed: bool,
}

pub struct BatchAssembler {
    state: Mutex<QueueState>,
    notify: Notify,
    batch_size: usize,
    max_wait: Duration,
}

impl BatchAssembler {
    pub fn new(batch_size: usize, max_wait: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                units: VecDeque::with_capacity(batch_size),
                closed: false,
            }),
            notify: Notify::new(),
            batch_size: batch_size.max(1),
            max_wait,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Enqueue every usable thumbnail as a unit tagged with `username`.
    /// Never blocks on the consumer. Returns the number of units queued.
    pub fn add(&self, username: &str, attempt: u32, thumbnails: &[ThumbnailAsset]) -> usize {
        let username: Arc<str> = Arc::from(username);
        let now = Instant::now();
        let mut queued = 0;
        {
            let mut state = self.state.lock();
            for thumb in thumbnails {
                let Some(image) = &thumb.bytes else { continue };
                state.units.push_back(InferenceUnit {
                    username: username.clone(),
                    attempt,
                    source_ref: thumb.source_ref.clone(),
                    image: image.clone(),
                    enqueued_at: now,
                });
                queued += 1;
            }
        }
        if queued > 0 {
            self.notify.notify_one();
        }
        queued
    }

    /// Stop waiting on the timer: remaining units are released immediately and
    /// `next_batch` returns `None` once the queue is empty.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().units.is_empty()
    }

    /// Wait for the next batch. Only one consumer is supported.
    pub async fn next_batch(&self) -> Option<Batch> {
        loop {
            let deadline = {
                let mut state = self.state.lock();
                if state.units.len() >= self.batch_size {
                    return Some(self.take(&mut state, BatchTrigger::Full));
                }
                if state.closed {
                    if state.units.is_empty() {
                        return None;
                    }
                    return Some(self.take(&mut state, BatchTrigger::Drain));
                }
                match state.units.front() {
                    Some(oldest) => {
                        let deadline = oldest.enqueued_at + self.max_wait;
                        if Instant::now() >= deadline {
                            return Some(self.take(&mut state, BatchTrigger::Timeout));
                        }
                        Some(deadline)
                    }
                    None => None,
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    fn take(&self, state: &mut QueueState, trigger: BatchTrigger) -> Batch {
        let n = state.units.len().min(self.batch_size);
        let units: Vec<InferenceUnit> = state.units.drain(..n).collect();
        debug!(batch_size = units.len(), trigger = ?trigger, "Batch ready");
        Batch { units, trigger }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thumbs(n: usize) -> Vec<ThumbnailAsset> {
        (0..n)
            .map(|i| ThumbnailAsset::fetched(format!("t{i}.jpg"), vec![i as u8]))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_released_without_timer() {
        let assembler = BatchAssembler::new(4, Duration::from_secs(10));
        assembler.add("alice", 1, &thumbs(2));
        assembler.add("bob", 1, &thumbs(2));

        let start = Instant::now();
        let batch = assembler.next_batch().await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.trigger, BatchTrigger::Full);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_released_after_max_wait() {
        let assembler = BatchAssembler::new(16, Duration::from_millis(250));
        assembler.add("alice", 1, &thumbs(2));

        let start = Instant::now();
        let batch = assembler.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.trigger, BatchTrigger::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_measured_from_oldest_unit() {
        let assembler = Arc::new(BatchAssembler::new(16, Duration::from_millis(100)));
        assembler.add("alice", 1, &thumbs(1));
        tokio::time::advance(Duration::from_millis(60)).await;
        assembler.add("bob", 1, &thumbs(1));

        let start = Instant::now();
        let batch = assembler.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(start.elapsed() <= Duration::from_millis(41));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_arrival_splits_into_batches() {
        let assembler = BatchAssembler::new(4, Duration::from_secs(1));
        assembler.add("alice", 1, &thumbs(6));

        let first = assembler.next_batch().await.unwrap();
        assert_eq!(first.len(), 4);
        let second = assembler.next_batch().await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second.trigger, BatchTrigger::Timeout);
    }

    #[tokio::test]
    async fn test_failed_downloads_not_queued() {
        let assembler = BatchAssembler::new(4, Duration::from_secs(1));
        let assets = vec![
            ThumbnailAsset::fetched("a.jpg", vec![1u8]),
            ThumbnailAsset::failed("b.jpg", "timeout"),
        ];
        assert_eq!(assembler.add("alice", 1, &assets), 1);
        assert_eq!(assembler.len(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let assembler = BatchAssembler::new(8, Duration::from_secs(3600));
        assembler.add("alice", 1, &thumbs(3));
        assembler.close();

        let batch = assembler.next_batch().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.trigger, BatchTrigger::Drain);
        assert!(assembler.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_assembler_waits_for_units() {
        let assembler = BatchAssembler::new(4, Duration::from_secs(1));
        let mut next = tokio_test::task::spawn(assembler.next_batch());
        tokio_test::assert_pending!(next.poll());

        assembler.add("alice", 1, &thumbs(4));
        assert!(next.is_woken());
        let batch = tokio_test::assert_ready!(next.poll()).unwrap();
        assert_eq!(batch.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_consumer_woken_by_add() {
        let assembler = Arc::new(BatchAssembler::new(2, Duration::from_secs(60)));
        let consumer = {
            let assembler = assembler.clone();
            tokio::spawn(async move { assembler.next_batch().await })
        };
        tokio::task::yield_now().await;
        assembler.add("alice", 1, &thumbs(2));

        let batch = consumer.await.unwrap().unwrap();
        assert_eq!(batch.trigger, BatchTrigger::Full);
        assert!(batch.units.iter().all(|u| &*u.username == "alice"));
    }
}
