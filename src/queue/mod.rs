//! Intake queue between the submission gateway and the executor.
//!
//! The queue only carries job ids. It is a wake-up signal, not the source
//! of truth: the executor claims each id through the job store, so a
//! duplicated or stale id is skipped rather than run twice.

mod memory;
mod redis;

pub use self::memory::MemoryJobQueue;
pub use self::redis::RedisJobQueue;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::job::JobId;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, id: &JobId) -> Result<(), QueueError>;

    /// Waits up to `wait` for the next id.
    async fn pop(&self, wait: Duration) -> Result<Option<JobId>, QueueError>;

    /// Number of ids waiting.
    async fn depth(&self) -> Result<usize, QueueError>;
}
