use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{JobQueue, QueueError};
use crate::job::JobId;

/// In-process FIFO of job ids.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    ids: Mutex<VecDeque<JobId>>,
    pushed: Notify,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, id: &JobId) -> Result<(), QueueError> {
        self.ids.lock().push_back(id.clone());
        self.pushed.notify_one();
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> Result<Option<JobId>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let next = self.ids.lock().pop_front();
            if next.is_some() {
                return Ok(next);
            }
            if tokio::time::timeout_at(deadline, self.pushed.notified())
                .await
                .is_err()
            {
                return Ok(self.ids.lock().pop_front());
            }
        }
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.ids.lock().len())
    }
}
