//! Redis list used as the cross-process intake queue.
//!
//! `BLPOP` parks the connection it runs on until an id arrives or the wait
//! expires, and a multiplexed connection answers its commands in order. So
//! blocking pops never share the manager that pushes and job records use;
//! each pop borrows a connection of its own from a small idle pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::debug;

use super::{JobQueue, QueueError};
use crate::job::JobId;

/// BLPOP treats 0 as "block forever", so waits are clamped to at least this.
const MIN_BLOCK_SECONDS: f64 = 0.1;

/// Job ids are RPUSHed and BLPOPed for FIFO order.
pub struct RedisJobQueue {
    conn: ConnectionManager,
    client: Client,
    /// Connections reserved for blocking pops, at most one pop on each.
    idle: Mutex<Vec<MultiplexedConnection>>,
    key: String,
}

impl RedisJobQueue {
    /// Creates a queue stored at `{prefix}:queue`. `conn` serves pushes and
    /// depth queries; `client` opens the connections pops block on.
    pub fn new(conn: ConnectionManager, client: Client, prefix: &str) -> Self {
        Self {
            conn,
            client,
            idle: Mutex::new(Vec::new()),
            key: format!("{prefix}:queue"),
        }
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let idle = self.idle.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                debug!("opening blocking intake connection");
                Ok(self.client.get_multiplexed_async_connection().await?)
            }
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, id: &JobId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.key, id.as_str()).await?;
        debug!(job_id = %id, "pushed job to intake");
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> Result<Option<JobId>, QueueError> {
        let mut conn = self.blocking_connection().await?;
        let timeout = wait.as_secs_f64().max(MIN_BLOCK_SECONDS);
        // A connection whose pop failed is dropped rather than reused.
        let popped: Option<(String, String)> = conn.blpop(&self.key, timeout).await?;
        self.idle.lock().push(conn);

        Ok(popped.map(|(_key, id)| {
            debug!(job_id = %id, "popped job from intake");
            JobId::from(id)
        }))
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance.
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    async fn queue() -> RedisJobQueue {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let conn = ConnectionManager::new(client.clone()).await.unwrap();
        let prefix = format!("geopdf-test-{}", uuid::Uuid::new_v4().simple());
        RedisJobQueue::new(conn, client, &prefix)
    }

    #[tokio::test]
    #[ignore]
    async fn test_push_pop_fifo() {
        let queue = queue().await;
        queue.push(&JobId::from("first")).await.unwrap();
        queue.push(&JobId::from("second")).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 2);

        let wait = Duration::from_secs(1);
        assert_eq!(queue.pop(wait).await.unwrap(), Some(JobId::from("first")));
        assert_eq!(queue.pop(wait).await.unwrap(), Some(JobId::from("second")));
    }

    #[tokio::test]
    #[ignore]
    async fn test_blocked_pops_do_not_delay_pushes() {
        let queue = std::sync::Arc::new(queue().await);
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            waiters.push(tokio::spawn(async move {
                queue.pop(Duration::from_secs(5)).await.unwrap()
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        queue.push(&JobId::from("urgent")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let woken = waiters.iter().filter(|w| w.is_finished()).count();
        assert_eq!(woken, 1);
        for waiter in waiters {
            waiter.abort();
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_pop_times_out_on_empty_queue() {
        let queue = queue().await;
        assert_eq!(queue.pop(Duration::from_millis(200)).await.unwrap(), None);
    }
}
