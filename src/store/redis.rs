//! Redis-backed job store.
//!
//! Each record is a JSON string at `{prefix}:job:{id}`; the set
//! `{prefix}:jobs` indexes ids for listing. Conditional writes run as a Lua
//! script so the revision check and the write are one atomic step.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::time::Duration;
use tracing::debug;

use super::{JobStore, StoreError};
use crate::job::{JobId, JobRecord};

/// Returns 1 on write, 0 on revision mismatch, -1 if the key is gone.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
local decoded = cjson.decode(current)
if tonumber(decoded['revision']) ~= tonumber(ARGV[1]) then
  return 0
end
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

pub struct RedisJobStore {
    conn: ConnectionManager,
    prefix: String,
    /// Expiry applied once a record is terminal; running jobs never expire.
    terminal_ttl: Option<Duration>,
    cas: Script,
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, terminal_ttl: Option<Duration>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            terminal_ttl,
            cas: Script::new(CAS_SCRIPT),
        }
    }

    fn record_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn index_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn ttl_for(&self, record: &JobRecord) -> u64 {
        match self.terminal_ttl {
            Some(ttl) if record.status.is_terminal() => ttl.as_secs().max(1),
            _ => 0,
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;

        let created: Option<String> = redis::cmd("SET")
            .arg(self.record_key(&record.id))
            .arg(&json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if created.is_none() {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        conn.sadd::<_, _, ()>(self.index_key(), record.id.as_str())
            .await?;

        debug!(job_id = %record.id, "inserted job record");
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.record_key(id)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: &JobRecord,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;

        let outcome: i64 = self
            .cas
            .key(self.record_key(&record.id))
            .arg(expected_revision)
            .arg(json)
            .arg(self.ttl_for(record))
            .invoke_async(&mut conn)
            .await?;
        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(StoreError::NotFound(record.id.clone())),
        }
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.index_key()).await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let id = JobId::from(id);
            match self.get(&id).await? {
                Some(record) => records.push(record),
                // Expired terminal record; drop it from the index.
                None => conn.srem::<_, _, ()>(self.index_key(), id.as_str()).await?,
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
