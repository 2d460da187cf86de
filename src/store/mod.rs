//! Durable job records.
//!
//! Backends implement [`JobStore`], a small compare-and-swap interface over
//! whole records. [`JobLedger`] builds the job state machine on top of it:
//! every transition is read, applied to a copy, and written back only if
//! nobody else wrote in between.

mod memory;
mod redis;

pub use self::memory::MemoryJobStore;
pub use self::redis::RedisJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::job::{
    ArtifactRef, CancelOutcome, FailureKind, JobError, JobId, JobRecord, JobStatus, Transition,
    TransitionError,
};

/// Give up on a transition after this many lost races.
const MAX_CAS_RETRIES: usize = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("job {0}: too many concurrent updates")]
    Contended(JobId),

    #[error("failed to (de)serialize job record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl StoreError {
    /// Whether the same write may succeed if tried again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Redis(_) | StoreError::Contended(_))
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a new record. Fails with `AlreadyExists` on an id clash.
    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Replaces the stored record only if its revision still equals
    /// `expected_revision`. Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: &JobRecord,
    ) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError>;
}

/// A record after a ledger operation, and whether it was written.
#[derive(Debug, Clone)]
pub struct Updated {
    pub record: JobRecord,
    pub transition: Transition,
}

/// Result of trying to start an attempt.
#[derive(Debug, Clone)]
pub enum Claim {
    /// The record is now `Running` with `attempt_count` incremented.
    Started(JobRecord),
    /// Still backing off from the previous failure.
    NotDue(DateTime<Utc>),
    /// Someone else owns it or it is finished.
    Skipped(JobStatus),
}

#[derive(Clone)]
pub struct JobLedger {
    store: Arc<dyn JobStore>,
}

impl JobLedger {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.store.insert(record).await
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.store.list().await
    }

    /// Applies `apply` to the current record and writes it back atomically,
    /// retrying from a fresh read when another writer got there first.
    pub async fn update<F>(&self, id: &JobId, mut apply: F) -> Result<Updated, StoreError>
    where
        F: FnMut(&mut JobRecord) -> Result<Transition, TransitionError> + Send,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let mut record = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            let expected = record.revision;

            let transition = apply(&mut record)?;
            if transition == Transition::Unchanged {
                return Ok(Updated { record, transition });
            }
            if self.store.compare_and_swap(expected, &record).await? {
                return Ok(Updated { record, transition });
            }
            debug!(job_id = %id, revision = expected, "lost update race, retrying");
        }
        Err(StoreError::Contended(id.clone()))
    }

    /// Moves a queued, due job to `Running`. At most one caller wins.
    pub async fn claim(&self, id: &JobId) -> Result<Claim, StoreError> {
        let now = Utc::now();
        let mut refused = None;
        let updated = self
            .update(id, |record| {
                refused = None;
                if record.status != JobStatus::Queued {
                    refused = Some(Claim::Skipped(record.status));
                    return Ok(Transition::Unchanged);
                }
                if let Some(at) = record.retry_at.filter(|at| *at > now) {
                    refused = Some(Claim::NotDue(at));
                    return Ok(Transition::Unchanged);
                }
                record.start_attempt()
            })
            .await?;
        Ok(refused.unwrap_or(Claim::Started(updated.record)))
    }

    pub async fn succeed(&self, id: &JobId, artifact: ArtifactRef) -> Result<Updated, StoreError> {
        self.update(id, |record| record.succeed(artifact.clone())).await
    }

    /// Records the failure of the running attempt.
    ///
    /// With `retry_at` the job goes back to `Queued`; without it the job
    /// fails. A pending cancel request overrides a retry.
    pub async fn record_failure(
        &self,
        id: &JobId,
        error: JobError,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Updated, StoreError> {
        self.update(id, |record| {
            if record.status != JobStatus::Running {
                return Ok(Transition::Unchanged);
            }
            if record.cancel_requested {
                let mut cancelled = JobError::new(
                    FailureKind::Cancelled,
                    format!("cancelled while running; last attempt: {}", error.message),
                    error.attempt,
                );
                cancelled.at = error.at;
                return record.fail(cancelled);
            }
            match retry_at {
                Some(at) => record.requeue(error.clone(), at),
                None => record.fail(error.clone()),
            }
        })
        .await
    }

    pub async fn cancel(&self, id: &JobId) -> Result<CancelOutcome, StoreError> {
        let mut outcome = None;
        self.update(id, |record| {
            let (result, transition) = record.request_cancel();
            outcome = Some(result);
            Ok(transition)
        })
        .await?;
        // update() always runs the closure at least once before returning Ok.
        Ok(outcome.unwrap_or(CancelOutcome::CancelRequested))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPayload;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn ledger() -> (JobLedger, JobRecord) {
        let store = Arc::new(MemoryJobStore::new());
        let record = JobRecord::new(
            JobId::generate(),
            JobPayload {
                geojson: serde_json::json!({"type": "Point", "coordinates": [0, 0]}),
                output_filename: "map.pdf".to_string(),
            },
        );
        (JobLedger::new(store), record)
    }

    fn artifact() -> ArtifactRef {
        ArtifactRef {
            path: PathBuf::from("/a/map.pdf"),
            file_name: "map.pdf".to_string(),
            size_bytes: 1,
        }
    }

    #[tokio::test]
    async fn test_claim_starts_attempt_once() {
        let (ledger, record) = ledger();
        ledger.create(&record).await.unwrap();

        let Claim::Started(running) = ledger.claim(&record.id).await.unwrap() else {
            panic!("expected the first claim to win");
        };
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempt_count, 1);

        assert!(matches!(
            ledger.claim(&record.id).await.unwrap(),
            Claim::Skipped(JobStatus::Running)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        let (ledger, record) = ledger();
        ledger.create(&record).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let id = record.id.clone();
            handles.push(tokio::spawn(async move { ledger.claim(&id).await.unwrap() }));
        }
        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Claim::Started(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(ledger.get(&record.id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn test_claim_respects_backoff() {
        let (ledger, record) = ledger();
        ledger.create(&record).await.unwrap();
        ledger.claim(&record.id).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(60);
        let error = JobError::new(FailureKind::Timeout, "slow", 1);
        let updated = ledger
            .record_failure(&record.id, error, Some(later))
            .await
            .unwrap();
        assert_eq!(updated.record.status, JobStatus::Queued);

        assert!(matches!(
            ledger.claim(&record.id).await.unwrap(),
            Claim::NotDue(at) if at == later
        ));
    }

    #[tokio::test]
    async fn test_failure_without_retry_is_terminal() {
        let (ledger, record) = ledger();
        ledger.create(&record).await.unwrap();
        ledger.claim(&record.id).await.unwrap();

        let error = JobError::new(FailureKind::ConversionFailed, "bad rings", 1);
        let updated = ledger.record_failure(&record.id, error.clone(), None).await.unwrap();
        assert_eq!(updated.record.status, JobStatus::Failed);
        assert_eq!(updated.record.error, Some(error));
        assert!(updated.record.result.is_none());
    }

    #[tokio::test]
    async fn test_cancel_request_overrides_retry() {
        let (ledger, record) = ledger();
        ledger.create(&record).await.unwrap();
        ledger.claim(&record.id).await.unwrap();

        assert_eq!(
            ledger.cancel(&record.id).await.unwrap(),
            CancelOutcome::CancelRequested
        );
        let error = JobError::new(FailureKind::TransientIo, "flaky disk", 1);
        let updated = ledger
            .record_failure(&record.id, error, Some(Utc::now()))
            .await
            .unwrap();
        assert_eq!(updated.record.status, JobStatus::Failed);
        assert_eq!(
            updated.record.error.map(|e| e.kind),
            Some(FailureKind::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_success_wins_over_pending_cancel() {
        let (ledger, record) = ledger();
        ledger.create(&record).await.unwrap();
        ledger.claim(&record.id).await.unwrap();
        ledger.cancel(&record.id).await.unwrap();

        let updated = ledger.succeed(&record.id, artifact()).await.unwrap();
        assert_eq!(updated.record.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_second_terminal_write_with_other_status_errors() {
        let (ledger, record) = ledger();
        ledger.create(&record).await.unwrap();
        ledger.claim(&record.id).await.unwrap();
        ledger.succeed(&record.id, artifact()).await.unwrap();

        let again = ledger.succeed(&record.id, artifact()).await.unwrap();
        assert_eq!(again.transition, Transition::Unchanged);

        let err = ledger
            .update(&record.id, |r| {
                r.fail(JobError::new(FailureKind::InternalError, "late", 1))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Transition(TransitionError::TerminalConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (ledger, _) = ledger();
        assert!(matches!(
            ledger.claim(&JobId::from("missing")).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
