//! Submission gateway: validates requests, records jobs, and hands them to
//! intake without waiting for conversion.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::job::{CancelOutcome, JobId, JobPayload, JobRecord, JobView};
use crate::queue::JobQueue;
use crate::store::{JobLedger, StoreError};
use crate::validate::{self, ValidationError};

/// Returned to the caller as soon as the job is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: JobId,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to record job: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct SubmissionGateway {
    ledger: JobLedger,
    queue: Arc<dyn JobQueue>,
}

impl SubmissionGateway {
    pub fn new(ledger: JobLedger, queue: Arc<dyn JobQueue>) -> Self {
        Self { ledger, queue }
    }

    /// Accepts a raw request body. Bytes that are not JSON are a
    /// validation failure like any other malformed submission.
    pub async fn submit_bytes(&self, body: &[u8]) -> Result<JobHandle, SubmitError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ValidationError::single("$", format!("body is not valid JSON: {e}")))?;
        self.submit(value).await
    }

    /// Validates `body`, creates exactly one `Queued` record, and pushes it
    /// to intake. Never waits on the converter.
    pub async fn submit(&self, body: Value) -> Result<JobHandle, SubmitError> {
        let submission = validate::parse_submission(body)?;

        let id = JobId::generate();
        let output_filename = submission
            .output_filename
            .unwrap_or_else(|| format!("map-{id}.pdf"));
        let record = JobRecord::new(
            id.clone(),
            JobPayload {
                geojson: submission.geojson,
                output_filename,
            },
        );
        self.ledger.create(&record).await?;

        // The record is durable at this point; a failed push is recovered
        // by the reconciler re-queueing every Queued record on startup.
        if let Err(e) = self.queue.push(&id).await {
            error!(job_id = %id, error = %e, "failed to push job to intake");
        }

        info!(
            job_id = %id,
            output = %record.payload.output_filename,
            "Enqueued job"
        );
        Ok(JobHandle { job_id: id })
    }

    pub async fn status(&self, id: &JobId) -> Result<Option<JobView>, StoreError> {
        Ok(self.ledger.get(id).await?.map(|record| record.view()))
    }

    /// Cancels a job. `None` if the id is unknown.
    pub async fn cancel(&self, id: &JobId) -> Result<Option<CancelOutcome>, StoreError> {
        match self.ledger.cancel(id).await {
            Ok(outcome) => {
                info!(job_id = %id, ?outcome, "cancel requested");
                Ok(Some(outcome))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::queue::MemoryJobQueue;
    use crate::store::MemoryJobStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn gateway() -> (SubmissionGateway, Arc<MemoryJobStore>, Arc<MemoryJobQueue>) {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let gateway = SubmissionGateway::new(JobLedger::new(store.clone()), queue.clone());
        (gateway, store, queue)
    }

    fn point() -> Value {
        json!({"type": "Feature", "geometry": {"type": "Point", "coordinates": [4.9, 52.4]}, "properties": {}})
    }

    #[tokio::test]
    async fn test_submit_records_and_enqueues_one_job() {
        let (gateway, store, queue) = gateway();
        let handle = gateway
            .submit(json!({"geojson": point(), "outputFilename": "map.pdf"}))
            .await
            .unwrap();

        let records = crate::store::JobStore::list(store.as_ref()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, handle.job_id);
        assert_eq!(records[0].status, JobStatus::Queued);
        assert_eq!(records[0].payload.output_filename, "map.pdf");

        let popped = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(popped, Some(handle.job_id));
    }

    #[tokio::test]
    async fn test_default_filename_derives_from_id() {
        let (gateway, _, _) = gateway();
        let handle = gateway.submit(json!({"geojson": point()})).await.unwrap();
        let view = gateway.status(&handle.job_id).await.unwrap().unwrap();
        assert_eq!(view.output_filename, format!("map-{}.pdf", handle.job_id));
    }

    #[tokio::test]
    async fn test_invalid_submission_creates_nothing() {
        let (gateway, store, queue) = gateway();
        let err = gateway
            .submit(json!({"geojson": {"type": "Polygon", "coordinates": "nope"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));

        let err = gateway.submit_bytes(b"{not json").await.unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));

        assert!(crate::store::JobStore::list(store.as_ref()).await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_none() {
        let (gateway, _, _) = gateway();
        assert_eq!(gateway.cancel(&JobId::from("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let (gateway, _, _) = gateway();
        let handle = gateway.submit(json!({"geojson": point()})).await.unwrap();
        assert_eq!(
            gateway.cancel(&handle.job_id).await.unwrap(),
            Some(CancelOutcome::Cancelled)
        );
        let view = gateway.status(&handle.job_id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Failed);
    }
}
