//! Task executor: pulls job ids from intake and drives each attempt
//! through workspace, converter, artifact store, and job ledger.
//!
//! ## Attempt lifecycle
//!
//! 1. Claim the job (`Queued -> Running`, attempt count incremented)
//! 2. Acquire a workspace and write the GeoJSON input into it
//! 3. Run the converter on the blocking pool, bounded by the attempt timeout
//! 4. Copy the PDF into the artifact store and mark the job succeeded
//! 5. On failure, re-queue with backoff or mark the job failed
//! 6. Release the workspace, whatever happened

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactStore;
use crate::config::RetryPolicy;
use crate::converter::{ConversionError, ConversionRequest, Converter, PDF_DRIVER};
use crate::job::{ArtifactRef, FailureKind, JobError, JobId, JobRecord, JobStatus};
use crate::queue::JobQueue;
use crate::store::{Claim, JobLedger, StoreError};
use crate::telemetry;
use crate::workspace::{Workspace, WorkspaceManager};

/// Pause after a failed dequeue before trying again.
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Emit a heartbeat every this many dequeued jobs per worker.
const HEARTBEAT_EVERY: u64 = 10;

/// Tries at recording an attempt's outcome before leaving the job
/// `Running` for the reconciler.
const OUTCOME_WRITE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    /// How long a timed-out converter gets to honour cancellation before
    /// its workspace is handed to a background reaper.
    pub cancel_grace: Duration,
    pub driver: String,
    pub creation_options: Vec<String>,
    pub dequeue_wait: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(120),
            cancel_grace: Duration::from_secs(5),
            driver: PDF_DRIVER.to_string(),
            creation_options: vec!["LAYER_CREATION=YES".to_string(), "GEOREF=YES".to_string()],
            dequeue_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    ledger: JobLedger,
    queue: Arc<dyn JobQueue>,
    converter: Arc<dyn Converter>,
    workspaces: WorkspaceManager,
    artifacts: ArtifactStore,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        ledger: JobLedger,
        queue: Arc<dyn JobQueue>,
        converter: Arc<dyn Converter>,
        workspaces: WorkspaceManager,
        artifacts: ArtifactStore,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            ledger,
            queue,
            converter,
            workspaces,
            artifacts,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Runs `concurrency` worker slots until `shutdown` fires. Attempts in
    /// flight when it fires are finished, not abandoned.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(concurrency = self.settings.concurrency, "starting executor");

        let mut handles = Vec::with_capacity(self.settings.concurrency);
        for worker_id in 0..self.settings.concurrency {
            let executor = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                executor.worker_loop(worker_id, shutdown).await
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("executor stopped");
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        info!("Worker {} started", worker_id);
        let mut dequeued: u64 = 0;

        while !shutdown.is_cancelled() {
            let id = match self.queue.pop(self.settings.dequeue_wait).await {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    error!("Worker {} failed to dequeue job: {}", worker_id, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(DEQUEUE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            if let Err(e) = self.process(&id).await {
                error!(job_id = %id, error = %e, "failed to record job progress");
            }

            dequeued += 1;
            if dequeued % HEARTBEAT_EVERY == 0 {
                if let Ok(depth) = self.queue.depth().await {
                    telemetry::record_worker_heartbeat(worker_id, depth);
                }
            }
        }
        info!("Worker {} stopped", worker_id);
    }

    /// Runs one attempt of `id` if it can be claimed.
    ///
    /// Returns the record as this attempt left it, or `None` when the job
    /// was not claimable (already running elsewhere, finished, or still
    /// backing off).
    pub async fn process(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        let record = match self.ledger.claim(id).await? {
            Claim::Started(record) => record,
            Claim::NotDue(at) => {
                let wait = (at - Utc::now()).to_std().unwrap_or_default();
                debug!(job_id = %id, ?wait, "job not due yet, deferring");
                self.push_after(id.clone(), wait);
                return Ok(None);
            }
            Claim::Skipped(status) => {
                debug!(job_id = %id, %status, "skipping job that is not queued");
                return Ok(None);
            }
        };

        info!(
            job_id = %id,
            attempt = record.attempt_count,
            output = %record.payload.output_filename,
            "processing job"
        );

        let finished = match self.attempt(&record).await {
            Ok(artifact) => {
                let ledger = &self.ledger;
                let updated = self
                    .write_outcome(id, move || ledger.succeed(id, artifact.clone()))
                    .await?;
                info!(
                    job_id = %id,
                    attempt = record.attempt_count,
                    duration_ms = ?updated.record.processing_duration_ms(),
                    "job succeeded"
                );
                updated.record
            }
            Err(failure) => self.handle_failure(&record, failure).await?,
        };

        telemetry::record_job_telemetry(&finished);
        Ok(Some(finished))
    }

    async fn attempt(&self, record: &JobRecord) -> Result<ArtifactRef, JobError> {
        let attempt = record.attempt_count;
        let mut workspace = self
            .workspaces
            .acquire(&record.id, attempt)
            .await
            .map_err(|e| JobError::new(FailureKind::TransientIo, e.to_string(), attempt))?;

        let outcome = self.run_in_workspace(record, &mut workspace).await;

        match outcome {
            AttemptOutcome::Finished(result) => {
                // Cleanup problems are logged by release and never change the outcome.
                let _ = workspace.release().await;
                result
            }
            AttemptOutcome::Abandoned(call, error) => {
                // The converter ignored cancellation; reclaim once it returns.
                let job_id = record.id.clone();
                tokio::spawn(async move {
                    let _ = call.await;
                    let _ = workspace.release().await;
                    debug!(job_id = %job_id, "reaped workspace of abandoned attempt");
                });
                Err(error)
            }
        }
    }

    async fn run_in_workspace(&self, record: &JobRecord, workspace: &mut Workspace) -> AttemptOutcome {
        let attempt = record.attempt_count;

        let input = match serde_json::to_vec(&record.payload.geojson) {
            Ok(input) => input,
            Err(e) => {
                return AttemptOutcome::Finished(Err(JobError::new(
                    FailureKind::InternalError,
                    format!("failed to serialize input document: {e}"),
                    attempt,
                )))
            }
        };
        if let Err(e) = tokio::fs::write(workspace.input_path(), input).await {
            return AttemptOutcome::Finished(Err(JobError::new(
                FailureKind::TransientIo,
                format!("failed to write input document: {e}"),
                attempt,
            )));
        }

        let request = ConversionRequest {
            input_path: workspace.input_path(),
            output_path: workspace.output_path(&record.payload.output_filename),
            driver: self.settings.driver.clone(),
            options: self.settings.creation_options.clone(),
        };

        let cancel = CancellationToken::new();
        let mut call = {
            let converter = Arc::clone(&self.converter);
            let request = request.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || converter.convert(&request, &cancel))
        };

        let converted = match tokio::time::timeout(self.settings.attempt_timeout, &mut call).await {
            Ok(joined) => converter_outcome(joined, attempt),
            Err(_) => {
                cancel.cancel();
                let timeout = JobError::new(
                    FailureKind::Timeout,
                    format!("attempt exceeded {:?}", self.settings.attempt_timeout),
                    attempt,
                );
                warn!(job_id = %record.id, attempt, "attempt timed out, cancelling converter");
                if tokio::time::timeout(self.settings.cancel_grace, &mut call).await.is_err() {
                    warn!(job_id = %record.id, attempt, "converter ignored cancellation");
                    return AttemptOutcome::Abandoned(call, timeout);
                }
                Err(timeout)
            }
        };

        let result = match converted {
            Ok(()) => self.collect(record, &request).await,
            Err(e) => Err(e),
        };
        AttemptOutcome::Finished(result)
    }

    /// Checks the converter output and moves it into the artifact store.
    async fn collect(&self, record: &JobRecord, request: &ConversionRequest) -> Result<ArtifactRef, JobError> {
        let attempt = record.attempt_count;
        let size = match tokio::fs::metadata(&request.output_path).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                return Err(JobError::new(
                    FailureKind::InternalError,
                    format!("converter reported success but output is missing: {e}"),
                    attempt,
                ))
            }
        };
        if size == 0 {
            return Err(JobError::new(
                FailureKind::ConversionFailed,
                "converter produced an empty document",
                attempt,
            ));
        }

        self.artifacts
            .persist(&request.output_path, &record.id, &record.payload.output_filename)
            .await
            .map_err(|e| JobError::new(FailureKind::TransientIo, e.to_string(), attempt))
    }

    async fn handle_failure(&self, record: &JobRecord, failure: JobError) -> Result<JobRecord, StoreError> {
        let policy = &self.settings.retry;
        let retry_delay = (failure.kind.is_retryable() && failure.attempt < policy.max_attempts)
            .then(|| policy.delay_for(failure.attempt));
        let retry_at = retry_delay.map(|delay| {
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
        });

        error!(
            job_id = %record.id,
            attempt = failure.attempt,
            kind = %failure.kind,
            error = %failure.message,
            "Job attempt failed"
        );

        let ledger = &self.ledger;
        let id = &record.id;
        let updated = self
            .write_outcome(id, move || ledger.record_failure(id, failure.clone(), retry_at))
            .await?;
        match (updated.record.status, retry_delay) {
            (JobStatus::Queued, Some(delay)) => {
                info!(
                    job_id = %record.id,
                    attempt = updated.record.attempt_count,
                    ?delay,
                    "Job re-queued for retry"
                );
                self.push_after(record.id.clone(), delay);
            }
            (JobStatus::Failed, _) => {
                warn!(
                    job_id = %record.id,
                    attempts = updated.record.attempt_count,
                    kind = ?updated.record.error.as_ref().map(|e| e.kind),
                    "Job failed permanently"
                );
            }
            (status, _) => {
                debug!(job_id = %record.id, %status, "failure not recorded, job changed underneath");
            }
        }
        Ok(updated.record)
    }

    /// Runs a ledger write, retrying transient store failures with the retry
    /// policy's backoff. The attempt already happened, so its outcome is
    /// worth waiting for a flaky store.
    async fn write_outcome<T, F, Fut>(&self, id: &JobId, mut write: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut tries = 1;
        loop {
            match write().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && tries < OUTCOME_WRITE_ATTEMPTS => {
                    let delay = self.settings.retry.delay_for(tries);
                    warn!(job_id = %id, tries, ?delay, error = %e, "failed to record attempt outcome, retrying");
                    tokio::time::sleep(delay).await;
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pushes `id` back to intake once `delay` has passed.
    fn push_after(&self, id: JobId, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.push(&id).await {
                error!(job_id = %id, error = %e, "failed to re-queue job");
            }
        });
    }
}

enum AttemptOutcome {
    Finished(Result<ArtifactRef, JobError>),
    /// The converter is still running past its deadline and grace period.
    Abandoned(tokio::task::JoinHandle<Result<(), ConversionError>>, JobError),
}

fn converter_outcome(
    joined: Result<Result<(), ConversionError>, JoinError>,
    attempt: u32,
) -> Result<(), JobError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(JobError::new(e.kind(), e.to_string(), attempt)),
        Err(e) if e.is_panic() => Err(JobError::new(
            FailureKind::InternalError,
            "converter panicked",
            attempt,
        )),
        Err(e) => Err(JobError::new(
            FailureKind::InternalError,
            format!("converter task failed: {e}"),
            attempt,
        )),
    }
}
