//! Job records and the per-job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Opaque job identifier, assigned once at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Closed set of failure kinds recorded on a job.
///
/// Submission validation failures never reach a record, so they have no
/// variant here; see [`crate::validate::ValidationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The converter is missing a driver or binary this deployment needs.
    CapabilityUnavailable,
    /// The converter rejected the document itself.
    ConversionFailed,
    Timeout,
    TransientIo,
    InternalError,
    Cancelled,
}

impl FailureKind {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::TransientIo | FailureKind::InternalError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::CapabilityUnavailable => "capability_unavailable",
            FailureKind::ConversionFailed => "conversion_failed",
            FailureKind::Timeout => "timeout",
            FailureKind::TransientIo => "transient_io",
            FailureKind::InternalError => "internal_error",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            at: Utc::now(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (attempt {}): {}", self.kind, self.attempt, self.message)
    }
}

/// What the caller asked for. Immutable once the record exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub geojson: serde_json::Value,
    pub output_filename: String,
}

/// Locator of a finished PDF in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("job {id}: cannot move from {from} to {to}")]
    Invalid {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {id} already finished as {current}, refusing {requested}")]
    TerminalConflict {
        id: JobId,
        current: JobStatus,
        requested: JobStatus,
    },
}

/// Result of applying a transition to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The record already had the requested state; nothing to write.
    Unchanged,
}

/// Outcome of a client cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job had not started and is now failed as cancelled.
    Cancelled,
    /// The job is running; the current attempt decides the outcome.
    CancelRequested,
    AlreadyFinished { status: JobStatus },
}

/// Durable record of one conversion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Bumped on every write; the store compares it to detect lost updates.
    pub revision: u64,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub attempt_count: u32,
    pub result: Option<ArtifactRef>,
    pub error: Option<JobError>,
    /// Failures of earlier attempts that were retried.
    #[serde(default)]
    pub failures: Vec<JobError>,
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: JobId, payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id,
            revision: 0,
            status: JobStatus::Queued,
            payload,
            attempt_count: 0,
            result: None,
            error: None,
            failures: Vec::new(),
            retry_at: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    fn invalid(&self, to: JobStatus) -> TransitionError {
        TransitionError::Invalid {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// Queued -> Running, counting a new attempt.
    pub fn start_attempt(&mut self) -> Result<Transition, TransitionError> {
        if self.status != JobStatus::Queued {
            return Err(self.invalid(JobStatus::Running));
        }
        self.status = JobStatus::Running;
        self.attempt_count += 1;
        self.retry_at = None;
        self.touch();
        Ok(Transition::Applied)
    }

    /// Running -> Queued after a retryable failure.
    pub fn requeue(
        &mut self,
        error: JobError,
        retry_at: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Queued));
        }
        self.status = JobStatus::Queued;
        self.failures.push(error);
        self.retry_at = Some(retry_at);
        self.touch();
        Ok(Transition::Applied)
    }

    pub fn succeed(&mut self, artifact: ArtifactRef) -> Result<Transition, TransitionError> {
        match self.status {
            JobStatus::Running => {
                self.status = JobStatus::Succeeded;
                self.result = Some(artifact);
                self.error = None;
                self.touch();
                Ok(Transition::Applied)
            }
            JobStatus::Succeeded => Ok(Transition::Unchanged),
            JobStatus::Failed => Err(TransitionError::TerminalConflict {
                id: self.id.clone(),
                current: self.status,
                requested: JobStatus::Succeeded,
            }),
            JobStatus::Queued => Err(self.invalid(JobStatus::Succeeded)),
        }
    }

    /// Marks the job failed. Allowed from Queued for cancellation and
    /// crash recovery, and from Running at the end of an attempt.
    pub fn fail(&mut self, error: JobError) -> Result<Transition, TransitionError> {
        match self.status {
            JobStatus::Queued | JobStatus::Running => {
                self.status = JobStatus::Failed;
                self.error = Some(error);
                self.result = None;
                self.retry_at = None;
                self.touch();
                Ok(Transition::Applied)
            }
            JobStatus::Failed => Ok(Transition::Unchanged),
            JobStatus::Succeeded => Err(TransitionError::TerminalConflict {
                id: self.id.clone(),
                current: self.status,
                requested: JobStatus::Failed,
            }),
        }
    }

    /// Applies a cancellation request and reports what happened.
    pub fn request_cancel(&mut self) -> (CancelOutcome, Transition) {
        match self.status {
            JobStatus::Queued => {
                let error = JobError::new(
                    FailureKind::Cancelled,
                    "cancelled before it started",
                    self.attempt_count,
                );
                self.status = JobStatus::Failed;
                self.error = Some(error);
                self.retry_at = None;
                self.touch();
                (CancelOutcome::Cancelled, Transition::Applied)
            }
            JobStatus::Running if self.cancel_requested => {
                (CancelOutcome::CancelRequested, Transition::Unchanged)
            }
            JobStatus::Running => {
                self.cancel_requested = true;
                self.touch();
                (CancelOutcome::CancelRequested, Transition::Applied)
            }
            status => (
                CancelOutcome::AlreadyFinished { status },
                Transition::Unchanged,
            ),
        }
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        if self.status.is_terminal() {
            Some(
                self.updated_at
                    .signed_duration_since(self.created_at)
                    .num_milliseconds(),
            )
        } else {
            None
        }
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            status: self.status,
            output_filename: self.payload.output_filename.clone(),
            attempt_count: self.attempt_count,
            result: self.result.clone(),
            error: self.error.clone(),
            failures: self.failures.clone(),
            retry_at: self.retry_at,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Client-facing projection of a record, without the input document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub output_filename: String,
    pub attempt_count: u32,
    pub result: Option<ArtifactRef>,
    pub error: Option<JobError>,
    pub failures: Vec<JobError>,
    pub retry_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
