//! Startup repair of state left behind by a crashed worker process.
//!
//! 1. Scratch directories older than the stale threshold are removed.
//! 2. `Running` records not updated within the threshold lost their worker;
//!    the attempt counts as an internal error and is retried or failed.
//! 3. Every `Queued` record is pushed to intake again. Duplicates are
//!    harmless since claiming goes through the store.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RetryPolicy;
use crate::job::{FailureKind, JobError, JobStatus, Transition};
use crate::queue::JobQueue;
use crate::store::{JobLedger, StoreError};
use crate::workspace::WorkspaceManager;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub swept_workspaces: usize,
    /// Orphaned running jobs sent back to the queue.
    pub recovered: usize,
    /// Orphaned running jobs that had no attempts left.
    pub failed: usize,
    pub requeued: usize,
}

pub struct Reconciler {
    ledger: JobLedger,
    queue: Arc<dyn JobQueue>,
    workspaces: WorkspaceManager,
    retry: RetryPolicy,
    stale_after: Duration,
}

impl Reconciler {
    pub fn new(
        ledger: JobLedger,
        queue: Arc<dyn JobQueue>,
        workspaces: WorkspaceManager,
        retry: RetryPolicy,
        stale_after: Duration,
    ) -> Self {
        Self {
            ledger,
            queue,
            workspaces,
            retry,
            stale_after,
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();

        match self.workspaces.sweep_stale(self.stale_after).await {
            Ok(swept) => report.swept_workspaces = swept,
            Err(e) => warn!(root = %self.workspaces.root().display(), error = %e, "failed to sweep scratch root"),
        }

        let stale = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - stale;
        let max_attempts = self.retry.max_attempts;

        for record in self.ledger.list().await? {
            if record.status == JobStatus::Running && record.updated_at < cutoff {
                let updated = self
                    .ledger
                    .update(&record.id, |r| {
                        if r.status != JobStatus::Running || r.updated_at >= cutoff {
                            return Ok(Transition::Unchanged);
                        }
                        let error = JobError::new(
                            FailureKind::InternalError,
                            "worker stopped before the attempt finished",
                            r.attempt_count,
                        );
                        if r.attempt_count < max_attempts {
                            r.requeue(error, Utc::now())
                        } else {
                            r.fail(error)
                        }
                    })
                    .await?;

                match (updated.transition, updated.record.status) {
                    (Transition::Applied, JobStatus::Queued) => {
                        warn!(job_id = %record.id, attempt = record.attempt_count, "recovered orphaned job");
                        report.recovered += 1;
                    }
                    (Transition::Applied, JobStatus::Failed) => {
                        warn!(job_id = %record.id, "orphaned job had no attempts left");
                        report.failed += 1;
                        continue;
                    }
                    _ => {}
                }
                if updated.record.status != JobStatus::Queued {
                    continue;
                }
            } else if record.status != JobStatus::Queued {
                continue;
            }

            if let Err(e) = self.queue.push(&record.id).await {
                warn!(job_id = %record.id, error = %e, "failed to re-queue job");
                continue;
            }
            report.requeued += 1;
        }

        info!(
            swept = report.swept_workspaces,
            recovered = report.recovered,
            failed = report.failed,
            requeued = report.requeued,
            "reconciliation complete"
        );
        Ok(report)
    }
}
