//! Per-attempt scratch directories.
//!
//! Every attempt gets its own empty directory under the scratch root. The
//! manager also keeps the set of jobs that currently hold a workspace, so a
//! second attempt for the same job cannot start while the first one still
//! owns storage.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::job::JobId;

/// Directory name prefix of every workspace; the reconciler sweeps by it.
pub const WORKSPACE_PREFIX: &str = "geojson-pdf-";

const INPUT_FILE_NAME: &str = "input.geojson";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("job {0} already holds a live workspace")]
    Busy(JobId),

    #[error("failed to create workspace under {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to remove workspace {path} after {attempts} tries: {source}")]
    Cleanup {
        path: PathBuf,
        attempts: u32,
        source: io::Error,
    },
}

/// How hard `release` tries before giving up on a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    cleanup: CleanupPolicy,
    live: Arc<Mutex<HashSet<JobId>>>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, cleanup: CleanupPolicy) -> Self {
        Self {
            root: root.into(),
            cleanup,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocates a fresh, empty directory for one attempt of `job_id`.
    pub async fn acquire(&self, job_id: &JobId, attempt: u32) -> Result<Workspace, WorkspaceError> {
        if !self.live.lock().insert(job_id.clone()) {
            return Err(WorkspaceError::Busy(job_id.clone()));
        }

        let dir = self.root.join(format!(
            "{WORKSPACE_PREFIX}{job_id}-{attempt}-{}",
            Uuid::new_v4().simple()
        ));
        // Owns the live slot from here on, so an early return or a dropped
        // future frees it.
        let workspace = Workspace {
            job_id: job_id.clone(),
            dir,
            cleanup: self.cleanup,
            live: Arc::clone(&self.live),
            released: false,
        };

        // create_dir fails on an existing path, so two handles never alias.
        if let Err(source) = tokio::fs::create_dir_all(&self.root).await {
            return Err(workspace.creation_failed(source));
        }
        if let Err(source) = tokio::fs::create_dir(&workspace.dir).await {
            return Err(workspace.creation_failed(source));
        }

        debug!(job_id = %job_id, attempt, path = %workspace.dir.display(), "acquired workspace");
        Ok(workspace)
    }

    pub fn is_live(&self, job_id: &JobId) -> bool {
        self.live.lock().contains(job_id)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Removes workspace directories left behind by attempts that never
    /// released them (a crashed process). Only directories whose last
    /// modification is older than `older_than` are touched.
    pub async fn sweep_stale(&self, older_than: Duration) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < older_than {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to sweep stale workspace"),
            }
        }
        Ok(removed)
    }
}

/// Exclusive scratch directory for a single attempt.
///
/// Call [`Workspace::release`] when the attempt ends. Dropping an
/// unreleased workspace makes one best-effort removal.
#[derive(Debug)]
pub struct Workspace {
    job_id: JobId,
    dir: PathBuf,
    cleanup: CleanupPolicy,
    live: Arc<Mutex<HashSet<JobId>>>,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn input_path(&self) -> PathBuf {
        self.dir.join(INPUT_FILE_NAME)
    }

    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Gives up a workspace whose directory was never created.
    fn creation_failed(mut self, source: io::Error) -> WorkspaceError {
        self.released = true;
        self.live.lock().remove(&self.job_id);
        WorkspaceError::Create {
            path: self.dir.clone(),
            source,
        }
    }

    /// Removes the directory and everything in it. Idempotent.
    ///
    /// Removal is retried per the cleanup policy, since the converter may
    /// still be closing files. A final failure is returned for logging but
    /// the job slot is freed either way.
    pub async fn release(&mut self) -> Result<(), WorkspaceError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.live.lock().remove(&self.job_id);

        let attempts = self.cleanup.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match tokio::fs::remove_dir_all(&self.dir).await {
                Ok(()) => {
                    debug!(job_id = %self.job_id, path = %self.dir.display(), "released workspace");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    debug!(job_id = %self.job_id, attempt, error = %e, "workspace removal failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.cleanup.delay).await;
                    }
                }
            }
        }

        let source = last_error.unwrap_or_else(|| io::Error::other("workspace removal failed"));
        warn!(
            job_id = %self.job_id,
            path = %self.dir.display(),
            error = %source,
            "workspace cleanup gave up"
        );
        Err(WorkspaceError::Cleanup {
            path: self.dir.clone(),
            attempts,
            source,
        })
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.live.lock().remove(&self.job_id);
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.dir.display(), error = %e, "failed to remove dropped workspace");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(root: &TempDir) -> WorkspaceManager {
        WorkspaceManager::new(root.path().join("scratch"), CleanupPolicy::default())
    }

    fn residue(root: &Path) -> usize {
        std::fs::read_dir(root).map(|entries| entries.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_acquire_creates_empty_unique_directories() {
        let root = TempDir::new().unwrap();
        let manager = manager(&root);

        let mut a = manager.acquire(&JobId::from("a"), 1).await.unwrap();
        let mut b = manager.acquire(&JobId::from("b"), 1).await.unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert_eq!(std::fs::read_dir(a.path()).unwrap().count(), 0);
        assert!(a.path().starts_with(manager.root()));

        a.release().await.unwrap();
        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_handle_for_same_job_is_refused() {
        let root = TempDir::new().unwrap();
        let manager = manager(&root);
        let id = JobId::from("job");

        let mut first = manager.acquire(&id, 1).await.unwrap();
        assert!(matches!(manager.acquire(&id, 2).await, Err(WorkspaceError::Busy(_))));
        assert!(manager.is_live(&id));

        first.release().await.unwrap();
        assert!(!manager.is_live(&id));
        let mut second = manager.acquire(&id, 2).await.unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_removes_partial_output_and_is_idempotent() {
        let root = TempDir::new().unwrap();
        let manager = manager(&root);
        let mut ws = manager.acquire(&JobId::from("job"), 1).await.unwrap();

        std::fs::write(ws.input_path(), b"{}").unwrap();
        std::fs::create_dir(ws.path().join("nested")).unwrap();
        std::fs::write(ws.path().join("nested/partial.pdf"), b"%PDF-").unwrap();

        ws.release().await.unwrap();
        assert!(!ws.path().exists());
        assert!(ws.is_released());
        ws.release().await.unwrap();
        assert_eq!(residue(manager.root()), 0);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_release_tolerates_directory_already_gone() {
        let root = TempDir::new().unwrap();
        let manager = manager(&root);
        let mut ws = manager.acquire(&JobId::from("job"), 1).await.unwrap();

        std::fs::remove_dir_all(ws.path()).unwrap();
        ws.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_reclaims_unreleased_workspace() {
        let root = TempDir::new().unwrap();
        let manager = manager(&root);
        let path = {
            let ws = manager.acquire(&JobId::from("job"), 1).await.unwrap();
            std::fs::write(ws.output_path("out.pdf"), b"%PDF-").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_prefixed_directories() {
        let root = TempDir::new().unwrap();
        let manager = manager(&root);
        std::fs::create_dir_all(manager.root()).unwrap();
        std::fs::create_dir(manager.root().join(format!("{WORKSPACE_PREFIX}crashed-1-x"))).unwrap();
        std::fs::create_dir(manager.root().join("unrelated")).unwrap();

        assert_eq!(manager.sweep_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(manager.sweep_stale(Duration::ZERO).await.unwrap(), 1);
        assert!(manager.root().join("unrelated").exists());
    }

    #[tokio::test]
    async fn test_sweep_of_missing_root_is_noop() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().join("absent"), CleanupPolicy::default());
        assert_eq!(manager.sweep_stale(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_create_frees_the_job_slot() {
        let root = TempDir::new().unwrap();
        // A regular file where the scratch root should be.
        let blocked = root.path().join("scratch");
        std::fs::write(&blocked, b"").unwrap();
        let manager = WorkspaceManager::new(&blocked, CleanupPolicy::default());
        let id = JobId::from("job");

        assert!(matches!(
            manager.acquire(&id, 1).await,
            Err(WorkspaceError::Create { .. })
        ));
        assert!(!manager.is_live(&id));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_release_gives_up_after_policy_attempts() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(
            root.path().join("scratch"),
            CleanupPolicy {
                attempts: 3,
                delay: Duration::from_millis(1),
            },
        );
        let id = JobId::from("job");
        let mut ws = manager.acquire(&id, 1).await.unwrap();

        // remove_dir_all refuses a non-directory, whatever the privileges.
        std::fs::remove_dir(ws.path()).unwrap();
        std::fs::write(ws.path(), b"not a directory").unwrap();

        match ws.release().await {
            Err(WorkspaceError::Cleanup { attempts, path, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(path, ws.path());
            }
            other => panic!("expected a cleanup failure, got {other:?}"),
        }
        assert!(!manager.is_live(&id));
        assert!(ws.release().await.is_ok());
        std::fs::remove_file(ws.path()).unwrap();
    }
}
