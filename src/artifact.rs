//! Durable home for finished PDFs.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::job::{ArtifactRef, JobId};

/// Longest single path component common filesystems accept.
const NAME_MAX: usize = 255;

/// Byte length of a generated (hyphenated UUID) job id.
const JOB_ID_BYTES: usize = 36;

const STAGING_SUFFIX: &str = ".partial";

/// Longest output file name whose staging name `.{job_id}-{name}.partial`
/// still fits in one path component.
pub const MAX_OUTPUT_FILENAME_BYTES: usize =
    NAME_MAX - JOB_ID_BYTES - ".-".len() - STAGING_SUFFIX.len();

#[derive(Debug, Error)]
#[error("failed to persist artifact {path}: {source}")]
pub struct ArtifactError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Directory of finished artifacts, named `{job_id}-{output_filename}` so
/// concurrent jobs asking for the same name never collide.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name_for(job_id: &JobId, output_filename: &str) -> String {
        format!("{job_id}-{output_filename}")
    }

    /// Copies `source` into the store. The copy lands under a staging name
    /// first and is renamed into place, so readers never see half a file.
    pub async fn persist(
        &self,
        source: &Path,
        job_id: &JobId,
        output_filename: &str,
    ) -> Result<ArtifactRef, ArtifactError> {
        let file_name = Self::file_name_for(job_id, output_filename);
        let dest = self.root.join(&file_name);
        let staging = self.root.join(format!(".{file_name}{STAGING_SUFFIX}"));
        let at = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| ArtifactError { path, source }
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(at(&self.root))?;
        let size_bytes = tokio::fs::copy(source, &staging).await.map_err(at(&staging))?;
        if let Err(e) = tokio::fs::rename(&staging, &dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(at(&dest)(e));
        }

        info!(job_id = %job_id, path = %dest.display(), size_bytes, "stored artifact");
        Ok(ArtifactRef {
            path: dest,
            file_name,
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_persist_copies_under_job_scoped_name() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("map.pdf");
        std::fs::write(&source, b"%PDF-1.7 test").unwrap();

        let store = ArtifactStore::new(dir.path().join("artifacts"));
        let artifact = store
            .persist(&source, &JobId::from("job-9"), "map.pdf")
            .await
            .unwrap();

        assert_eq!(artifact.file_name, "job-9-map.pdf");
        assert_eq!(artifact.size_bytes, 13);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"%PDF-1.7 test");
        assert!(source.exists());
        let leftovers: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_same_output_name_for_two_jobs_does_not_collide() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("map.pdf");
        std::fs::write(&source, b"%PDF").unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"));

        let a = store.persist(&source, &JobId::from("a"), "map.pdf").await.unwrap();
        let b = store.persist(&source, &JobId::from("b"), "map.pdf").await.unwrap();
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn test_longest_accepted_name_fits_the_filesystem() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("map.pdf");
        std::fs::write(&source, b"%PDF").unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"));

        let name = format!("{}.pdf", "a".repeat(MAX_OUTPUT_FILENAME_BYTES - 4));
        assert_eq!(name.len(), MAX_OUTPUT_FILENAME_BYTES);
        let artifact = store
            .persist(&source, &JobId::generate(), &name)
            .await
            .unwrap();
        assert!(artifact.path.exists());
        assert!(artifact.file_name.ends_with(&name));
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"));
        let err = store
            .persist(&dir.path().join("absent.pdf"), &JobId::from("a"), "map.pdf")
            .await
            .unwrap_err();
        assert_eq!(err.source.kind(), io::ErrorKind::NotFound);
    }
}
