use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

/// Allocates and tears down per-job scratch directories. Every job gets its
/// own directory under the root; removal is forced and runs on every exit
/// path of the executor.
#[derive(Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The default root under the OS temp directory.
    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join("codebox")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Create the job's directory. Idempotent.
    pub async fn allocate(&self, job_id: Uuid) -> std::io::Result<PathBuf> {
        let path = self.path_for(job_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Remove the job's directory recursively. Missing directories and
    /// removal failures are tolerated; this runs in cleanup.
    pub async fn remove(&self, job_id: Uuid) {
        let path = self.path_for(job_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(job_id = %job_id, "failed to remove workspace: {}", err),
        }
    }
}
