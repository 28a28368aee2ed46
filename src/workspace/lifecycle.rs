//! Per-job workspace directories.
//!
//! A `Workspace` is created exclusively for one request id and removed when the job ends.
//! If the owning future is dropped early (client went away) the directory is removed on drop.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{PipelineError, PipelineResult};

#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    armed: bool,
}

impl Workspace {
    /// Create `<root>/<request_id>`. Fails with `WorkspaceBusy` if it already exists.
    pub async fn create(root: &Path, request_id: &str) -> PipelineResult<Self> {
        tokio::fs::create_dir_all(root).await?;
        let path = std::path::absolute(root.join(request_id))?;
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PipelineError::WorkspaceBusy(request_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        debug!(path = %path.display(), "workspace created");
        Ok(Workspace { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// End the workspace's life: remove it, or keep it when `retain` is set.
    ///
    /// Returns the path if it was retained. Removal errors are logged, never returned.
    pub async fn finish(mut self, retain: bool) -> Option<PathBuf> {
        self.armed = false;
        if retain {
            info!(path = %self.path.display(), "retaining workspace for inspection");
            return Some(self.path.clone());
        }
        if let Err(e) = cleanup(&self.path).await {
            warn!("cleanup error: {e}");
        }
        None
    }
}

impl Drop for Workspace {
    /// Only reached when the job future is dropped before `finish`, e.g. on client
    /// disconnect. Removal is synchronous and blocks the current worker thread.
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "abandoned workspace removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "cleanup error: {e}"),
        }
    }
}

/// Remove a workspace directory. A directory that is already gone is not an error.
pub async fn cleanup(path: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "workspace removed");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PipelineError::CleanupFailure {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn finish_removes_directory() {
        let root = tempdir().unwrap();
        let ws = Workspace::create(root.path(), "job-1").await.unwrap();
        let path = ws.path().to_path_buf();
        std::fs::write(path.join("file"), b"x").unwrap();

        assert!(ws.finish(false).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn finish_can_retain() {
        let root = tempdir().unwrap();
        let ws = Workspace::create(root.path(), "job-2").await.unwrap();
        let kept = ws.finish(true).await.unwrap();
        assert!(kept.is_dir());
    }

    #[tokio::test]
    async fn drop_removes_directory() {
        let root = tempdir().unwrap();
        let path = {
            let ws = Workspace::create(root.path(), "job-3").await.unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn duplicate_request_id_is_busy() {
        let root = tempdir().unwrap();
        let _first = Workspace::create(root.path(), "same").await.unwrap();
        let err = Workspace::create(root.path(), "same").await.unwrap_err();
        assert!(matches!(err, PipelineError::WorkspaceBusy(id) if id == "same"));
    }

    #[tokio::test]
    async fn cleanup_of_missing_dir_is_ok() {
        let root = tempdir().unwrap();
        cleanup(&root.path().join("never-existed")).await.unwrap();
    }
}
