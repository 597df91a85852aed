//! Project lock.
//!
//! At most one orchestrator may target a project directory. The state
//! file's read-modify-write sequence is only safe under that
//! assumption, so the lock is a required safety check, not an
//! afterthought. Implemented as an advisory exclusive lock on a file
//! under the project root; released when the guard drops.

use crate::errors::LockError;
use crate::layout;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Holds the exclusive project lock for its lifetime.
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    /// Acquire the lock, failing fast with `Busy` when another
    /// orchestrator already holds it.
    pub fn acquire(project_root: &Path) -> Result<Self, LockError> {
        fs::create_dir_all(project_root).map_err(|source| LockError::Io {
            path: project_root.to_path_buf(),
            source,
        })?;
        let path = project_root.join(layout::LOCK_FILE);
        let file = File::options()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Project lock acquired");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(LockError::Busy { path })
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "Failed to release project lock");
        }
    }
}
