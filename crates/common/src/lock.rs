//! Exclusive lock files.
//!
//! Publishing and syncing are triggered by external schedulers that may fire
//! overlapping invocations. Both hold an OS-level exclusive lock on a lock
//! file for their whole duration; a second invocation fails to acquire it and
//! backs off instead of racing on the same files. The lock is released when
//! the guard is dropped or the process dies.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Errors acquiring a lock file.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0} is held by another process")]
    Held(PathBuf),

    #[error("failed to open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Guard holding an exclusive lock file.
#[derive(Debug)]
pub struct ExclusiveLock {
    file: File,
    path: PathBuf,
}

impl ExclusiveLock {
    /// Try to take the lock without blocking.
    ///
    /// Creates the lock file (and its parent directory) if needed. Returns
    /// [`LockError::Held`] if another holder exists.
    pub fn try_acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                trace!(path = %path.display(), "Acquired lock");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!(path = %path.display(), "Lock already held");
                Err(LockError::Held(path.to_path_buf()))
            }
            Err(e) => Err(io_err(e)),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        trace!(path = %self.path.display(), "Released lock");
    }
}
