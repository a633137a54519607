//! Error types for the sync client.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use certferry_common::{ContentHash, LockError};

/// Errors failing a sync cycle. Nothing on the destination changes unless the
/// error says otherwise.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server rejected the request (401): check token and whitelist")]
    Unauthorized,

    #[error("certificate '{0}' not found on server")]
    NotFound(String),

    #[error("server error (HTTP {0})")]
    Server(u16),

    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("response carried no valid content hash")]
    MissingHash,

    #[error("bundle of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("integrity check failed: server advertised {expected}, received {actual}")]
    Integrity {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("install failed: {0}")]
    Install(#[from] InstallError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Transport failures and 5xx responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Server(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

/// Errors extracting or activating a bundle.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("destination {0} has no parent directory or file name")]
    InvalidDestination(PathBuf),

    #[error("destination {0} exists and is not a directory or symlink")]
    DestinationConflict(PathBuf),

    #[error("archive is not readable: {0}")]
    Archive(String),

    #[error("archive entry '{0}' escapes the destination")]
    UnsafePath(String),

    #[error("archive contains no files")]
    EmptyArchive,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("installing is not supported on this platform")]
    Unsupported,
}

impl InstallError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> InstallError {
        let path = path.into();
        move |source| InstallError::Io { path, source }
    }
}

/// Errors reading or writing the install state record.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}
