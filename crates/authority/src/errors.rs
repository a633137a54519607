//! Error types for the authority node.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reading bundles from the bundle directory.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bundle '{name}' is {size} bytes, above the {limit} byte limit")]
    TooLarge { name: String, size: u64, limit: u64 },
}

/// Errors publishing a bundle.
///
/// On every variant the previously published bundle (if any) is left in place
/// and keeps being served.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("source directory {path} is unusable: {reason}")]
    SourceMissing { path: PathBuf, reason: String },

    #[error("required file '{file}' missing from {path}")]
    MissingRequiredFile { file: String, path: PathBuf },

    #[error("invalid certificate name '{0}'")]
    InvalidName(String),

    #[error("another publish of '{0}' is in progress")]
    Busy(String),

    #[error("failed to write bundle via {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to move bundle into place at {path}: {source}")]
    RenameFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Error returned by a [`HostResolver`](crate::whitelist::HostResolver).
#[derive(Debug, Clone, Error)]
#[error("failed to resolve {host}: {message}")]
pub struct ResolveError {
    pub host: String,
    pub message: String,
}

impl ResolveError {
    pub fn new(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            message: message.into(),
        }
    }
}

/// Errors setting up or running the distribution server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] io::Error),
}
