//! Install state records.
//!
//! ```text
//! state-dir/
//! ├── example.com.state.json   # Last successful install
//! └── example.com.lock         # Held for the duration of a cycle
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use certferry_common::ContentHash;

use crate::errors::StateError;

/// What the client last installed for one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInstallState {
    pub cert_name: String,
    pub last_installed_hash: ContentHash,
    pub dest_path: PathBuf,
    pub installed_at: DateTime<Utc>,
}

/// Directory of state records and lock files.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self, cert_name: &str) -> PathBuf {
        self.dir.join(format!("{}.state.json", cert_name))
    }

    pub fn lock_path(&self, cert_name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", cert_name))
    }

    /// Load the record for `cert_name`.
    ///
    /// A missing record is `None`. An unreadable or corrupt record is also
    /// `None` (logged), which makes the next cycle download unconditionally.
    pub fn load(&self, cert_name: &str) -> Result<Option<ClientInstallState>, StateError> {
        let path = self.state_path(cert_name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StateError::Io { path, source }),
        };

        match serde_json::from_str::<ClientInstallState>(&content) {
            Ok(state) => {
                debug!(
                    cert_name = %cert_name,
                    hash = %state.last_installed_hash.short(),
                    "Loaded install state"
                );
                Ok(Some(state))
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Ignoring corrupt install state"
                );
                Ok(None)
            }
        }
    }

    /// Persist a record, replacing the previous one atomically.
    pub fn save(&self, state: &ClientInstallState) -> Result<(), StateError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StateError::Io { path, source }
        };

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let json = serde_json::to_vec_pretty(state)?;
        let path = self.state_path(&state.cert_name);

        let mut temp = NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
        temp.write_all(&json).map_err(io_err(temp.path()))?;
        temp.as_file().sync_all().map_err(io_err(temp.path()))?;
        temp.persist(&path).map_err(|e| StateError::Io {
            path: path.clone(),
            source: e.error,
        })?;

        debug!(path = %path.display(), "Saved install state");
        Ok(())
    }
}
