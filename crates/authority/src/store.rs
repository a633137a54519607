//! Bundle storage
//!
//! Published bundles live as plain files in the bundle directory.
//!
//! # Directory Structure
//!
//! ```text
//! bundle-dir/
//! ├── example.com.zip        # Current bundle (only file ever served)
//! ├── example.com.zip.prev   # Previous bundle, kept for manual rollback
//! ├── .staging/              # Temporary archives before the final rename
//! └── .locks/
//!     └── example.com.lock   # Held for the duration of a publish
//! ```
//!
//! A bundle appears under its final name only through an atomic rename, so a
//! reader that opens `<name>.zip` always gets one complete archive. Readers
//! open the file once and read everything through that handle; a rename that
//! lands mid-read does not affect them.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use certferry_common::protocol::{is_valid_cert_name, MAX_BUNDLE_SIZE};
use certferry_common::ContentHash;

use crate::errors::StoreError;

/// File extension of published bundles.
pub const BUNDLE_EXTENSION: &str = "zip";

/// A published, immutable certificate bundle.
#[derive(Clone)]
pub struct CertificateBundle {
    /// Logical certificate name
    pub name: String,
    /// SHA-256 of `payload`
    pub content_hash: ContentHash,
    /// Length of `payload`
    pub size_bytes: u64,
    /// When the bundle file was written
    pub created_at: DateTime<Utc>,
    /// Zip archive bytes
    pub payload: Bytes,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("name", &self.name)
            .field("content_hash", &self.content_hash)
            .field("size_bytes", &self.size_bytes)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Identity of a bundle file as seen through an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    #[cfg(unix)]
    ino: u64,
    len: u64,
    modified: Option<SystemTime>,
}

impl FileIdentity {
    fn of(metadata: &fs::Metadata) -> Self {
        Self {
            #[cfg(unix)]
            ino: std::os::unix::fs::MetadataExt::ino(metadata),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

struct CachedBundle {
    identity: FileIdentity,
    bundle: Arc<CertificateBundle>,
}

/// Filesystem-backed bundle store.
///
/// Lookups are cached per name, keyed by the identity of the file behind the
/// name. A republished bundle has a new identity and is read afresh.
pub struct BundleStore {
    dir: PathBuf,
    cache: DashMap<String, CachedBundle>,
}

impl BundleStore {
    /// Create a store rooted at `dir`. The directory is not created here; the
    /// packager creates it on first publish.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    /// Bundle directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path of a bundle
    pub fn bundle_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, BUNDLE_EXTENSION))
    }

    /// Path of the retained previous bundle
    pub fn previous_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.prev", name, BUNDLE_EXTENSION))
    }

    /// Directory for temporary archives. Lives inside the bundle directory so
    /// the final rename never crosses filesystems.
    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(".staging")
    }

    /// Lock file guarding publishes of `name`
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(".locks").join(format!("{}.lock", name))
    }

    /// Look up the current bundle for `name`.
    ///
    /// Returns `Ok(None)` for unknown or invalid names.
    pub fn get(&self, name: &str) -> Result<Option<Arc<CertificateBundle>>, StoreError> {
        if !is_valid_cert_name(name) {
            trace!(name = %name, "Rejected invalid bundle name");
            return Ok(None);
        }

        let path = self.bundle_path(name);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.cache.remove(name);
                return Ok(None);
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let metadata = file.metadata().map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Ok(None);
        }

        let identity = FileIdentity::of(&metadata);
        if let Some(cached) = self.cache.get(name) {
            if cached.identity == identity {
                trace!(name = %name, "Bundle cache hit");
                return Ok(Some(Arc::clone(&cached.bundle)));
            }
        }

        if metadata.len() > MAX_BUNDLE_SIZE {
            return Err(StoreError::TooLarge {
                name: name.to_string(),
                size: metadata.len(),
                limit: MAX_BUNDLE_SIZE,
            });
        }

        let mut payload = Vec::with_capacity(metadata.len() as usize);
        file.read_to_end(&mut payload)
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let bundle = Arc::new(CertificateBundle {
            name: name.to_string(),
            content_hash: ContentHash::of(&payload),
            size_bytes: payload.len() as u64,
            created_at,
            payload: Bytes::from(payload),
        });

        debug!(
            name = %name,
            hash = %bundle.content_hash.short(),
            size = bundle.size_bytes,
            "Loaded bundle from disk"
        );

        self.cache.insert(
            name.to_string(),
            CachedBundle {
                identity,
                bundle: Arc::clone(&bundle),
            },
        );

        Ok(Some(bundle))
    }

    /// Names of all published bundles, sorted.
    ///
    /// Fails if the bundle directory cannot be read; this doubles as the
    /// health check.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let file_name = file_name.to_str()?;
                let stem = file_name.strip_suffix(".zip")?;
                is_valid_cert_name(stem).then(|| stem.to_string())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Drop any cached copy of `name`.
    pub fn invalidate(&self, name: &str) {
        self.cache.remove(name);
    }
}

impl std::fmt::Debug for BundleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleStore")
            .field("dir", &self.dir)
            .field("cached", &self.cache.len())
            .finish()
    }
}
