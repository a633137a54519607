//! Bundle packaging
//!
//! Turns a certificate issuer's live directory into a published bundle:
//!
//! 1. Take the per-name publish lock (a concurrent publish fails with `Busy`)
//! 2. Collect every file below the source directory, following symlinks
//! 3. Build a deterministic zip archive in memory and hash it
//! 4. Write it to a temporary file under `.staging/` and fsync
//! 5. Copy the current bundle to `<name>.zip.prev`
//! 6. Rename the temporary file over `<name>.zip`
//!
//! The archive is deterministic: entries are sorted, timestamps are fixed and
//! only the unix permission bits of the source are recorded. Publishing the
//! same certificate files twice yields the same content hash, so sync clients
//! do not reinstall after a no-op renewal hook.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, trace, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use certferry_common::protocol::is_valid_cert_name;
use certferry_common::{ContentHash, ExclusiveLock, LockError};

use crate::errors::PackagingError;
use crate::store::{BundleStore, CertificateBundle};

/// Environment variable set by certbot for deploy hooks.
pub const RENEWED_LINEAGE_ENV: &str = "RENEWED_LINEAGE";

/// Symlink chains and nested directories deeper than this are rejected.
const MAX_DEPTH: usize = 16;

/// A file to be archived.
#[derive(Debug)]
struct SourceFile {
    /// Archive path, `/`-separated, relative to the source directory
    name: String,
    path: PathBuf,
    mode: u32,
}

/// Packages certificate directories into the bundle store.
pub struct Packager {
    store: Arc<BundleStore>,
    required_files: Vec<String>,
}

impl Packager {
    /// Create a packager writing into `store`.
    ///
    /// `required_files` are archive paths that must be present in every
    /// source directory (typically `fullchain.pem` and `privkey.pem`).
    pub fn new(store: Arc<BundleStore>, required_files: Vec<String>) -> Self {
        Self {
            store,
            required_files,
        }
    }

    /// Package `source_dir` and publish it as `cert_name`.
    pub fn publish(
        &self,
        source_dir: &Path,
        cert_name: &str,
    ) -> Result<CertificateBundle, PackagingError> {
        if !is_valid_cert_name(cert_name) {
            return Err(PackagingError::InvalidName(cert_name.to_string()));
        }

        let _lock = ExclusiveLock::try_acquire(&self.store.lock_path(cert_name)).map_err(
            |e| match e {
                LockError::Held(_) => PackagingError::Busy(cert_name.to_string()),
                LockError::Io { path, source } => PackagingError::WriteFailed { path, source },
            },
        )?;

        let files = collect_source_files(source_dir)?;
        let present: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
        for required in &self.required_files {
            if !present.contains(required.as_str()) {
                return Err(PackagingError::MissingRequiredFile {
                    file: required.clone(),
                    path: source_dir.to_path_buf(),
                });
            }
        }

        let staging = self.store.staging_dir();
        let archive = build_archive(&files).map_err(|source| PackagingError::WriteFailed {
            path: staging.clone(),
            source,
        })?;
        let content_hash = ContentHash::of(&archive);

        debug!(
            cert_name = %cert_name,
            files = files.len(),
            size = archive.len(),
            hash = %content_hash.short(),
            "Built bundle archive"
        );

        let final_path = self.store.bundle_path(cert_name);
        if let Ok(Some(current)) = self.store.get(cert_name) {
            if current.content_hash == content_hash {
                info!(
                    cert_name = %cert_name,
                    hash = %content_hash.short(),
                    "Bundle unchanged, keeping current file"
                );
                return Ok((*current).clone());
            }
        }

        let temp = write_staged(&staging, &archive)?;

        if final_path.exists() {
            let prev = self.store.previous_path(cert_name);
            if let Err(e) = fs::copy(&final_path, &prev) {
                warn!(
                    cert_name = %cert_name,
                    path = %prev.display(),
                    error = %e,
                    "Failed to retain previous bundle"
                );
            }
        }

        // Dropping the PersistError removes the temporary file
        temp.persist(&final_path)
            .map_err(|e| PackagingError::RenameFailed {
                path: final_path.clone(),
                source: e.error,
            })?;
        self.store.invalidate(cert_name);

        let created_at = fs::metadata(&final_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        info!(
            cert_name = %cert_name,
            hash = %content_hash,
            size = archive.len(),
            path = %final_path.display(),
            "Published certificate bundle"
        );

        Ok(CertificateBundle {
            name: cert_name.to_string(),
            content_hash,
            size_bytes: archive.len() as u64,
            created_at,
            payload: Bytes::from(archive),
        })
    }
}

/// Resolve the source directory and certificate name for a publish.
///
/// Precedence for the directory: explicit argument, `RENEWED_LINEAGE`, then
/// `<live_dir>/<configured name>`. The name defaults to the directory's
/// final component.
pub fn resolve_source(
    explicit_dir: Option<&Path>,
    explicit_name: Option<&str>,
    renewed_lineage: Option<&str>,
    live_dir: &Path,
    configured_name: Option<&str>,
) -> Option<(PathBuf, String)> {
    let name_hint = explicit_name.or(configured_name);

    let dir = match (explicit_dir, renewed_lineage.filter(|s| !s.is_empty())) {
        (Some(dir), _) => dir.to_path_buf(),
        (None, Some(lineage)) => PathBuf::from(lineage),
        (None, None) => live_dir.join(name_hint?),
    };

    let name = match explicit_name {
        Some(name) => name.to_string(),
        None => dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .or_else(|| configured_name.map(str::to_string))?,
    };

    Some((dir, name))
}

fn collect_source_files(source_dir: &Path) -> Result<Vec<SourceFile>, PackagingError> {
    let missing = |reason: String| PackagingError::SourceMissing {
        path: source_dir.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(source_dir).map_err(|e| missing(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(missing("not a directory".to_string()));
    }

    let mut files = Vec::new();
    walk(source_dir, "", 0, &mut files).map_err(|e| missing(e.to_string()))?;
    if files.is_empty() {
        return Err(missing("no files".to_string()));
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn walk(dir: &Path, prefix: &str, depth: usize, out: &mut Vec<SourceFile>) -> io::Result<()> {
    if depth > MAX_DEPTH {
        return Err(io::Error::other(format!(
            "directory nesting deeper than {} at {}",
            MAX_DEPTH,
            dir.display()
        )));
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            warn!(path = %entry.path().display(), "Skipping non UTF-8 file name");
            continue;
        };

        let path = entry.path();
        // Follows symlinks: certbot's live directory links into archive/
        let metadata = fs::metadata(&path)?;
        let name = if prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", prefix, file_name)
        };

        if metadata.is_dir() {
            walk(&path, &name, depth + 1, out)?;
        } else if metadata.is_file() {
            trace!(name = %name, "Adding file to bundle");
            out.push(SourceFile {
                name,
                path,
                mode: file_mode(&metadata),
            });
        }
    }

    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn build_archive(files: &[SourceFile]) -> io::Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for file in files {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(file.mode);

        let contents = fs::read(&file.path)?;
        writer
            .start_file(file.name.as_str(), options)
            .map_err(io::Error::other)?;
        writer.write_all(&contents)?;
    }

    let cursor = writer.finish().map_err(io::Error::other)?;
    Ok(cursor.into_inner())
}

fn write_staged(staging: &Path, archive: &[u8]) -> Result<NamedTempFile, PackagingError> {
    let write_failed = |source| PackagingError::WriteFailed {
        path: staging.to_path_buf(),
        source,
    };

    fs::create_dir_all(staging).map_err(write_failed)?;
    let mut temp = NamedTempFile::new_in(staging).map_err(write_failed)?;
    temp.write_all(archive).map_err(write_failed)?;
    temp.as_file().sync_all().map_err(write_failed)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))
            .map_err(write_failed)?;
    }

    Ok(temp)
}
