//! Atomic installation of bundles
//!
//! The destination path is a symlink into a versions directory beside it:
//!
//! ```text
//! /etc/ssl/
//! ├── example.com -> .example.com.versions/<hash>
//! └── .example.com.versions/
//!     ├── <hash>/             # current
//!     ├── <previous hash>/    # kept for rollback
//!     └── .staging-XXXXXX/    # extraction in progress
//! ```
//!
//! A bundle is extracted into a staging directory, renamed to its hash, and
//! then activated by renaming a fresh symlink over the destination. Each
//! step is a single rename, so the destination resolves to either the old
//! complete version or the new one, whatever point the process dies at.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, trace, warn};
use zip::ZipArchive;

use certferry_common::ContentHash;

use crate::errors::InstallError;

/// Manages the versions directory and symlink for one destination.
#[derive(Debug, Clone)]
pub struct Installer {
    dest: PathBuf,
}

impl Installer {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self { dest: dest.into() }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn parts(&self) -> Result<(&Path, String), InstallError> {
        let invalid = || InstallError::InvalidDestination(self.dest.clone());
        let parent = self.dest.parent().ok_or_else(invalid)?;
        let name = self
            .dest
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(invalid)?;
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        Ok((parent, name.to_string()))
    }

    fn versions_dir_name(name: &str) -> String {
        format!(".{}.versions", name)
    }

    /// Directory holding extracted versions.
    pub fn versions_dir(&self) -> Result<PathBuf, InstallError> {
        let (parent, name) = self.parts()?;
        Ok(parent.join(Self::versions_dir_name(&name)))
    }

    /// Hash of the version the destination currently resolves to, if it is
    /// a managed symlink pointing at an existing version.
    pub fn current_version(&self) -> Option<ContentHash> {
        let target = fs::read_link(&self.dest).ok()?;
        let hash: ContentHash = target.file_name()?.to_str()?.parse().ok()?;
        // Follows the link: a dangling link is not an installed version
        self.dest.is_dir().then_some(hash)
    }

    /// Extract `payload` and make it the destination.
    ///
    /// Returns the version directory now behind the destination.
    pub fn install(&self, hash: &ContentHash, payload: &[u8]) -> Result<PathBuf, InstallError> {
        let (parent, name) = self.parts()?;
        self.recover_interrupted_move();

        let versions = parent.join(Self::versions_dir_name(&name));
        fs::create_dir_all(&versions).map_err(InstallError::io(&versions))?;

        let hex = hash.to_hex();
        let version_dir = versions.join(&hex);

        if version_dir.is_dir() {
            debug!(version = %hash.short(), "Version already extracted, reusing");
        } else {
            let staging = tempfile::Builder::new()
                .prefix(".staging-")
                .tempdir_in(&versions)
                .map_err(InstallError::io(&versions))?;

            let files = extract(payload, staging.path())?;
            fs::rename(staging.path(), &version_dir).map_err(InstallError::io(&version_dir))?;
            debug!(version = %hash.short(), files = files, "Extracted bundle");
        }

        let previous = fs::read_link(&self.dest)
            .ok()
            .and_then(|t| t.file_name().and_then(|n| n.to_str()).map(str::to_string));

        let backup = self.move_aside_plain_destination()?;

        let target = Path::new(&Self::versions_dir_name(&name)).join(&hex);
        if let Err(e) = activate(parent, &name, &target, &self.dest) {
            if let Some(backup) = backup {
                self.restore_backup(&backup);
            }
            return Err(e);
        }

        info!(
            dest = %self.dest.display(),
            version = %hash.short(),
            "Activated certificate version"
        );

        let mut keep: HashSet<String> = HashSet::from([hex]);
        keep.extend(previous);
        prune(&versions, &keep);

        Ok(version_dir)
    }

    fn backup_path(&self) -> PathBuf {
        let mut backup = self.dest.clone().into_os_string();
        backup.push(".bak");
        PathBuf::from(backup)
    }

    /// A real directory at the destination (a pre-symlink install) is moved
    /// to `<dest>.bak` so the symlink can take its place. Returns the backup
    /// path when a move happened.
    fn move_aside_plain_destination(&self) -> Result<Option<PathBuf>, InstallError> {
        let metadata = match fs::symlink_metadata(&self.dest) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(InstallError::io(&self.dest)(e)),
        };

        if metadata.file_type().is_symlink() {
            return Ok(None);
        }
        if !metadata.is_dir() {
            return Err(InstallError::DestinationConflict(self.dest.clone()));
        }

        let backup = self.backup_path();
        if backup.exists() {
            fs::remove_dir_all(&backup).map_err(InstallError::io(&backup))?;
        }
        fs::rename(&self.dest, &backup).map_err(InstallError::io(&backup))?;

        warn!(
            dest = %self.dest.display(),
            backup = %backup.display(),
            "Moved existing destination directory aside"
        );
        Ok(Some(backup))
    }

    /// Put a moved-aside directory back at the destination after a failed
    /// activation.
    fn restore_backup(&self, backup: &Path) {
        match fs::rename(backup, &self.dest) {
            Ok(()) => warn!(
                dest = %self.dest.display(),
                "Activation failed, restored previous destination directory"
            ),
            Err(e) => warn!(
                dest = %self.dest.display(),
                backup = %backup.display(),
                error = %e,
                "Activation failed and the previous directory could not be restored"
            ),
        }
    }

    /// A process that died between moving a plain directory aside and
    /// activating the symlink leaves no destination but a `<dest>.bak`.
    /// Restore it so the destination is never left absent.
    fn recover_interrupted_move(&self) {
        match fs::symlink_metadata(&self.dest) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            _ => return,
        }

        let backup = self.backup_path();
        let is_dir = fs::symlink_metadata(&backup)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return;
        }

        match fs::rename(&backup, &self.dest) {
            Ok(()) => warn!(
                dest = %self.dest.display(),
                backup = %backup.display(),
                "Destination missing, restored directory from backup"
            ),
            Err(e) => warn!(
                dest = %self.dest.display(),
                error = %e,
                "Destination missing and backup could not be restored"
            ),
        }
    }
}

/// Extract an archive into `dir`, rejecting entries that would land outside
/// it. Returns the number of files written.
fn extract(payload: &[u8], dir: &Path) -> Result<usize, InstallError> {
    let mut archive =
        ZipArchive::new(Cursor::new(payload)).map_err(|e| InstallError::Archive(e.to_string()))?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| InstallError::Archive(e.to_string()))?;

        let relative = entry
            .enclosed_name()
            .filter(|p| p.components().all(|c| matches!(c, Component::Normal(_))))
            .ok_or_else(|| InstallError::UnsafePath(entry.name().to_string()))?;
        let out = dir.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&out).map_err(InstallError::io(&out))?;
            continue;
        }

        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).map_err(InstallError::io(parent))?;
        }

        let mut file = fs::File::create(&out).map_err(InstallError::io(&out))?;
        io::copy(&mut entry, &mut file).map_err(InstallError::io(&out))?;
        file.sync_all().map_err(InstallError::io(&out))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = entry.unix_mode().map(|m| m & 0o777).unwrap_or(0o600);
            fs::set_permissions(&out, fs::Permissions::from_mode(mode))
                .map_err(InstallError::io(&out))?;
        }

        trace!(path = %relative.display(), "Extracted file");
        files += 1;
    }

    if files == 0 {
        return Err(InstallError::EmptyArchive);
    }
    Ok(files)
}

#[cfg(unix)]
fn activate(parent: &Path, name: &str, target: &Path, dest: &Path) -> Result<(), InstallError> {
    let link = parent.join(format!(".{}.link-{}", name, std::process::id()));
    match fs::remove_file(&link) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(InstallError::io(&link)(e)),
    }

    std::os::unix::fs::symlink(target, &link).map_err(InstallError::io(&link))?;
    if let Err(e) = fs::rename(&link, dest) {
        let _ = fs::remove_file(&link);
        return Err(InstallError::io(dest)(e));
    }
    Ok(())
}

/// Directory symlinks cannot be renamed over each other here, so the old
/// link is removed first; the destination is briefly absent.
#[cfg(windows)]
fn activate(parent: &Path, _name: &str, target: &Path, dest: &Path) -> Result<(), InstallError> {
    match fs::remove_dir(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(InstallError::io(dest)(e)),
    }
    std::os::windows::fs::symlink_dir(parent.join(target), dest).map_err(InstallError::io(dest))
}

#[cfg(not(any(unix, windows)))]
fn activate(_parent: &Path, _name: &str, _target: &Path, _dest: &Path) -> Result<(), InstallError> {
    Err(InstallError::Unsupported)
}

/// Remove versions not in `keep`, plus leftover staging directories.
fn prune(versions: &Path, keep: &HashSet<String>) {
    let entries = match fs::read_dir(versions) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %versions.display(), error = %e, "Failed to list versions");
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if keep.contains(&name) {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "Pruned old version"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune old version"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in files {
            writer
                .start_file(*name, SimpleFileOptions::default().unix_permissions(0o640))
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn install(installer: &Installer, payload: &[u8]) -> ContentHash {
        let hash = ContentHash::of(payload);
        installer.install(&hash, payload).unwrap();
        hash
    }

    #[test]
    fn test_fresh_install() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        let installer = Installer::new(&dest);
        assert_eq!(installer.current_version(), None);

        let payload = archive(&[("fullchain.pem", "chain"), ("privkey.pem", "key")]);
        let hash = install(&installer, &payload);

        assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "chain");
        assert_eq!(installer.current_version(), Some(hash));

        let link = fs::read_link(&dest).unwrap();
        assert!(link.is_relative());

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dest.join("privkey.pem")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_upgrade_keeps_previous_and_prunes_older() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        let installer = Installer::new(&dest);

        let h1 = install(&installer, &archive(&[("fullchain.pem", "v1")]));
        let h2 = install(&installer, &archive(&[("fullchain.pem", "v2")]));
        let h3 = install(&installer, &archive(&[("fullchain.pem", "v3")]));

        assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "v3");
        let versions = installer.versions_dir().unwrap();
        assert!(versions.join(h3.to_hex()).is_dir());
        assert!(versions.join(h2.to_hex()).is_dir());
        assert!(!versions.join(h1.to_hex()).exists());
    }

    #[test]
    fn test_plain_directory_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("fullchain.pem"), "manual").unwrap();

        let installer = Installer::new(&dest);
        install(&installer, &archive(&[("fullchain.pem", "managed")]));

        assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "managed");
        let backup = dir.path().join("example.com.bak");
        assert_eq!(fs::read_to_string(backup.join("fullchain.pem")).unwrap(), "manual");
    }

    #[test]
    fn test_failed_activation_restores_plain_directory() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("fullchain.pem"), "manual").unwrap();

        // A non-empty directory where the temporary link goes makes
        // activation fail after the destination was moved aside
        let blocker = dir
            .path()
            .join(format!(".example.com.link-{}", std::process::id()));
        fs::create_dir_all(blocker.join("occupied")).unwrap();

        let installer = Installer::new(&dest);
        let payload = archive(&[("fullchain.pem", "managed")]);
        assert!(installer
            .install(&ContentHash::of(&payload), &payload)
            .is_err());

        let metadata = fs::symlink_metadata(&dest).unwrap();
        assert!(metadata.is_dir() && !metadata.file_type().is_symlink());
        assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "manual");
        assert!(!dir.path().join("example.com.bak").exists());

        fs::remove_dir_all(&blocker).unwrap();
        install(&installer, &payload);
        assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "managed");
    }

    #[test]
    fn test_interrupted_move_aside_is_recovered() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        let backup = dir.path().join("example.com.bak");
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("fullchain.pem"), "manual").unwrap();

        let installer = Installer::new(&dest);
        install(&installer, &archive(&[("fullchain.pem", "managed")]));

        assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "managed");
        assert_eq!(fs::read_to_string(backup.join("fullchain.pem")).unwrap(), "manual");
    }

    #[test]
    fn test_regular_file_destination_conflicts() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        fs::write(&dest, "not a directory").unwrap();

        let payload = archive(&[("fullchain.pem", "x")]);
        let err = Installer::new(&dest)
            .install(&ContentHash::of(&payload), &payload)
            .unwrap_err();
        assert!(matches!(err, InstallError::DestinationConflict(_)));
        assert_eq!(fs::read_to_string(&dest).unwrap(), "not a directory");
    }

    #[test]
    fn test_unsafe_and_empty_archives_rejected() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        let installer = Installer::new(&dest);

        let evil = archive(&[("../escape.pem", "x")]);
        let err = installer.install(&ContentHash::of(&evil), &evil).unwrap_err();
        assert!(matches!(err, InstallError::UnsafePath(_)));
        assert!(!dir.path().join("escape.pem").exists());

        let empty = archive(&[]);
        let err = installer.install(&ContentHash::of(&empty), &empty).unwrap_err();
        assert!(matches!(err, InstallError::EmptyArchive));

        let garbage = b"not a zip".to_vec();
        let err = installer
            .install(&ContentHash::of(&garbage), &garbage)
            .unwrap_err();
        assert!(matches!(err, InstallError::Archive(_)));

        assert!(fs::symlink_metadata(&dest).is_err());
    }

    #[test]
    fn test_failed_install_leaves_current_version() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        let installer = Installer::new(&dest);

        let good = install(&installer, &archive(&[("fullchain.pem", "good")]));
        let evil = archive(&[("/etc/passwd", "x")]);
        assert!(installer.install(&ContentHash::of(&evil), &evil).is_err());

        assert_eq!(installer.current_version(), Some(good));
        assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "good");
    }

    #[test]
    fn test_interrupted_extraction_is_invisible() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        let installer = Installer::new(&dest);
        let good = install(&installer, &archive(&[("fullchain.pem", "good")]));

        // A crash mid-extraction leaves a staging directory behind
        let versions = installer.versions_dir().unwrap();
        let stale = versions.join(".staging-crashed");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("fullchain.pem"), "partial").unwrap();

        assert_eq!(installer.current_version(), Some(good));
        assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "good");

        // The next install cleans it up
        install(&installer, &archive(&[("fullchain.pem", "next")]));
        assert!(!stale.exists());
    }

    #[test]
    fn test_dangling_link_is_not_current() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        let installer = Installer::new(&dest);
        let hash = install(&installer, &archive(&[("fullchain.pem", "x")]));

        fs::remove_dir_all(installer.versions_dir().unwrap().join(hash.to_hex())).unwrap();
        assert_eq!(installer.current_version(), None);
    }

    #[test]
    fn test_readers_never_see_partial_versions() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("example.com");
        let installer = Installer::new(&dest);
        install(&installer, &archive(&[("fullchain.pem", "v0"), ("privkey.pem", "v0")]));

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let dest = dest.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    // Read both files through one resolved version directory
                    let Ok(version) = fs::canonicalize(&dest) else {
                        panic!("destination vanished");
                    };
                    let Ok(chain) = fs::read_to_string(version.join("fullchain.pem")) else {
                        // Pruned between resolve and read; resolve again
                        continue;
                    };
                    let Ok(key) = fs::read_to_string(version.join("privkey.pem")) else {
                        continue;
                    };
                    assert_eq!(chain, key, "mixed versions");
                }
            })
        };

        for i in 1..40 {
            let v = format!("v{}", i);
            install(&installer, &archive(&[("fullchain.pem", &v), ("privkey.pem", &v)]));
        }
        done.store(true, Ordering::SeqCst);
        reader.join().unwrap();
    }
}
