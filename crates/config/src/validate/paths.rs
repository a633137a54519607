//! Filesystem path validation
//!
//! Checks that configured directories exist or can be created.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use std::path::Path;

/// Validate the authority's bundle directory
pub fn validate_bundle_dir(dir: &Path) -> ValidationResult {
    let mut result = ValidationResult::new();

    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Paths,
                format!("Bundle directory {:?} is not a directory", dir),
            ));
        }
        Err(_) => {
            result.add_warning(ValidationWarning::new(format!(
                "Bundle directory {:?} does not exist yet; it is created on first publish",
                dir
            )));
        }
    }

    result
}

/// Validate the sync client's destination path
///
/// The destination is replaced by a symlink on install, so it must have a
/// parent directory and must not be a regular file.
pub fn validate_dest_path(dest: &Path) -> ValidationResult {
    let mut result = ValidationResult::new();

    let has_name = dest.file_name().is_some();
    let parent = dest.parent().filter(|p| !p.as_os_str().is_empty());
    if !has_name || parent.is_none() {
        result.add_error(ValidationError::new(
            ErrorCategory::Paths,
            format!("Destination {:?} must be a path with a parent directory", dest),
        ));
        return result;
    }

    if let Ok(meta) = std::fs::symlink_metadata(dest) {
        if meta.is_file() {
            result.add_error(ValidationError::new(
                ErrorCategory::Paths,
                format!("Destination {:?} is a regular file", dest),
            ));
        } else if meta.is_dir() {
            result.add_warning(ValidationWarning::new(format!(
                "Destination {:?} is a plain directory; it is moved aside on first install",
                dest
            )));
        }
    }

    result
}
