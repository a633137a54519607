//! Consumer node configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use certferry_common::protocol::is_valid_cert_name;

use crate::validate::{ErrorCategory, ValidationError, ValidationResult};

/// `sync { ... }` block.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the authority, e.g. `https://certs.example.com`
    pub server_url: String,
    /// Shared secret
    pub token: String,
    /// Certificate name to fetch
    pub cert_name: String,
    /// Where the certificate set is installed (managed as a symlink)
    pub dest_path: PathBuf,
    /// Directory for the install state record and the lock file
    pub state_dir: PathBuf,
    /// Shell command run after a successful install
    pub post_update: Option<String>,
    pub post_update_timeout_secs: u64,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Attempts for transport errors and 5xx responses
    pub retries: u32,
    /// Base of the exponential backoff between attempts
    pub backoff_secs: u64,
    /// Verify the authority's TLS certificate
    pub verify_tls: bool,
    /// Run cycles in a loop with this period instead of once
    pub interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            token: String::new(),
            cert_name: String::new(),
            dest_path: PathBuf::new(),
            state_dir: default_state_dir(),
            post_update: None,
            post_update_timeout_secs: default_post_update_timeout_secs(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            backoff_secs: default_backoff_secs(),
            verify_tls: true,
            interval_secs: None,
        }
    }
}

pub(crate) fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/certferry-sync")
}

pub(crate) fn default_post_update_timeout_secs() -> u64 {
    60
}

pub(crate) fn default_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_retries() -> u32 {
    3
}

pub(crate) fn default_backoff_secs() -> u64 {
    2
}

impl SyncConfig {
    /// Load from a KDL file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let doc = crate::read_document(path.as_ref())?;
        crate::kdl::parse_sync_document(&doc)
    }

    /// Parse from KDL text.
    pub fn from_kdl_str(content: &str) -> Result<Self> {
        let doc = crate::parse_document(content)?;
        crate::kdl::parse_sync_document(&doc)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    ///
    /// | key | field |
    /// |-----|-------|
    /// | `CERTFERRY_SYNC_SERVER_URL` | `server_url` |
    /// | `CERTFERRY_SYNC_TOKEN` | `token` |
    /// | `CERTFERRY_SYNC_CERT_NAME` | `cert_name` |
    /// | `CERTFERRY_SYNC_DEST_PATH` | `dest_path` |
    /// | `CERTFERRY_SYNC_POST_UPDATE` | `post_update` |
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CERTFERRY_SYNC_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(token) = lookup("CERTFERRY_SYNC_TOKEN") {
            self.token = token;
        }
        if let Some(name) = lookup("CERTFERRY_SYNC_CERT_NAME") {
            self.cert_name = name;
        }
        if let Some(dest) = lookup("CERTFERRY_SYNC_DEST_PATH") {
            self.dest_path = PathBuf::from(dest);
        }
        if let Some(cmd) = lookup("CERTFERRY_SYNC_POST_UPDATE") {
            self.post_update = Some(cmd).filter(|c| !c.trim().is_empty());
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn post_update_timeout(&self) -> Duration {
        Duration::from_secs(self.post_update_timeout_secs)
    }

    /// Validate settings needed to run a sync cycle.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        let url = self.server_url.trim();
        if url.is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Sync,
                "No server-url configured",
            ));
        } else if !(url.starts_with("https://") || url.starts_with("http://")) {
            result.add_error(ValidationError::new(
                ErrorCategory::Sync,
                format!("server-url '{}' must start with http:// or https://", url),
            ));
        }

        if self.token.trim().is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Auth,
                "No token configured: set token or CERTFERRY_SYNC_TOKEN",
            ));
        }

        if self.cert_name.is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Sync,
                "No cert-name configured",
            ));
        } else if !is_valid_cert_name(&self.cert_name) {
            result.add_error(ValidationError::new(
                ErrorCategory::Sync,
                format!("Invalid cert-name '{}'", self.cert_name),
            ));
        }

        if self.timeout_secs == 0 {
            result.add_error(ValidationError::new(
                ErrorCategory::Sync,
                "timeout-secs must be greater than zero",
            ));
        }
        if self.retries == 0 {
            result.add_error(ValidationError::new(
                ErrorCategory::Sync,
                "retries must be at least 1",
            ));
        }
        if self.interval_secs == Some(0) {
            result.add_error(ValidationError::new(
                ErrorCategory::Sync,
                "interval-secs must be greater than zero",
            ));
        }

        result.merge(crate::validate::paths::validate_dest_path(&self.dest_path));
        result.merge(crate::validate::lint::lint_sync(self));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> SyncConfig {
        SyncConfig {
            server_url: "https://certs.example.com".to_string(),
            token: "secret-token".to_string(),
            cert_name: "example.com".to_string(),
            dest_path: std::env::temp_dir().join("certferry-validate-dest"),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let result = valid().validate();
        assert!(result.is_ok(), "unexpected errors: {:?}", result.errors);
    }

    #[test]
    fn test_missing_fields() {
        let result = SyncConfig::default().validate();
        assert!(!result.is_ok());
        // url, token, cert name and dest path are all reported
        assert!(result.errors.len() >= 4);
    }

    #[test]
    fn test_bad_cert_name_and_url() {
        let mut config = valid();
        config.cert_name = "../etc".to_string();
        config.server_url = "ftp://certs".to_string();
        let result = config.validate();
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_overlong_cert_name() {
        let mut config = valid();
        config.cert_name = "a".repeat(256);
        let result = config.validate();
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("Invalid cert-name"));

        config.cert_name = "a".repeat(255);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("CERTFERRY_SYNC_TOKEN", "env-token"),
            ("CERTFERRY_SYNC_POST_UPDATE", "   "),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        config.post_update = Some("systemctl reload nginx".to_string());
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.token, "env-token");
        assert_eq!(config.post_update, None);
        assert_eq!(config.server_url, "https://certs.example.com");
    }
}
