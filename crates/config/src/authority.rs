//! Authority node configuration (distribution server and packager).

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Tokens that ship in examples and documentation. A deployment still using
/// one of them is treated as having no token at all.
pub const DEFAULT_PLACEHOLDER_TOKENS: &[&str] = &[
    "changeme",
    "change-me",
    "default",
    "secret",
    "token",
    "your-token-here",
];

/// Root configuration of the authority node.
#[derive(Debug, Clone, Default)]
pub struct AuthorityConfig {
    pub server: ServerSection,
    pub auth: AuthConfig,
    pub whitelist: WhitelistConfig,
    pub publish: PublishConfig,
}

/// `server { ... }` block.
#[derive(Debug, Clone)]
pub struct ServerSection {
    /// Listen address, e.g. `0.0.0.0:8000`
    pub listen: String,
    /// Directory holding published bundles
    pub bundle_dir: PathBuf,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are trusted
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bundle_dir: default_bundle_dir(),
            trusted_proxies: Vec::new(),
        }
    }
}

pub(crate) fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

pub(crate) fn default_bundle_dir() -> PathBuf {
    PathBuf::from("/var/lib/certferry/bundles")
}

/// `auth { ... }` block.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Shared secret presented by sync clients
    pub token: String,
    /// Failed token attempts before an address is locked out (0 disables)
    pub max_failed_attempts: u32,
    /// Lockout duration in seconds
    pub lockout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            max_failed_attempts: default_max_failed_attempts(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

pub(crate) fn default_max_failed_attempts() -> u32 {
    5
}

pub(crate) fn default_lockout_secs() -> u64 {
    900
}

/// `whitelist { ... }` block.
#[derive(Debug, Clone)]
pub struct WhitelistConfig {
    /// Domain names or literal IP addresses
    pub domains: Vec<String>,
    /// How long a successful resolution is trusted
    pub cache_ttl_secs: u64,
    /// Minimum age of an entry before an unknown address forces re-resolution
    pub miss_refresh_secs: u64,
    /// Keep IPv6 results of DNS resolution
    pub enable_ipv6: bool,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            cache_ttl_secs: default_cache_ttl_secs(),
            miss_refresh_secs: default_miss_refresh_secs(),
            enable_ipv6: false,
        }
    }
}

pub(crate) fn default_cache_ttl_secs() -> u64 {
    300
}

pub(crate) fn default_miss_refresh_secs() -> u64 {
    10
}

/// `publish { ... }` block.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Certificate issuer's live directory (one subdirectory per certificate)
    pub live_dir: PathBuf,
    /// Default certificate name to package
    pub cert_name: Option<String>,
    /// Files that must be present in the source directory
    pub required_files: Vec<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            live_dir: default_live_dir(),
            cert_name: None,
            required_files: default_required_files(),
        }
    }
}

pub(crate) fn default_live_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

pub(crate) fn default_required_files() -> Vec<String> {
    vec!["fullchain.pem".to_string(), "privkey.pem".to_string()]
}

impl AuthorityConfig {
    /// Load from a KDL file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let doc = crate::read_document(path.as_ref())?;
        crate::kdl::parse_authority_document(&doc)
    }

    /// Parse from KDL text.
    pub fn from_kdl_str(content: &str) -> Result<Self> {
        let doc = crate::parse_document(content)?;
        crate::kdl::parse_authority_document(&doc)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    ///
    /// | key | field |
    /// |-----|-------|
    /// | `CERTFERRY_TOKEN` | `auth.token` |
    /// | `CERTFERRY_LISTEN` | `server.listen` |
    /// | `CERTFERRY_BUNDLE_DIR` | `server.bundle_dir` |
    /// | `CERTFERRY_WHITELIST` | `whitelist.domains` (comma separated) |
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("CERTFERRY_TOKEN") {
            self.auth.token = token;
        }
        if let Some(listen) = lookup("CERTFERRY_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(dir) = lookup("CERTFERRY_BUNDLE_DIR") {
            self.server.bundle_dir = PathBuf::from(dir);
        }
        if let Some(domains) = lookup("CERTFERRY_WHITELIST") {
            self.whitelist.domains = crate::split_list(&domains);
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Validate the settings needed to run the distribution server.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            result.add_error(ValidationError::new(
                ErrorCategory::Network,
                format!("Invalid listen address '{}'", self.server.listen),
            ));
        }

        let token = self.auth.token.trim();
        if token.is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Auth,
                "No token configured: set auth.token or CERTFERRY_TOKEN",
            ));
        } else if DEFAULT_PLACEHOLDER_TOKENS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(token))
        {
            result.add_error(ValidationError::new(
                ErrorCategory::Auth,
                "The configured token is a placeholder value; choose a random secret",
            ));
        } else if token.len() < 16 {
            result.add_warning(ValidationWarning::new(format!(
                "Token is only {} characters long (32+ recommended)",
                token.len()
            )));
        }

        if self.whitelist.domains.is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Whitelist,
                "Whitelist is empty: every fetch would be rejected",
            ));
        }
        for domain in &self.whitelist.domains {
            if domain.trim().is_empty() || domain.contains(char::is_whitespace) {
                result.add_error(ValidationError::new(
                    ErrorCategory::Whitelist,
                    format!("Invalid whitelist entry '{}'", domain),
                ));
            }
        }
        if self.whitelist.cache_ttl_secs == 0 {
            result.add_warning(ValidationWarning::new(
                "whitelist.cache-ttl-secs is 0: every request re-resolves all domains",
            ));
        }

        result.merge(crate::validate::paths::validate_bundle_dir(&self.server.bundle_dir));
        result.merge(crate::validate::lint::lint_authority(self));
        result
    }
}
