//! Configuration for certferry.
//!
//! Two KDL documents are understood:
//!
//! - the **authority** configuration (distribution server + packager)
//! - the **sync** configuration (consumer node)
//!
//! # Example
//!
//! ```kdl
//! server {
//!     listen "0.0.0.0:8000"
//!     bundle-dir "/var/lib/certferry/bundles"
//!     trusted-proxies "127.0.0.1"
//! }
//! auth {
//!     token "s3cr3t-value"
//! }
//! whitelist {
//!     domain "edge-1.example.com"
//!     domain "edge-2.example.com"
//!     cache-ttl-secs 300
//! }
//! publish {
//!     live-dir "/etc/letsencrypt/live"
//!     cert-name "example.com"
//! }
//! ```
//!
//! ```kdl
//! sync {
//!     server-url "https://certs.example.com"
//!     token "s3cr3t-value"
//!     cert-name "example.com"
//!     dest-path "/etc/ssl/certferry/example.com"
//!     post-update "systemctl reload nginx"
//! }
//! ```
//!
//! Values can be overridden from the environment, see
//! [`AuthorityConfig::apply_overrides`] and [`SyncConfig::apply_overrides`].

mod authority;
pub mod kdl;
mod sync;
pub mod validate;

pub use authority::{
    AuthConfig, AuthorityConfig, PublishConfig, ServerSection, WhitelistConfig,
    DEFAULT_PLACEHOLDER_TOKENS,
};
pub use sync::SyncConfig;
pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

use std::path::Path;

use anyhow::{Context, Result};

/// Read a KDL configuration file into a document.
pub(crate) fn read_document(path: &Path) -> Result<::kdl::KdlDocument> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
    parse_document(&content)
        .with_context(|| format!("Failed to parse configuration file {}", path.display()))
}

/// Parse KDL text into a document.
pub(crate) fn parse_document(content: &str) -> Result<::kdl::KdlDocument> {
    content
        .parse::<::kdl::KdlDocument>()
        .map_err(|e| anyhow::anyhow!("Invalid KDL: {}", e))
}

/// Split a comma separated environment value into trimmed, non-empty items.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
