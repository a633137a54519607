//! Configuration lints
//!
//! Checks configuration for settings that work but are risky in production.

use super::{ValidationResult, ValidationWarning};
use crate::{AuthorityConfig, SyncConfig};

/// Lint the authority configuration
pub fn lint_authority(config: &AuthorityConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    // Listening publicly without a proxy in front means plain HTTP on the wire
    let loopback = config
        .server
        .listen
        .parse::<std::net::SocketAddr>()
        .map(|a| a.ip().is_loopback())
        .unwrap_or(false);
    if !loopback && config.server.trusted_proxies.is_empty() {
        result.add_warning(ValidationWarning::new(format!(
            "Listening on {} with no trusted proxies: tokens and keys travel unencrypted \
             unless TLS is terminated elsewhere",
            config.server.listen
        )));
    }

    if config.auth.max_failed_attempts == 0 {
        result.add_warning(ValidationWarning::new(
            "Failed-attempt lockout is disabled (auth.max-failed-attempts 0)",
        ));
    }

    if config.whitelist.enable_ipv6 && config.server.listen.starts_with("0.0.0.0") {
        result.add_warning(ValidationWarning::new(
            "IPv6 whitelist entries are enabled but the listener is IPv4 only",
        ));
    }

    result
}

/// Lint the sync configuration
pub fn lint_sync(config: &SyncConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.server_url.starts_with("http://") {
        result.add_warning(ValidationWarning::new(format!(
            "server-url '{}' uses plain HTTP: the token and private key are sent unencrypted",
            config.server_url
        )));
    }

    if !config.verify_tls {
        result.add_warning(ValidationWarning::new(
            "TLS verification is disabled (verify-tls #false)",
        ));
    }

    if config.post_update.is_none() {
        result.add_warning(ValidationWarning::new(
            "No post-update command: services keep the old certificate until restarted",
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lint_authority_public_listener() {
        let config = AuthorityConfig::default();
        let result = lint_authority(&config);
        assert!(result.is_ok());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("no trusted proxies")));
    }

    #[test]
    fn test_lint_authority_loopback_behind_proxy() {
        let mut config = AuthorityConfig::default();
        config.server.listen = "127.0.0.1:8000".to_string();
        assert!(lint_authority(&config).warnings.is_empty());
    }

    #[test]
    fn test_lint_sync() {
        let config = SyncConfig {
            server_url: "http://certs.internal".to_string(),
            verify_tls: false,
            ..Default::default()
        };
        let result = lint_sync(&config);
        assert_eq!(result.warnings.len(), 3);
    }
}
