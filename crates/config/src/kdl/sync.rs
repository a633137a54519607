//! Sync client configuration KDL parsing.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use ::kdl::KdlDocument;

use crate::sync::*;

use super::helpers::{find_node, get_bool_entry, get_int_entry, get_string_entry, get_u64_entry};

/// Parse a sync client document. A single `sync { ... }` block is required.
pub fn parse_sync_document(doc: &KdlDocument) -> Result<SyncConfig> {
    let node = find_node(doc, "sync").ok_or_else(|| {
        anyhow::anyhow!(
            "Missing 'sync' block. Example:\n\
             sync {{\n    \
                 server-url \"https://certs.example.com\"\n    \
                 cert-name \"example.com\"\n    \
                 dest-path \"/etc/ssl/example.com\"\n\
             }}"
        )
    })?;

    trace!("Parsing sync configuration block");

    let retries = match get_int_entry(node, "retries") {
        Some(v) => u32::try_from(v)
            .map_err(|_| anyhow::anyhow!("'retries' must be between 0 and {}", u32::MAX))?,
        None => default_retries(),
    };

    let config = SyncConfig {
        server_url: get_string_entry(node, "server-url").unwrap_or_default(),
        token: get_string_entry(node, "token").unwrap_or_default(),
        cert_name: get_string_entry(node, "cert-name").unwrap_or_default(),
        dest_path: get_string_entry(node, "dest-path")
            .map(PathBuf::from)
            .unwrap_or_default(),
        state_dir: get_string_entry(node, "state-dir")
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir),
        post_update: get_string_entry(node, "post-update").filter(|c| !c.trim().is_empty()),
        post_update_timeout_secs: get_u64_entry(node, "post-update-timeout-secs")?
            .unwrap_or_else(default_post_update_timeout_secs),
        timeout_secs: get_u64_entry(node, "timeout-secs")?.unwrap_or_else(default_timeout_secs),
        retries,
        backoff_secs: get_u64_entry(node, "backoff-secs")?.unwrap_or_else(default_backoff_secs),
        verify_tls: get_bool_entry(node, "verify-tls").unwrap_or(true),
        interval_secs: get_u64_entry(node, "interval-secs")?,
    };

    trace!(
        server_url = %config.server_url,
        cert_name = %config.cert_name,
        dest_path = %config.dest_path.display(),
        "Parsed sync configuration"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use crate::SyncConfig;
    use std::path::PathBuf;

    #[test]
    fn test_parse_sync_block() {
        let config = SyncConfig::from_kdl_str(
            r#"
            sync {
                server-url "https://certs.example.com"
                token "s3cr3t-value"
                cert-name "example.com"
                dest-path "/etc/ssl/example.com"
                state-dir "/tmp/certferry-state"
                post-update "systemctl reload nginx"
                timeout-secs 10
                retries 5
                verify-tls #false
                interval-secs 3600
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.server_url, "https://certs.example.com");
        assert_eq!(config.cert_name, "example.com");
        assert_eq!(config.dest_path, PathBuf::from("/etc/ssl/example.com"));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/certferry-state"));
        assert_eq!(config.post_update.as_deref(), Some("systemctl reload nginx"));
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.retries, 5);
        assert_eq!(config.backoff_secs, 2);
        assert!(!config.verify_tls);
        assert_eq!(config.interval_secs, Some(3600));
    }

    #[test]
    fn test_defaults_when_omitted() {
        let config = SyncConfig::from_kdl_str(r#"sync { cert-name "example.com" }"#).unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.retries, 3);
        assert!(config.verify_tls);
        assert_eq!(config.post_update, None);
        assert_eq!(config.interval_secs, None);
    }

    #[test]
    fn test_missing_sync_block() {
        let err = SyncConfig::from_kdl_str(r#"server { listen "0.0.0.0:8000" }"#).unwrap_err();
        assert!(err.to_string().contains("Missing 'sync' block"));
    }
}
