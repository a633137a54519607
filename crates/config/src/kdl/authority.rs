//! Authority configuration KDL parsing.

use anyhow::Result;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::trace;

use ::kdl::{KdlDocument, KdlNode};

use crate::authority::*;

use super::helpers::{
    children_named, find_child, get_bool_entry, get_first_arg_string, get_int_entry,
    get_string_args, get_string_entry, get_u64_entry,
};

/// Parse a complete authority document
pub fn parse_authority_document(doc: &KdlDocument) -> Result<AuthorityConfig> {
    let mut config = AuthorityConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => config.server = parse_server_block(node)?,
            "auth" => config.auth = parse_auth_block(node)?,
            "whitelist" => config.whitelist = parse_whitelist_block(node)?,
            "publish" => config.publish = parse_publish_block(node)?,
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown top-level block '{}'. Valid blocks: server, auth, whitelist, publish",
                    other
                ));
            }
        }
    }

    Ok(config)
}

/// Parse `server { ... }`
fn parse_server_block(node: &KdlNode) -> Result<ServerSection> {
    trace!("Parsing server configuration block");

    let trusted_proxies = match find_child(node, "trusted-proxies") {
        Some(child) => get_string_args(child)
            .iter()
            .map(|s| {
                s.parse::<IpAddr>().map_err(|_| {
                    anyhow::anyhow!("Invalid trusted proxy address '{}': expected an IP", s)
                })
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    let section = ServerSection {
        listen: get_string_entry(node, "listen").unwrap_or_else(default_listen),
        bundle_dir: get_string_entry(node, "bundle-dir")
            .map(PathBuf::from)
            .unwrap_or_else(default_bundle_dir),
        trusted_proxies,
    };

    trace!(
        listen = %section.listen,
        bundle_dir = %section.bundle_dir.display(),
        trusted_proxies = section.trusted_proxies.len(),
        "Parsed server configuration"
    );

    Ok(section)
}

/// Parse `auth { ... }`
fn parse_auth_block(node: &KdlNode) -> Result<AuthConfig> {
    trace!("Parsing auth configuration block");

    let max_failed_attempts = match get_int_entry(node, "max-failed-attempts") {
        Some(v) => u32::try_from(v).map_err(|_| {
            anyhow::anyhow!("'max-failed-attempts' must be between 0 and {}", u32::MAX)
        })?,
        None => default_max_failed_attempts(),
    };

    Ok(AuthConfig {
        token: get_string_entry(node, "token").unwrap_or_default(),
        max_failed_attempts,
        lockout_secs: get_u64_entry(node, "lockout-secs")?.unwrap_or_else(default_lockout_secs),
    })
}

/// Parse `whitelist { ... }`
///
/// Domains may be given as repeated `domain "..."` children, as several
/// arguments to one `domains` child, or both.
fn parse_whitelist_block(node: &KdlNode) -> Result<WhitelistConfig> {
    trace!("Parsing whitelist configuration block");

    let mut domains: Vec<String> = children_named(node, "domain")
        .map(|child| {
            get_first_arg_string(child).ok_or_else(|| {
                anyhow::anyhow!("'domain' requires a string argument, e.g. domain \"edge.example.com\"")
            })
        })
        .collect::<Result<_>>()?;
    for child in children_named(node, "domains") {
        domains.extend(get_string_args(child));
    }

    let config = WhitelistConfig {
        domains,
        cache_ttl_secs: get_u64_entry(node, "cache-ttl-secs")?
            .unwrap_or_else(default_cache_ttl_secs),
        miss_refresh_secs: get_u64_entry(node, "miss-refresh-secs")?
            .unwrap_or_else(default_miss_refresh_secs),
        enable_ipv6: get_bool_entry(node, "enable-ipv6").unwrap_or(false),
    };

    trace!(
        domain_count = config.domains.len(),
        cache_ttl_secs = config.cache_ttl_secs,
        "Parsed whitelist configuration"
    );

    Ok(config)
}

/// Parse `publish { ... }`
fn parse_publish_block(node: &KdlNode) -> Result<PublishConfig> {
    trace!("Parsing publish configuration block");

    let required_files = match find_child(node, "required-files") {
        Some(child) => get_string_args(child),
        None => default_required_files(),
    };

    Ok(PublishConfig {
        live_dir: get_string_entry(node, "live-dir")
            .map(PathBuf::from)
            .unwrap_or_else(default_live_dir),
        cert_name: get_string_entry(node, "cert-name"),
        required_files,
    })
}
