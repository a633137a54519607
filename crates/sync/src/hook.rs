//! Post-update command.
//!
//! Runs after a new version is active, typically to reload the services
//! using the certificate. Its failure is reported but never undoes the
//! install.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use certferry_common::ContentHash;

/// Environment passed to the command.
pub const ENV_CERT_NAME: &str = "CERTFERRY_CERT_NAME";
pub const ENV_DEST_PATH: &str = "CERTFERRY_DEST_PATH";
pub const ENV_BUNDLE_HASH: &str = "CERTFERRY_BUNDLE_HASH";

/// Longest stderr excerpt kept in a failure message.
const STDERR_EXCERPT: usize = 512;

/// How the post-update step went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostUpdateStatus {
    NotConfigured,
    Succeeded,
    Failed(String),
}

/// Run `command` through `sh -c`, killing it after `timeout`.
pub async fn run_post_update(
    command: &str,
    timeout: Duration,
    cert_name: &str,
    dest: &Path,
    hash: &ContentHash,
) -> PostUpdateStatus {
    let mut child = Command::new("sh");
    child
        .arg("-c")
        .arg(command)
        .env(ENV_CERT_NAME, cert_name)
        .env(ENV_DEST_PATH, dest)
        .env(ENV_BUNDLE_HASH, hash.to_hex())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let status = match tokio::time::timeout(timeout, child.output()).await {
        Err(_) => PostUpdateStatus::Failed(format!("timed out after {}s", timeout.as_secs())),
        Ok(Err(e)) => PostUpdateStatus::Failed(format!("failed to start: {}", e)),
        Ok(Ok(output)) if output.status.success() => PostUpdateStatus::Succeeded,
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let excerpt: String = stderr.chars().take(STDERR_EXCERPT).collect();
            PostUpdateStatus::Failed(format!("{}: {}", output.status, excerpt))
        }
    };

    match &status {
        PostUpdateStatus::Succeeded => {
            info!(cert_name = %cert_name, command = %command, "Post-update command succeeded")
        }
        PostUpdateStatus::Failed(reason) => warn!(
            cert_name = %cert_name,
            command = %command,
            reason = %reason,
            "Post-update command failed; the new certificate stays installed"
        ),
        PostUpdateStatus::NotConfigured => {}
    }

    status
}
