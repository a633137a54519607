//! certferry sync - main entry point
//!
//! Fetches the current bundle from the authority and installs it, once or
//! on a fixed interval.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use certferry_common::observability::init_tracing;
use certferry_config::SyncConfig;
use certferry_sync::{CycleOutcome, PostUpdateStatus, SyncClient};

/// certferry sync - installs certificate bundles from a certferry authority
#[derive(Parser, Debug)]
#[command(name = "certferry-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTFERRY_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,

    /// Authority base URL
    #[arg(long = "server-url")]
    server_url: Option<String>,

    /// Shared token
    #[arg(long = "token")]
    token: Option<String>,

    /// Certificate name to fetch
    #[arg(long = "cert-name")]
    cert_name: Option<String>,

    /// Install destination
    #[arg(long = "dest-path")]
    dest_path: Option<PathBuf>,

    /// Command run after a new bundle is installed
    #[arg(long = "post-update")]
    post_update: Option<String>,

    /// Keep running, syncing every N seconds
    #[arg(long = "interval-secs")]
    interval_secs: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = load_config(&cli)?;

    let warnings = config
        .validate()
        .into_result()
        .context("Configuration validation failed")?;
    for warning in &warnings {
        warn!("{}", warning);
    }

    if cli.test {
        println!(
            "certferry-sync: configuration {} test is successful",
            cli.config
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(defaults)".to_string())
        );
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        let interval = config.interval_secs;
        let client = SyncClient::new(config).context("Failed to create sync client")?;

        match interval {
            Some(secs) => {
                client
                    .run_periodic(Duration::from_secs(secs), shutdown_signal())
                    .await;
            }
            None => {
                let outcome = client.run_cycle().await.context("Sync failed")?;
                report(&outcome);
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

/// File (or defaults), then environment, then command line.
fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => load_file(path)?,
        None => SyncConfig::default(),
    };
    config.apply_env();

    if let Some(url) = &cli.server_url {
        config.server_url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.token = token.clone();
    }
    if let Some(name) = &cli.cert_name {
        config.cert_name = name.clone();
    }
    if let Some(dest) = &cli.dest_path {
        config.dest_path = dest.clone();
    }
    if let Some(cmd) = &cli.post_update {
        config.post_update = Some(cmd.clone()).filter(|c| !c.trim().is_empty());
    }
    if cli.interval_secs.is_some() {
        config.interval_secs = cli.interval_secs;
    }

    Ok(config)
}

fn load_file(path: &Path) -> Result<SyncConfig> {
    info!(path = %path.display(), "Loading configuration");
    SyncConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn report(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Skipped => info!("Another sync holds the lock, nothing done"),
        CycleOutcome::UpToDate { hash } => info!(hash = %hash.short(), "Already up to date"),
        CycleOutcome::Installed { hash, post_update } => match post_update {
            PostUpdateStatus::Failed(reason) => error!(
                hash = %hash.short(),
                reason = %reason,
                "Installed new bundle, but the post-update command failed"
            ),
            _ => info!(hash = %hash.short(), "Installed new bundle"),
        },
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal, stopping");
}
