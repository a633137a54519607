//! certferry authority - main entry point
//!
//! Runs the distribution server or publishes a certificate bundle.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use certferry_authority::packager::{resolve_source, RENEWED_LINEAGE_ENV};
use certferry_authority::{
    bind, serve, BundleStore, DistributionServer, Packager, SystemResolver, WhitelistRefresher,
    WhitelistResolver,
};
use certferry_common::observability::init_tracing;
use certferry_config::AuthorityConfig;

/// certferry authority - packages and distributes TLS certificate bundles
#[derive(Parser, Debug)]
#[command(name = "certferry-authority")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTFERRY_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long = "log-json", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the distribution server (default)
    Serve {
        /// Listen address, overrides the configuration
        #[arg(short = 'l', long = "listen")]
        listen: Option<String>,
    },
    /// Package a certificate directory and publish it as a bundle
    Publish {
        /// Source directory (default: $RENEWED_LINEAGE, then <live-dir>/<cert-name>)
        #[arg(short = 's', long = "source-dir")]
        source_dir: Option<PathBuf>,

        /// Bundle name (default: source directory name)
        #[arg(short = 'n', long = "cert-name")]
        cert_name: Option<String>,
    },
    /// Validate configuration file and exit
    Test,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = load_config(cli.config.as_deref())?;

    if cli.test {
        return test_config(&config, cli.config.as_deref());
    }

    match cli.command {
        Some(Commands::Test) => test_config(&config, cli.config.as_deref()),
        Some(Commands::Publish {
            source_dir,
            cert_name,
        }) => publish(&config, source_dir.as_deref(), cert_name.as_deref()),
        Some(Commands::Serve { listen }) => run_server(config, listen),
        None => run_server(config, None),
    }
}

fn load_config(path: Option<&Path>) -> Result<AuthorityConfig> {
    let mut config = match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            AuthorityConfig::from_file(path)?
        }
        None => {
            info!("No configuration file given, using defaults and environment");
            AuthorityConfig::default()
        }
    };
    config.apply_env();
    Ok(config)
}

/// Test configuration and exit
fn test_config(config: &AuthorityConfig, path: Option<&Path>) -> Result<()> {
    let warnings = config
        .validate()
        .into_result()
        .context("Configuration validation failed")?;

    for warning in &warnings {
        warn!("{}", warning);
    }

    info!("Configuration test successful:");
    info!("  - listen {}", config.server.listen);
    info!("  - bundle dir {}", config.server.bundle_dir.display());
    info!("  - {} whitelist entr(ies)", config.whitelist.domains.len());

    println!(
        "certferry-authority: configuration {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}

/// Publish one bundle
fn publish(
    config: &AuthorityConfig,
    source_dir: Option<&Path>,
    cert_name: Option<&str>,
) -> Result<()> {
    let lineage = std::env::var(RENEWED_LINEAGE_ENV).ok();
    let (source_dir, cert_name) = resolve_source(
        source_dir,
        cert_name,
        lineage.as_deref(),
        &config.publish.live_dir,
        config.publish.cert_name.as_deref(),
    )
    .context("No source directory: pass --source-dir, set RENEWED_LINEAGE or publish.cert-name")?;

    let store = Arc::new(BundleStore::new(config.server.bundle_dir.clone()));
    let packager = Packager::new(store, config.publish.required_files.clone());

    let bundle = packager
        .publish(&source_dir, &cert_name)
        .with_context(|| format!("Failed to publish '{}'", cert_name))?;

    println!("{} {}", bundle.name, bundle.content_hash);
    Ok(())
}

/// Run the distribution server
fn run_server(mut config: AuthorityConfig, listen: Option<String>) -> Result<()> {
    if let Some(listen) = listen {
        config.server.listen = listen;
    }

    let warnings = config
        .validate()
        .into_result()
        .context("Configuration validation failed")?;
    for warning in &warnings {
        warn!("{}", warning);
    }

    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address '{}'", config.server.listen))?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        let store = Arc::new(BundleStore::new(config.server.bundle_dir.clone()));
        let whitelist = Arc::new(WhitelistResolver::new(
            &config.whitelist,
            Arc::new(SystemResolver::new()),
        ));
        whitelist.refresh_all().await;
        let refresher = tokio::spawn(WhitelistRefresher::new(Arc::clone(&whitelist)).run());

        let server = Arc::new(DistributionServer::new(&config, store, whitelist)?);

        let listener = bind(addr).await?;

        info!(
            listen = %addr,
            bundle_dir = %config.server.bundle_dir.display(),
            version = env!("CARGO_PKG_VERSION"),
            "Starting certferry authority"
        );

        serve(server, listener, shutdown_signal()).await?;
        refresher.abort();
        Ok::<(), anyhow::Error>(())
    })
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

    info!("Received shutdown signal, initiating graceful shutdown");
}
