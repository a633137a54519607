//! Sync cycle
//!
//! ```text
//! Idle ─► Probing ─► Downloading ─► Installing ─► PostUpdate ─► Idle
//!            └──── 304 ────────────────────────────────────────►┘
//! ```
//!
//! A cycle holds `<state-dir>/<cert>.lock` for its whole duration; an
//! overlapping invocation finds it held and returns [`CycleOutcome::Skipped`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use certferry_common::{ContentHash, ExclusiveLock, LockError};
use certferry_config::SyncConfig;

use crate::errors::SyncError;
use crate::fetch::{BundleFetcher, FetchResult};
use crate::hook::{run_post_update, PostUpdateStatus};
use crate::install::Installer;
use crate::state::{ClientInstallState, StateStore};

/// Result of a completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle for this certificate holds the lock
    Skipped,
    /// The installed bundle is current
    UpToDate { hash: ContentHash },
    /// A new bundle was installed; `post_update` says how the hook went
    Installed {
        hash: ContentHash,
        post_update: PostUpdateStatus,
    },
}

/// Consumer-side synchronization of one certificate.
pub struct SyncClient {
    config: SyncConfig,
    fetcher: BundleFetcher,
    installer: Arc<Installer>,
    state: StateStore,
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let fetcher = BundleFetcher::new(&config)?;
        let installer = Arc::new(Installer::new(config.dest_path.clone()));
        let state = StateStore::new(config.state_dir.clone());
        Ok(Self {
            config,
            fetcher,
            installer,
            state,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one cycle.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, SyncError> {
        let cert_name = self.config.cert_name.as_str();

        let _lock = match ExclusiveLock::try_acquire(&self.state.lock_path(cert_name)) {
            Ok(lock) => lock,
            Err(LockError::Held(path)) => {
                info!(
                    cert_name = %cert_name,
                    lock = %path.display(),
                    "Another sync is running, skipping"
                );
                return Ok(CycleOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let known = self.known_hash()?;

        match self.fetcher.fetch(cert_name, known.as_ref()).await? {
            FetchResult::NotModified(hash) => {
                info!(cert_name = %cert_name, hash = %hash.short(), "Certificate is up to date");
                Ok(CycleOutcome::UpToDate { hash })
            }
            FetchResult::Downloaded { hash, payload } => {
                let installer = Arc::clone(&self.installer);
                tokio::task::spawn_blocking(move || installer.install(&hash, &payload))
                    .await
                    .map_err(|e| SyncError::Task(e.to_string()))??;

                self.state.save(&ClientInstallState {
                    cert_name: cert_name.to_string(),
                    last_installed_hash: hash,
                    dest_path: self.config.dest_path.clone(),
                    installed_at: Utc::now(),
                })?;

                info!(
                    cert_name = %cert_name,
                    hash = %hash,
                    dest = %self.config.dest_path.display(),
                    "Installed new certificate bundle"
                );

                let post_update = match &self.config.post_update {
                    Some(command) => {
                        run_post_update(
                            command,
                            self.config.post_update_timeout(),
                            cert_name,
                            &self.config.dest_path,
                            &hash,
                        )
                        .await
                    }
                    None => PostUpdateStatus::NotConfigured,
                };

                Ok(CycleOutcome::Installed { hash, post_update })
            }
        }
    }

    /// Hash to send as the conditional hash: the recorded one, but only
    /// while the destination still resolves to that version.
    fn known_hash(&self) -> Result<Option<ContentHash>, SyncError> {
        let recorded = self.state.load(&self.config.cert_name)?;
        let installed = self.installer.current_version();

        match (recorded, installed) {
            (Some(state), Some(current)) if state.last_installed_hash == current => {
                Ok(Some(current))
            }
            (Some(state), installed) => {
                warn!(
                    cert_name = %self.config.cert_name,
                    recorded = %state.last_installed_hash.short(),
                    installed = ?installed.map(|h| h.short()),
                    "Destination does not match recorded state, downloading again"
                );
                Ok(None)
            }
            (None, _) => {
                debug!(cert_name = %self.config.cert_name, "No install state, first sync");
                Ok(None)
            }
        }
    }

    /// Run cycles every `interval` until `shutdown` resolves. Failed cycles
    /// are logged and retried at the next tick.
    pub async fn run_periodic<F>(&self, interval: Duration, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            cert_name = %self.config.cert_name,
            interval_secs = interval.as_secs(),
            "Starting periodic sync"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping periodic sync");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(cert_name = %self.config.cert_name, error = %e, "Sync cycle failed");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("server_url", &self.config.server_url)
            .field("cert_name", &self.config.cert_name)
            .field("dest_path", &self.config.dest_path)
            .finish_non_exhaustive()
    }
}
