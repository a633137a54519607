//! Distribution server
//!
//! [`DistributionServer`] holds the admission logic independent of HTTP;
//! [`routes`] maps it onto an axum router.
//!
//! Admission order for a fetch:
//!
//! 1. Address locked out after repeated bad tokens → 401
//! 2. Token check → 401
//! 3. Whitelist check → 401 (indistinguishable from 2)
//! 4. Bundle lookup → 404
//! 5. Conditional hash equals current → 304
//! 6. Otherwise → 200 with the bundle

pub mod audit;
pub mod client_ip;
pub mod metrics;
pub mod routes;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use certferry_common::protocol::{
    HealthReport, HealthStatus, ServiceInfo, SERVICE_NAME,
};
use certferry_common::ContentHash;
use certferry_config::AuthorityConfig;

use crate::auth::{AttemptTracker, AuthGate};
use crate::errors::ServerError;
use crate::store::{BundleStore, CertificateBundle};
use crate::whitelist::WhitelistResolver;

pub use metrics::ServerMetrics;
pub use routes::router;

/// Period of the failed-attempt table sweep while serving.
const ATTEMPT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A bundle fetch as seen by the admission logic.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub cert_name: String,
    pub token: Option<String>,
    pub client_ip: IpAddr,
    /// Lowercase hex hashes the client already has
    pub known_hashes: Vec<String>,
    /// Ignore `known_hashes` and always send the payload
    pub force_download: bool,
    pub user_agent: Option<String>,
}

/// Why a fetch was refused. Only logged; the client sees one opaque 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    LockedOut,
    InvalidToken,
    NotWhitelisted,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::LockedOut => "locked_out",
            DenyReason::InvalidToken => "invalid_token",
            DenyReason::NotWhitelisted => "not_whitelisted",
        }
    }
}

/// Result of a fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Bundle(Arc<CertificateBundle>),
    NotModified(ContentHash),
    Unauthorized(DenyReason),
    NotFound,
    Error(String),
}

impl FetchOutcome {
    pub fn kind(&self) -> FetchOutcomeKind {
        match self {
            FetchOutcome::Bundle(_) => FetchOutcomeKind::Served,
            FetchOutcome::NotModified(_) => FetchOutcomeKind::NotModified,
            FetchOutcome::Unauthorized(_) => FetchOutcomeKind::Unauthorized,
            FetchOutcome::NotFound => FetchOutcomeKind::NotFound,
            FetchOutcome::Error(_) => FetchOutcomeKind::Error,
        }
    }
}

/// Outcome label used in metrics and audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcomeKind {
    Served,
    NotModified,
    Unauthorized,
    NotFound,
    Error,
}

impl FetchOutcomeKind {
    pub const ALL: [FetchOutcomeKind; 5] = [
        FetchOutcomeKind::Served,
        FetchOutcomeKind::NotModified,
        FetchOutcomeKind::Unauthorized,
        FetchOutcomeKind::NotFound,
        FetchOutcomeKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOutcomeKind::Served => "served",
            FetchOutcomeKind::NotModified => "not_modified",
            FetchOutcomeKind::Unauthorized => "unauthorized",
            FetchOutcomeKind::NotFound => "not_found",
            FetchOutcomeKind::Error => "error",
        }
    }
}

/// Serves published bundles to authorized clients.
pub struct DistributionServer {
    store: Arc<BundleStore>,
    auth: AuthGate,
    attempts: AttemptTracker,
    whitelist: Arc<WhitelistResolver>,
    trusted_proxies: Vec<IpAddr>,
    metrics: ServerMetrics,
}

impl DistributionServer {
    pub fn new(
        config: &AuthorityConfig,
        store: Arc<BundleStore>,
        whitelist: Arc<WhitelistResolver>,
    ) -> Result<Self, ServerError> {
        Ok(Self {
            store,
            auth: AuthGate::new(&config.auth.token),
            attempts: AttemptTracker::new(
                config.auth.max_failed_attempts,
                Duration::from_secs(config.auth.lockout_secs),
            ),
            whitelist,
            trusted_proxies: config.server.trusted_proxies.clone(),
            metrics: ServerMetrics::new()?,
        })
    }

    pub fn store(&self) -> &Arc<BundleStore> {
        &self.store
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn trusted_proxies(&self) -> &[IpAddr] {
        &self.trusted_proxies
    }

    /// Drop failed-attempt records that no longer matter. Returns the
    /// number removed.
    pub fn sweep_attempts(&self) -> usize {
        self.attempts.sweep()
    }

    /// `GET /`
    pub fn describe(&self, client_ip: IpAddr) -> ServiceInfo {
        ServiceInfo {
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: "ok".to_string(),
            client_ip: client_ip.to_string(),
        }
    }

    /// `GET /health`
    pub fn health(&self) -> HealthReport {
        match self.store.list() {
            Ok(available_certs) => HealthReport {
                status: HealthStatus::Healthy,
                service: SERVICE_NAME.to_string(),
                available_certs,
                error: None,
            },
            Err(e) => HealthReport {
                status: HealthStatus::Unhealthy,
                service: SERVICE_NAME.to_string(),
                available_certs: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    /// `GET /api/v1/{cert}`
    pub async fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        let outcome = self.admit_and_lookup(request).await;

        let reason = match &outcome {
            FetchOutcome::Unauthorized(reason) => Some(reason.as_str()),
            FetchOutcome::Error(message) => Some(message.as_str()),
            _ => None,
        };
        audit::record(&audit::AuditEvent {
            client_ip: request.client_ip,
            cert_name: &request.cert_name,
            outcome: outcome.kind(),
            token: request.token.as_deref(),
            user_agent: request.user_agent.as_deref(),
            reason,
        });

        self.metrics.record_fetch(outcome.kind());
        if let FetchOutcome::Bundle(bundle) = &outcome {
            self.metrics.record_bytes(bundle.size_bytes);
        }

        outcome
    }

    async fn admit_and_lookup(&self, request: &FetchRequest) -> FetchOutcome {
        let addr = request.client_ip;

        if self.attempts.is_locked(addr) {
            return FetchOutcome::Unauthorized(DenyReason::LockedOut);
        }

        if !self.auth.verify(request.token.as_deref().unwrap_or_default()) {
            self.attempts.record_failure(addr);
            return FetchOutcome::Unauthorized(DenyReason::InvalidToken);
        }

        if !self.whitelist.is_authorized(addr).await {
            return FetchOutcome::Unauthorized(DenyReason::NotWhitelisted);
        }
        self.attempts.record_success(addr);

        let store = Arc::clone(&self.store);
        let name = request.cert_name.clone();
        let bundle = match tokio::task::spawn_blocking(move || store.get(&name)).await {
            Ok(Ok(Some(bundle))) => bundle,
            Ok(Ok(None)) => return FetchOutcome::NotFound,
            Ok(Err(e)) => {
                error!(cert_name = %request.cert_name, error = %e, "Failed to read bundle");
                return FetchOutcome::Error(e.to_string());
            }
            Err(e) => {
                error!(cert_name = %request.cert_name, error = %e, "Bundle read task failed");
                return FetchOutcome::Error(e.to_string());
            }
        };

        let current = bundle.content_hash.to_hex();
        if !request.force_download && request.known_hashes.iter().any(|h| *h == current) {
            return FetchOutcome::NotModified(bundle.content_hash);
        }

        FetchOutcome::Bundle(bundle)
    }
}

impl std::fmt::Debug for DistributionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionServer")
            .field("store", &self.store)
            .field("auth", &self.auth)
            .field("whitelist", &self.whitelist)
            .finish_non_exhaustive()
    }
}

/// Bind the listening socket.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Serve `server` on `listener` until `shutdown` completes.
pub async fn serve<F>(
    server: Arc<DistributionServer>,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(listen = %addr, "Distribution server listening");

    let sweeper = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ATTEMPT_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = server.sweep_attempts();
                if removed > 0 {
                    debug!(removed = removed, "Swept failed attempt records");
                }
            }
        })
    };

    let result = axum::serve(
        listener,
        router(server).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;
    sweeper.abort();
    result?;

    info!("Distribution server stopped");
    Ok(())
}
