//! Address whitelist backed by DNS
//!
//! Consumer nodes are identified by domain names (typically dynamic DNS
//! records) or literal addresses. Each configured domain has its own cache
//! slot holding the last resolved address set:
//!
//! - A slot is replaced wholesale; readers see the old or the new complete set
//! - Expired slots are re-resolved on access, at most one query per slot at a
//!   time; concurrent readers keep using the current set meanwhile, or wait
//!   for it if the slot never resolved
//! - A slot is queried at most once per miss-refresh interval, so a domain
//!   whose resolution keeps failing does not cost a query on every request
//! - A failed resolution keeps the last-known set; a domain that never
//!   resolved matches nothing
//! - An address not found in any slot forces one re-resolution of slots whose
//!   last attempt is older than the miss-refresh interval
//!
//! An empty whitelist authorizes nothing.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, info, trace, warn};

use certferry_config::WhitelistConfig;

use crate::errors::ResolveError;

/// Upper bound for a single resolution.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum period of the background refresher.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Resolver Trait
// =============================================================================

/// Name resolution backend.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve a host name to its addresses.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Resolver using the system DNS configuration (`/etc/resolv.conf`).
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    /// Build from the system configuration, falling back to the library
    /// defaults if it cannot be read.
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read system resolver configuration, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { inner }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| ResolveError::new(host, e.to_string()))?;
        Ok(lookup.iter().collect())
    }
}

/// Resolver answering from an in-memory table.
///
/// Unknown hosts and hosts marked as failing return an error.
#[derive(Default)]
pub struct StaticResolver {
    table: DashMap<String, Result<Vec<IpAddr>, String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `host` with `addrs` from now on.
    pub fn set(&self, host: &str, addrs: Vec<IpAddr>) {
        self.table.insert(host.to_string(), Ok(addrs));
    }

    /// Fail every resolution of `host` from now on.
    pub fn fail(&self, host: &str, message: &str) {
        self.table.insert(host.to_string(), Err(message.to_string()));
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        match self.table.get(host).map(|entry| entry.value().clone()) {
            Some(Ok(addrs)) => Ok(addrs),
            Some(Err(message)) => Err(ResolveError::new(host, message)),
            None => Err(ResolveError::new(host, "no such host")),
        }
    }
}

// =============================================================================
// Cache Entries
// =============================================================================

/// Cached resolution state of one whitelist domain.
#[derive(Debug, Clone)]
pub struct WhitelistEntry {
    /// Domain name or literal address as configured
    pub domain: String,
    /// Last successfully resolved addresses
    pub resolved_addresses: Arc<HashSet<IpAddr>>,
    /// When `resolved_addresses` was obtained
    pub resolved_at: Option<Instant>,
    pub ttl: Duration,
    /// Last resolution attempt, successful or not
    pub last_attempt: Option<Instant>,
    /// Error of the last attempt, cleared on success
    pub last_error: Option<String>,
    /// Literal address; never re-resolved
    pub is_static: bool,
}

impl WhitelistEntry {
    fn pending(domain: &str, ttl: Duration) -> Self {
        Self {
            domain: domain.to_string(),
            resolved_addresses: Arc::new(HashSet::new()),
            resolved_at: None,
            ttl,
            last_attempt: None,
            last_error: None,
            is_static: false,
        }
    }

    fn literal(domain: &str, addr: IpAddr) -> Self {
        let now = Instant::now();
        Self {
            domain: domain.to_string(),
            resolved_addresses: Arc::new(HashSet::from([addr])),
            resolved_at: Some(now),
            ttl: Duration::MAX,
            last_attempt: Some(now),
            last_error: None,
            is_static: true,
        }
    }

    /// Whether the cached set is still within its TTL.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.is_static
            || self
                .resolved_at
                .is_some_and(|at| now.saturating_duration_since(at) < self.ttl)
    }

    fn attempted_within(&self, now: Instant, window: Duration) -> bool {
        self.last_attempt
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }
}

struct DomainSlot {
    entry: ArcSwap<WhitelistEntry>,
    /// Held while a resolution for this slot is in flight
    refresh: tokio::sync::Mutex<()>,
}

impl DomainSlot {
    fn new(entry: WhitelistEntry) -> Self {
        Self {
            entry: ArcSwap::from_pointee(entry),
            refresh: tokio::sync::Mutex::new(()),
        }
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// DNS-backed address whitelist.
pub struct WhitelistResolver {
    slots: Vec<DomainSlot>,
    resolver: Arc<dyn HostResolver>,
    ttl: Duration,
    miss_refresh: Duration,
    enable_ipv6: bool,
}

impl WhitelistResolver {
    /// Build the whitelist. Nothing is resolved until first use or
    /// [`refresh_all`](Self::refresh_all).
    pub fn new(config: &WhitelistConfig, resolver: Arc<dyn HostResolver>) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_secs);

        let mut seen = HashSet::new();
        let slots = config
            .domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty() && seen.insert(d.to_ascii_lowercase()))
            .map(|domain| match domain.parse::<IpAddr>() {
                Ok(addr) => DomainSlot::new(WhitelistEntry::literal(domain, addr.to_canonical())),
                Err(_) => DomainSlot::new(WhitelistEntry::pending(domain, ttl)),
            })
            .collect::<Vec<_>>();

        if slots.is_empty() {
            warn!("Whitelist is empty, all fetches will be rejected");
        }

        Self {
            slots,
            resolver,
            ttl,
            miss_refresh: Duration::from_secs(config.miss_refresh_secs),
            enable_ipv6: config.enable_ipv6,
        }
    }

    /// Cache TTL for resolved domains
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `addr` belongs to any whitelisted domain.
    ///
    /// Fresh slots are checked first without touching DNS. A slot is then
    /// re-resolved only if its last attempt, successful or not, is older than
    /// the miss-refresh interval; otherwise its cached set is used as is.
    pub async fn is_authorized(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        let now = Instant::now();

        for slot in &self.slots {
            let entry = slot.entry.load();
            if entry.is_fresh(now) && entry.resolved_addresses.contains(&addr) {
                trace!(client_ip = %addr, domain = %entry.domain, "Whitelist match");
                return true;
            }
        }

        // Stale slots, and fresh ones in case the client's DNS record just changed
        for slot in &self.slots {
            let entry = slot.entry.load_full();
            if entry.is_static {
                continue;
            }
            if entry.attempted_within(now, self.miss_refresh) {
                if !entry.is_fresh(now) && entry.resolved_addresses.contains(&addr) {
                    trace!(
                        client_ip = %addr,
                        domain = %entry.domain,
                        "Whitelist match on last known addresses"
                    );
                    return true;
                }
                continue;
            }

            let stale = !entry.is_fresh(now);
            let entry = self.refresh_slot(slot).await;
            if entry.resolved_addresses.contains(&addr) {
                debug!(
                    client_ip = %addr,
                    domain = %entry.domain,
                    expired = stale,
                    "Whitelist match after refresh"
                );
                return true;
            }
        }

        debug!(client_ip = %addr, "Address not in whitelist");
        false
    }

    /// Re-resolve every DNS domain. Returns the number of domains that
    /// currently have at least one address.
    pub async fn refresh_all(&self) -> usize {
        for slot in &self.slots {
            self.refresh_slot(slot).await;
        }

        let resolved = self
            .slots
            .iter()
            .filter(|slot| !slot.entry.load().resolved_addresses.is_empty())
            .count();

        info!(
            domains = self.slots.len(),
            resolved = resolved,
            "Refreshed whitelist"
        );
        resolved
    }

    /// Current state of every slot.
    pub fn snapshot(&self) -> Vec<WhitelistEntry> {
        self.slots
            .iter()
            .map(|slot| WhitelistEntry::clone(&slot.entry.load()))
            .collect()
    }

    async fn refresh_slot(&self, slot: &DomainSlot) -> Arc<WhitelistEntry> {
        let _guard = match slot.refresh.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Someone else is resolving this slot. Use what is there,
                // unless there is nothing yet.
                let current = slot.entry.load_full();
                if current.resolved_at.is_some() {
                    return current;
                }
                drop(slot.refresh.lock().await);
                return slot.entry.load_full();
            }
        };

        let current = slot.entry.load_full();
        if current.is_static {
            return current;
        }

        let now = Instant::now();
        let result = tokio::time::timeout(RESOLVE_TIMEOUT, self.resolver.resolve(&current.domain))
            .await
            .unwrap_or_else(|_| Err(ResolveError::new(&current.domain, "resolution timed out")));

        let next = match result {
            Ok(addrs) => {
                let addresses: HashSet<IpAddr> = addrs
                    .into_iter()
                    .map(|a| a.to_canonical())
                    .filter(|a| self.enable_ipv6 || a.is_ipv4())
                    .collect();
                debug!(
                    domain = %current.domain,
                    addresses = ?addresses,
                    "Resolved whitelist domain"
                );
                WhitelistEntry {
                    domain: current.domain.clone(),
                    resolved_addresses: Arc::new(addresses),
                    resolved_at: Some(now),
                    ttl: self.ttl,
                    last_attempt: Some(now),
                    last_error: None,
                    is_static: false,
                }
            }
            Err(e) => {
                warn!(
                    domain = %current.domain,
                    error = %e.message,
                    kept_addresses = current.resolved_addresses.len(),
                    "Whitelist resolution failed, keeping last known addresses"
                );
                WhitelistEntry {
                    last_attempt: Some(now),
                    last_error: Some(e.message),
                    ..WhitelistEntry::clone(&current)
                }
            }
        };

        let next = Arc::new(next);
        slot.entry.store(Arc::clone(&next));
        next
    }
}

impl std::fmt::Debug for WhitelistResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhitelistResolver")
            .field("domains", &self.slots.len())
            .field("ttl", &self.ttl)
            .field("enable_ipv6", &self.enable_ipv6)
            .finish()
    }
}

// =============================================================================
// Background Refresher
// =============================================================================

/// Periodically re-resolves the whitelist so request-time lookups rarely
/// wait on DNS.
pub struct WhitelistRefresher {
    whitelist: Arc<WhitelistResolver>,
    interval: Duration,
}

impl WhitelistRefresher {
    /// Refresh every cache TTL.
    pub fn new(whitelist: Arc<WhitelistResolver>) -> Self {
        let interval = whitelist.ttl().max(MIN_REFRESH_INTERVAL);
        Self {
            whitelist,
            interval,
        }
    }

    /// Run until the task is dropped or aborted.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting whitelist refresher"
        );

        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; startup already refreshed
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.whitelist.refresh_all().await;
        }
    }
}

impl std::fmt::Debug for WhitelistRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhitelistRefresher")
            .field("interval", &self.interval)
            .finish()
    }
}
