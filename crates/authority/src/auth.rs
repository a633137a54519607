//! Token authentication
//!
//! Every fetch presents the shared token. The comparison hashes both sides
//! with SHA-256 and compares the digests in constant time, so neither the
//! token's content nor its length shows up in response timing.
//!
//! Repeated failures from one address lock that address out for a while.
//! The lockout is reported exactly like a wrong token.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use certferry_config::DEFAULT_PLACEHOLDER_TOKENS;

/// Whether `token` is one of the well-known placeholder values.
pub fn is_placeholder(token: &str) -> bool {
    let token = token.trim();
    DEFAULT_PLACEHOLDER_TOKENS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(token))
}

/// Render a token for logs: `***` followed by its last four characters.
pub fn mask_token(token: &str) -> String {
    let count = token.chars().count();
    if count <= 4 {
        return "***".to_string();
    }
    let tail: String = token.chars().skip(count - 4).collect();
    format!("***{}", tail)
}

/// Shared-secret check.
pub struct AuthGate {
    /// Digest of the configured token; `None` rejects everything
    expected: Option<[u8; 32]>,
}

impl AuthGate {
    /// Create a gate for `token`.
    ///
    /// An empty or placeholder token yields a gate that rejects every request.
    pub fn new(token: &str) -> Self {
        if token.is_empty() || is_placeholder(token) {
            warn!("No usable token configured, all fetches will be rejected");
            return Self { expected: None };
        }
        Self {
            expected: Some(digest(token)),
        }
    }

    /// Whether a usable token is configured.
    pub fn is_configured(&self) -> bool {
        self.expected.is_some()
    }

    /// Check a presented token.
    pub fn verify(&self, presented: &str) -> bool {
        let Some(expected) = &self.expected else {
            return false;
        };
        if presented.is_empty() {
            return false;
        }
        let presented = digest(presented);
        expected.as_slice().ct_eq(presented.as_slice()).into()
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("configured", &self.is_configured())
            .finish()
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

// =============================================================================
// Failed Attempt Tracking
// =============================================================================

/// Upper bound for tracked addresses; beyond it new addresses are not
/// counted until a sweep frees room.
const MAX_TRACKED_ADDRESSES: usize = 65_536;

#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    failures: u32,
    /// Start of the current failure window
    first_failure: Instant,
    locked_until: Option<Instant>,
}

impl AttemptRecord {
    /// Whether the record still carries information at `now`: an active
    /// lockout or failures inside the window.
    fn is_live(&self, now: Instant, window: Duration) -> bool {
        match self.locked_until {
            Some(until) => now < until,
            None => now.saturating_duration_since(self.first_failure) < window,
        }
    }
}

/// Per-address failed token counter with temporary lockout.
///
/// Failures count towards a lockout only within one window (the lockout
/// duration) starting at the first failure; older failures are forgotten.
pub struct AttemptTracker {
    max_failures: u32,
    lockout: Duration,
    max_tracked: usize,
    records: DashMap<IpAddr, AttemptRecord>,
}

impl AttemptTracker {
    /// `max_failures` of 0 disables lockout.
    pub fn new(max_failures: u32, lockout: Duration) -> Self {
        Self {
            max_failures,
            lockout,
            max_tracked: MAX_TRACKED_ADDRESSES,
            records: DashMap::new(),
        }
    }

    /// Whether `addr` is currently locked out. Expired lockouts are cleared.
    pub fn is_locked(&self, addr: IpAddr) -> bool {
        if self.max_failures == 0 {
            return false;
        }

        let locked_until = match self.records.get(&addr) {
            Some(record) => record.locked_until,
            None => return false,
        };

        match locked_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                self.records.remove(&addr);
                debug!(client_ip = %addr, "Lockout expired");
                false
            }
            None => false,
        }
    }

    /// Record a failed attempt. Returns true if this failure started a lockout.
    pub fn record_failure(&self, addr: IpAddr) -> bool {
        if self.max_failures == 0 {
            return false;
        }

        let now = Instant::now();
        if !self.records.contains_key(&addr) && self.records.len() >= self.max_tracked {
            let removed = self.sweep();
            if self.records.len() >= self.max_tracked {
                warn!(
                    client_ip = %addr,
                    tracked = self.records.len(),
                    removed = removed,
                    "Failed attempt table is full, not tracking address"
                );
                return false;
            }
        }

        let mut record = self.records.entry(addr).or_insert(AttemptRecord {
            failures: 0,
            first_failure: now,
            locked_until: None,
        });

        if record.locked_until.is_none() && !record.is_live(now, self.lockout) {
            record.failures = 0;
            record.first_failure = now;
        }
        record.failures += 1;

        if record.failures >= self.max_failures && record.locked_until.is_none() {
            record.locked_until = Some(now + self.lockout);
            warn!(
                client_ip = %addr,
                failures = record.failures,
                lockout_secs = self.lockout.as_secs(),
                "Too many failed token attempts, locking out address"
            );
            return true;
        }
        false
    }

    /// Forget failures of `addr` after a successful attempt.
    pub fn record_success(&self, addr: IpAddr) {
        self.records.remove(&addr);
    }

    /// Drop records with neither an active lockout nor failures inside the
    /// window. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, record| record.is_live(now, self.lockout));
        before.saturating_sub(self.records.len())
    }

    /// Number of addresses with a record.
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }

    /// Number of currently locked addresses.
    pub fn locked_count(&self) -> usize {
        let now = Instant::now();
        self.records
            .iter()
            .filter(|r| r.locked_until.is_some_and(|until| now < until))
            .count()
    }
}

impl std::fmt::Debug for AttemptTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptTracker")
            .field("max_failures", &self.max_failures)
            .field("lockout", &self.lockout)
            .field("tracked", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TOKEN: &str = "f3a9c1e07b2d4f68a1c3e5b7d9f0a2c4";

    #[test]
    fn test_verify() {
        let gate = AuthGate::new(TOKEN);
        assert!(gate.is_configured());
        assert!(gate.verify(TOKEN));
        assert!(!gate.verify(""));
        assert!(!gate.verify("f3a9c1e07b2d4f68a1c3e5b7d9f0a2c"));
        assert!(!gate.verify(&format!("{}x", TOKEN)));
    }

    #[test]
    fn test_unusable_tokens_reject_everything() {
        for token in ["", "changeme", "CHANGEME", "your-token-here", "secret"] {
            let gate = AuthGate::new(token);
            assert!(!gate.is_configured(), "{token} should be rejected");
            assert!(!gate.verify(token));
            assert!(!gate.verify(""));
        }
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token(TOKEN), "***a2c4");
        assert_eq!(mask_token("abcd"), "***");
        assert_eq!(mask_token(""), "***");
        assert_eq!(mask_token("ééééé"), "***éééé");
    }

    #[test]
    fn test_lockout_after_max_failures() {
        let tracker = AttemptTracker::new(3, Duration::from_secs(900));
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let other: IpAddr = "192.0.2.2".parse().unwrap();

        assert!(!tracker.record_failure(addr));
        assert!(!tracker.record_failure(addr));
        assert!(!tracker.is_locked(addr));
        assert!(tracker.record_failure(addr));
        assert!(tracker.is_locked(addr));
        assert!(!tracker.is_locked(other));
        assert_eq!(tracker.locked_count(), 1);
    }

    #[test]
    fn test_success_resets_counter() {
        let tracker = AttemptTracker::new(2, Duration::from_secs(900));
        let addr: IpAddr = "192.0.2.1".parse().unwrap();

        tracker.record_failure(addr);
        tracker.record_success(addr);
        assert!(!tracker.record_failure(addr));
        assert!(!tracker.is_locked(addr));
    }

    #[test]
    fn test_lockout_expires() {
        let tracker = AttemptTracker::new(1, Duration::from_millis(20));
        let addr: IpAddr = "192.0.2.1".parse().unwrap();

        assert!(tracker.record_failure(addr));
        assert!(tracker.is_locked(addr));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!tracker.is_locked(addr));
    }

    #[test]
    fn test_failures_outside_window_are_forgotten() {
        let tracker = AttemptTracker::new(3, Duration::from_millis(30));
        let addr: IpAddr = "192.0.2.1".parse().unwrap();

        assert!(!tracker.record_failure(addr));
        assert!(!tracker.record_failure(addr));
        std::thread::sleep(Duration::from_millis(60));

        // Window passed: this starts a new count instead of locking out
        assert!(!tracker.record_failure(addr));
        assert!(!tracker.is_locked(addr));
    }

    #[test]
    fn test_sweep_drops_expired_records() {
        let tracker = AttemptTracker::new(5, Duration::from_millis(30));
        for i in 0..100u8 {
            tracker.record_failure(IpAddr::from([198, 51, 100, i]));
        }
        assert_eq!(tracker.tracked_count(), 100);
        assert_eq!(tracker.sweep(), 0);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(tracker.sweep(), 100);
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_active_lockouts() {
        let tracker = AttemptTracker::new(1, Duration::from_secs(900));
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(tracker.record_failure(addr));

        assert_eq!(tracker.sweep(), 0);
        assert!(tracker.is_locked(addr));
    }

    #[test]
    fn test_table_size_is_bounded() {
        let mut tracker = AttemptTracker::new(5, Duration::from_secs(900));
        tracker.max_tracked = 16;

        for i in 0..=255u8 {
            tracker.record_failure(IpAddr::from([203, 0, 113, i]));
        }
        assert_eq!(tracker.tracked_count(), 16);

        // Already tracked addresses keep counting
        let first = IpAddr::from([203, 0, 113, 0]);
        for _ in 0..4 {
            tracker.record_failure(first);
        }
        assert!(tracker.is_locked(first));
    }

    #[test]
    fn test_zero_disables_lockout() {
        let tracker = AttemptTracker::new(0, Duration::from_secs(900));
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        for _ in 0..100 {
            assert!(!tracker.record_failure(addr));
        }
        assert!(!tracker.is_locked(addr));
    }

    proptest! {
        #[test]
        fn prop_only_exact_token_verifies(expected in "[a-zA-Z0-9]{16,48}", presented in ".{0,64}") {
            let gate = AuthGate::new(&expected);
            prop_assert_eq!(gate.verify(&presented), presented == expected);
            prop_assert!(gate.verify(&expected));
        }
    }

    /// Mean verification time for a wrong token sharing a long prefix with
    /// the secret should match one differing in the first byte.
    #[test]
    #[ignore = "timing measurement, run manually on an idle machine"]
    fn test_verify_timing_is_prefix_independent() {
        let secret = "a".repeat(64);
        let gate = AuthGate::new(&secret);
        let near = format!("{}b", "a".repeat(63));
        let far = format!("b{}", "a".repeat(63));

        let measure = |candidate: &str| {
            let start = Instant::now();
            for _ in 0..200_000 {
                std::hint::black_box(gate.verify(std::hint::black_box(candidate)));
            }
            start.elapsed().as_secs_f64()
        };

        // Warm up
        measure(&far);
        let near_time = measure(&near);
        let far_time = measure(&far);
        let ratio = near_time / far_time;
        assert!((0.8..1.25).contains(&ratio), "timing ratio {ratio}");
    }
}
