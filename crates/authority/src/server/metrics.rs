//! Prometheus metrics for the distribution server.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use super::FetchOutcomeKind;

/// Counters exported on `GET /metrics`.
pub struct ServerMetrics {
    registry: Registry,
    fetches: IntCounterVec,
    bytes_served: IntCounter,
}

impl ServerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let fetches = IntCounterVec::new(
            Opts::new("certferry_fetch_total", "Bundle fetch requests by outcome"),
            &["outcome"],
        )?;
        let bytes_served = IntCounter::new(
            "certferry_bytes_served_total",
            "Bundle payload bytes sent to clients",
        )?;

        registry.register(Box::new(fetches.clone()))?;
        registry.register(Box::new(bytes_served.clone()))?;

        // Export every outcome from the start, not only after its first hit
        for kind in FetchOutcomeKind::ALL {
            fetches.with_label_values(&[kind.as_str()]);
        }

        Ok(Self {
            registry,
            fetches,
            bytes_served,
        })
    }

    pub fn record_fetch(&self, kind: FetchOutcomeKind) {
        self.fetches.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_served.inc_by(bytes);
    }

    /// Current count for one outcome.
    pub fn fetch_count(&self, kind: FetchOutcomeKind) -> u64 {
        self.fetches.with_label_values(&[kind.as_str()]).get()
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = ServerMetrics::new().unwrap();
        metrics.record_fetch(FetchOutcomeKind::Served);
        metrics.record_fetch(FetchOutcomeKind::Served);
        metrics.record_bytes(1234);

        let text = metrics.render().unwrap();
        assert!(text.contains("certferry_fetch_total{outcome=\"served\"} 2"));
        assert!(text.contains("certferry_fetch_total{outcome=\"unauthorized\"} 0"));
        assert!(text.contains("certferry_bytes_served_total 1234"));
        assert_eq!(metrics.fetch_count(FetchOutcomeKind::Served), 2);
    }
}
