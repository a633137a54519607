//! Wire protocol shared by the authority and the sync client.
//!
//! ```text
//! GET /                                   -> ServiceInfo (JSON)
//! GET /health                             -> HealthReport (JSON, 200 or 503)
//! GET /metrics                            -> Prometheus text
//! GET /api/v1/{cert}?token=..&download=.. -> bundle bytes | 304 | 401 | 404
//! ```

use serde::{Deserialize, Serialize};

/// Service name reported by `GET /` and `GET /health`.
pub const SERVICE_NAME: &str = "certferry";

/// Route prefix for bundle fetches.
pub const API_PREFIX: &str = "/api/v1";

/// Response header carrying the hex SHA-256 of the body.
pub const HEADER_CONTENT_SHA256: &str = "x-content-sha256";

/// Response header carrying the bundle size in bytes.
pub const HEADER_BUNDLE_SIZE: &str = "x-bundle-size";

/// Response header carrying the bundle creation time (RFC 3339).
pub const HEADER_BUNDLE_CREATED: &str = "x-bundle-created";

/// Media type of bundle payloads.
pub const BUNDLE_CONTENT_TYPE: &str = "application/zip";

/// Upper bound for a bundle payload, enforced on both sides.
pub const MAX_BUNDLE_SIZE: u64 = 64 * 1024 * 1024;

/// Path of the fetch endpoint for a certificate name.
pub fn bundle_path(cert_name: &str) -> String {
    format!("{}/{}", API_PREFIX, cert_name)
}

/// Quoted entity tag for a hex hash.
pub fn etag_for(hash_hex: &str) -> String {
    format!("\"{}\"", hash_hex)
}

/// Body of `GET /`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub status: String,
    pub client_ip: String,
}

/// Health state reported by `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_certs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of error responses (401, 404, 500).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

/// Whether a certificate name is safe to use as a file stem.
///
/// Names are restricted to `[A-Za-z0-9._-]`, must not start with a dot and
/// are at most 255 bytes.
pub fn is_valid_cert_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
