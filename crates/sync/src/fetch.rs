//! Bundle download with conditional requests and retries.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::{debug, warn};

use certferry_common::protocol::{bundle_path, etag_for, HEADER_CONTENT_SHA256, MAX_BUNDLE_SIZE};
use certferry_common::ContentHash;
use certferry_config::SyncConfig;

use crate::errors::SyncError;

/// Result of a successful fetch.
#[derive(Debug, Clone)]
pub enum FetchResult {
    /// The server's bundle matches the hash we sent
    NotModified(ContentHash),
    /// New bundle bytes, already checked against the advertised hash
    Downloaded { hash: ContentHash, payload: Bytes },
}

/// HTTP client for the authority's fetch endpoint.
#[derive(Debug, Clone)]
pub struct BundleFetcher {
    client: reqwest::Client,
    base_url: String,
    token: String,
    attempts: u32,
    backoff: Duration,
}

impl BundleFetcher {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(!config.verify_tls)
            .user_agent(concat!("certferry-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.server_url.trim().trim_end_matches('/').to_string(),
            token: config.token.clone(),
            attempts: config.retries.max(1),
            backoff: Duration::from_secs(config.backoff_secs),
        })
    }

    /// Fetch `cert_name`, sending `known` as the conditional hash.
    ///
    /// Transport errors and 5xx responses are retried with exponential
    /// backoff; any other failure is returned immediately.
    pub async fn fetch(
        &self,
        cert_name: &str,
        known: Option<&ContentHash>,
    ) -> Result<FetchResult, SyncError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(cert_name, known).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt + 1 < self.attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        cert_name = %cert_name,
                        attempt = attempt + 1,
                        max_attempts = self.attempts,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(
        &self,
        cert_name: &str,
        known: Option<&ContentHash>,
    ) -> Result<FetchResult, SyncError> {
        let url = format!("{}{}", self.base_url, bundle_path(cert_name));

        let mut request = self.client.get(&url).bearer_auth(&self.token);
        if let Some(hash) = known {
            request = request.header(IF_NONE_MATCH, etag_for(&hash.to_hex()));
        }

        debug!(url = %url, conditional = known.is_some(), "Requesting bundle");
        let mut response = request.send().await?;

        match response.status() {
            StatusCode::NOT_MODIFIED => match known {
                Some(hash) => Ok(FetchResult::NotModified(*hash)),
                None => Err(SyncError::UnexpectedStatus(304)),
            },
            StatusCode::OK => {
                let expected = advertised_hash(response.headers())?;
                if let Some(len) = response.content_length() {
                    if len > MAX_BUNDLE_SIZE {
                        return Err(SyncError::TooLarge {
                            size: len,
                            limit: MAX_BUNDLE_SIZE,
                        });
                    }
                }

                let mut body = BytesMut::new();
                while let Some(chunk) = response.chunk().await? {
                    if (body.len() + chunk.len()) as u64 > MAX_BUNDLE_SIZE {
                        return Err(SyncError::TooLarge {
                            size: (body.len() + chunk.len()) as u64,
                            limit: MAX_BUNDLE_SIZE,
                        });
                    }
                    body.extend_from_slice(&chunk);
                }

                let payload = body.freeze();
                let actual = ContentHash::of(&payload);
                if actual != expected {
                    warn!(
                        cert_name = %cert_name,
                        expected = %expected,
                        actual = %actual,
                        "Downloaded bundle does not match advertised hash"
                    );
                    return Err(SyncError::Integrity { expected, actual });
                }

                debug!(
                    cert_name = %cert_name,
                    hash = %actual.short(),
                    size = payload.len(),
                    "Downloaded bundle"
                );
                Ok(FetchResult::Downloaded {
                    hash: actual,
                    payload,
                })
            }
            StatusCode::UNAUTHORIZED => Err(SyncError::Unauthorized),
            StatusCode::NOT_FOUND => Err(SyncError::NotFound(cert_name.to_string())),
            status if status.is_server_error() => Err(SyncError::Server(status.as_u16())),
            status => Err(SyncError::UnexpectedStatus(status.as_u16())),
        }
    }
}

fn advertised_hash(headers: &HeaderMap) -> Result<ContentHash, SyncError> {
    headers
        .get(HEADER_CONTENT_SHA256)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(SyncError::MissingHash)
}
