//! HTTP routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{
    AUTHORIZATION, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, ETAG,
    IF_NONE_MATCH, USER_AGENT,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::error;

use certferry_common::protocol::{
    etag_for, ErrorBody, HealthStatus, API_PREFIX, BUNDLE_CONTENT_TYPE, HEADER_BUNDLE_CREATED,
    HEADER_BUNDLE_SIZE, HEADER_CONTENT_SHA256,
};

use super::client_ip::client_ip;
use super::{DistributionServer, FetchOutcome, FetchRequest};

const UNAUTHORIZED_MESSAGE: &str = "Unauthorized";
const NOT_FOUND_MESSAGE: &str = "Certificate not found";
const INTERNAL_MESSAGE: &str = "Internal server error";

/// Build the router. Handlers need [`ConnectInfo<SocketAddr>`], so serve it
/// with `into_make_service_with_connect_info`.
pub fn router(server: Arc<DistributionServer>) -> Router {
    Router::new()
        .route("/", get(describe))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(&format!("{}/:cert_name", API_PREFIX), get(fetch_bundle))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn describe(
    State(server): State<Arc<DistributionServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(peer.ip(), &headers, server.trusted_proxies());
    Json(server.describe(ip)).into_response()
}

async fn health(State(server): State<Arc<DistributionServer>>) -> Response {
    let report = tokio::task::spawn_blocking(move || server.health()).await;
    match report {
        Ok(report) => {
            let status = match report.status {
                HealthStatus::Healthy => StatusCode::OK,
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(report)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Health check task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
        }
    }
}

async fn metrics(State(server): State<Arc<DistributionServer>>) -> Response {
    match server.metrics().render() {
        Ok(text) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
        }
    }
}

/// Query string of the fetch route: `token`, `download` and `hash`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct FetchQuery {
    token: Option<String>,
    download: Option<String>,
    hash: Option<String>,
}

async fn fetch_bundle(
    State(server): State<Arc<DistributionServer>>,
    Path(cert_name): Path<String>,
    Query(query): Query<FetchQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let request = FetchRequest {
        client_ip: client_ip(peer.ip(), &headers, server.trusted_proxies()),
        token: query.token.clone().or_else(|| bearer_token(&headers)),
        known_hashes: known_hashes(&query, &headers),
        force_download: query.download.as_deref().is_some_and(is_truthy),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        cert_name,
    };

    match server.fetch(&request).await {
        FetchOutcome::Bundle(bundle) => {
            let hash = bundle.content_hash.to_hex();
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, BUNDLE_CONTENT_TYPE)
                .header(CONTENT_LENGTH, bundle.size_bytes)
                .header(ETAG, etag_for(&hash))
                .header(HEADER_CONTENT_SHA256, hash.as_str())
                .header(HEADER_BUNDLE_SIZE, bundle.size_bytes)
                .header(HEADER_BUNDLE_CREATED, bundle.created_at.to_rfc3339())
                .header(
                    CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}.zip\"", bundle.name),
                )
                .header(CACHE_CONTROL, "no-store")
                .body(Body::from(bundle.payload.clone()))
                .unwrap_or_else(|e| {
                    error!(error = %e, "Failed to build bundle response");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
                })
        }
        FetchOutcome::NotModified(hash) => {
            let hash = hash.to_hex();
            Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(ETAG, etag_for(&hash))
                .header(HEADER_CONTENT_SHA256, hash.as_str())
                .body(Body::empty())
                .unwrap_or_else(|e| {
                    error!(error = %e, "Failed to build not-modified response");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
                })
        }
        FetchOutcome::Unauthorized(_) => {
            error_response(StatusCode::UNAUTHORIZED, UNAUTHORIZED_MESSAGE)
        }
        FetchOutcome::NotFound => error_response(StatusCode::NOT_FOUND, NOT_FOUND_MESSAGE),
        FetchOutcome::Error(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim().to_string())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

/// Hashes from the `hash` query parameter and every `If-None-Match` header.
fn known_hashes(query: &FetchQuery, headers: &HeaderMap) -> Vec<String> {
    let mut hashes: Vec<String> = query
        .hash
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect();

    for value in headers.get_all(IF_NONE_MATCH) {
        if let Ok(value) = value.to_str() {
            hashes.extend(parse_if_none_match(value));
        }
    }
    hashes
}

/// Parse an `If-None-Match` value into bare lowercase tags.
///
/// Weak tags are treated as strong ones; `*` is ignored since it would match
/// any bundle regardless of content.
pub(crate) fn parse_if_none_match(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .map(|tag| tag.strip_prefix("W/").unwrap_or(tag))
        .map(|tag| tag.trim_matches('"'))
        .filter(|tag| !tag.is_empty() && *tag != "*")
        .map(str::to_ascii_lowercase)
        .collect()
}
