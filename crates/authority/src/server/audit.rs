//! Fetch audit events.
//!
//! One event per fetch on the `certferry::audit` target, so operators can
//! route them to a separate sink with `RUST_LOG=certferry::audit=info`.

use std::net::IpAddr;

use tracing::{info, warn};

use crate::auth::mask_token;

use super::FetchOutcomeKind;

/// Tracing target of audit events.
pub const AUDIT_TARGET: &str = "certferry::audit";

/// Fields of one fetch audit event.
#[derive(Debug)]
pub struct AuditEvent<'a> {
    pub client_ip: IpAddr,
    pub cert_name: &'a str,
    pub outcome: FetchOutcomeKind,
    pub token: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    /// Internal detail, never sent to the client
    pub reason: Option<&'a str>,
}

/// Emit an audit event.
pub fn record(event: &AuditEvent<'_>) {
    let token = event.token.map(mask_token).unwrap_or_else(|| "-".to_string());
    let user_agent = event.user_agent.unwrap_or("-");
    let reason = event.reason.unwrap_or("-");

    match event.outcome {
        FetchOutcomeKind::Unauthorized | FetchOutcomeKind::Error => warn!(
            target: AUDIT_TARGET,
            client_ip = %event.client_ip,
            cert_name = %event.cert_name,
            outcome = event.outcome.as_str(),
            token = %token,
            user_agent = %user_agent,
            reason = %reason,
            "Bundle fetch rejected"
        ),
        _ => info!(
            target: AUDIT_TARGET,
            client_ip = %event.client_ip,
            cert_name = %event.cert_name,
            outcome = event.outcome.as_str(),
            token = %token,
            user_agent = %user_agent,
            reason = %reason,
            "Bundle fetch"
        ),
    }
}
