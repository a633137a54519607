//! certferry authority node
//!
//! Packages renewed certificates into content-addressed bundles and serves
//! them to consumer nodes that pass token and address checks.
//!
//! # Components
//!
//! - [`packager`]: atomic publish of a live certificate directory
//! - [`store`]: bundle directory layout and cached lookups
//! - [`whitelist`]: DNS-backed address whitelist
//! - [`auth`]: constant-time token check and failed-attempt lockout
//! - [`server`]: admission logic and the axum router

pub mod auth;
pub mod errors;
pub mod packager;
pub mod server;
pub mod store;
pub mod whitelist;

// ============================================================================
// Re-exports
// ============================================================================

pub use auth::{mask_token, AttemptTracker, AuthGate};
pub use errors::{PackagingError, ResolveError, ServerError, StoreError};
pub use packager::Packager;
pub use server::{bind, router, serve, DistributionServer, FetchOutcome, FetchRequest};
pub use store::{BundleStore, CertificateBundle};
pub use whitelist::{
    HostResolver, StaticResolver, SystemResolver, WhitelistEntry, WhitelistRefresher,
    WhitelistResolver,
};
