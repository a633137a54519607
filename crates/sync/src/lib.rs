//! certferry consumer node
//!
//! Keeps a local certificate directory in step with the bundle published
//! by the authority.
//!
//! # Components
//!
//! - [`fetch`]: conditional download with retries and an integrity check
//! - [`install`]: versioned extraction and atomic symlink switch
//! - [`state`]: per-certificate install record
//! - [`hook`]: post-update command
//! - [`cycle`]: one full sync under the per-certificate lock

pub mod cycle;
pub mod errors;
pub mod fetch;
pub mod hook;
pub mod install;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cycle::{CycleOutcome, SyncClient};
pub use errors::{InstallError, StateError, SyncError};
pub use fetch::{BundleFetcher, FetchResult};
pub use hook::PostUpdateStatus;
pub use install::Installer;
pub use state::{ClientInstallState, StateStore};
