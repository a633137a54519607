//! Shared building blocks for certferry.
//!
//! - [`ContentHash`]: SHA-256 identity of a packaged bundle
//! - [`protocol`]: HTTP paths, header names and JSON bodies shared by the
//!   authority and the sync client
//! - [`lock`]: non-blocking exclusive lock files guarding publish and sync
//! - [`observability`]: tracing subscriber setup for the binaries

pub mod hash;
pub mod lock;
pub mod observability;
pub mod protocol;

pub use hash::{ContentHash, ParseHashError};
pub use lock::{ExclusiveLock, LockError};
