//! KDL parsing for certferry configuration documents.

pub(crate) mod helpers;
mod authority;
mod sync;

pub use authority::parse_authority_document;
pub use sync::parse_sync_document;
