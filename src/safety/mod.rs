//! Safety and cleanup
//!
//! Run-scoped working directories, their symlink-proof removal, and the
//! per-run sandbox identities.

pub mod identity;
pub mod safe_cleanup;
pub mod workspace;
