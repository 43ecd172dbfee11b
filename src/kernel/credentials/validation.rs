//! Credential validation logic.

use crate::config::types::{Result, SandboxError};

/// The sandbox identity must never be root.
pub fn validate_ids(uid: u32, gid: u32) -> Result<()> {
    if uid == 0 || gid == 0 {
        return Err(SandboxError::Privilege(format!(
            "Refusing to run the payload as root (uid={}, gid={})",
            uid, gid
        )));
    }
    Ok(())
}
