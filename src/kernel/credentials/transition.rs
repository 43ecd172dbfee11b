//! Safe UID/GID transitions to unprivileged credentials.

use super::validation::validate_ids;
use crate::config::types::{Result, SandboxError};
use nix::unistd::{getegid, geteuid, getgid, getuid, setgroups};

/// validate -> clear groups -> setresgid -> setresuid -> verify.
pub fn transition_to_unprivileged(uid: u32, gid: u32) -> Result<()> {
    validate_ids(uid, gid)?;

    setgroups(&[]).map_err(|e| {
        SandboxError::Privilege(format!("Failed to clear supplementary groups: {}", e))
    })?;

    // GID before UID: after setresuid we no longer hold CAP_SETGID.
    // SAFETY: setresgid/setresuid take plain integers.
    if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
        return Err(SandboxError::Privilege(format!(
            "Failed to setresgid({}): {}",
            gid,
            std::io::Error::last_os_error()
        )));
    }
    if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
        return Err(SandboxError::Privilege(format!(
            "Failed to setresuid({}): {}",
            uid,
            std::io::Error::last_os_error()
        )));
    }

    verify_transition(uid, gid)
}

fn verify_transition(expected_uid: u32, expected_gid: u32) -> Result<()> {
    let (real_uid, effective_uid) = (getuid().as_raw(), geteuid().as_raw());
    if real_uid != expected_uid || effective_uid != expected_uid {
        return Err(SandboxError::Privilege(format!(
            "UID verification failed: expected {}, got real={}, effective={}",
            expected_uid, real_uid, effective_uid
        )));
    }

    let (real_gid, effective_gid) = (getgid().as_raw(), getegid().as_raw());
    if real_gid != expected_gid || effective_gid != expected_gid {
        return Err(SandboxError::Privilege(format!(
            "GID verification failed: expected {}, got real={}, effective={}",
            expected_gid, real_gid, effective_gid
        )));
    }

    // Regaining root must be impossible now
    if unsafe { libc::setuid(0) } == 0 {
        return Err(SandboxError::Privilege(
            "setuid(0) succeeded after credential drop".to_string(),
        ));
    }
    Ok(())
}
