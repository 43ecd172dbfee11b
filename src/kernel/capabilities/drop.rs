//! All operations are idempotent; failures that leave the payload no worse
//! off (EPERM after the uid drop, EINVAL for unknown caps) are ignored.
use super::{
    LINUX_CAPABILITY_VERSION_3, MAX_CAP, PR_CAPBSET_DROP, PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL,
};
use crate::config::types::{Result, SandboxError};

/// Empty the bounding and ambient sets. Needs CAP_SETPCAP, so call it before
/// the uid transition.
pub fn restrict_bounding_set() -> Result<()> {
    for cap in 0..=MAX_CAP {
        // SAFETY: PR_CAPBSET_DROP with an out-of-range cap returns EINVAL and changes nothing.
        let _ = unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
    }
    // Kernels without ambient capabilities reject this; there is nothing to clear there.
    let _ = unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) };
    Ok(())
}

/// Zero the effective, permitted and inheritable sets via capset(2).
pub fn clear_process_capabilities() -> Result<()> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: i32,
    }

    #[repr(C)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // Version 3 takes two words: caps 0-31 and caps 32-63.
    let data = [
        CapUserData { effective: 0, permitted: 0, inheritable: 0 },
        CapUserData { effective: 0, permitted: 0, inheritable: 0 },
    ];

    // SAFETY: valid v3 header for the calling thread and two initialised data words.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EPERM) {
            return Err(SandboxError::Privilege(format!("capset failed: {}", err)));
        }
    }
    Ok(())
}

/// Block privilege gain through execve (setuid bits, file capabilities).
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: PR_SET_NO_NEW_PRIVS is idempotent and takes no pointers.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(SandboxError::Privilege(format!(
            "Failed to set PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

pub fn check_no_new_privs() -> Result<bool> {
    let rc = unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) };
    if rc < 0 {
        return Err(SandboxError::Privilege(format!(
            "Failed to read PR_GET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(rc == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_new_privs_is_queryable() {
        assert!(check_no_new_privs().is_ok());
    }

    #[test]
    fn no_new_privs_can_be_set_in_a_child() {
        // Irreversible, so only touch a forked child.
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                let ok = set_no_new_privs().is_ok() && matches!(check_no_new_privs(), Ok(true));
                unsafe { libc::_exit(if ok { 0 } else { 1 }) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                let status = nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(status, nix::sys::wait::WaitStatus::Exited(child, 0));
            }
        }
    }
}
