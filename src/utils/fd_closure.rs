/// Descriptor hygiene for the payload
///
/// Everything above stderr is marked close-on-exec rather than closed: the
/// status pipe must stay usable until `execve` succeeds, and vanish with it.
use crate::config::types::{Result, SandboxError};

const SYS_CLOSE_RANGE: libc::c_long = 436;
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Set FD_CLOEXEC on every descriptor >= `first`
pub fn mark_cloexec_from(first: i32) -> Result<()> {
    // close_range(CLOEXEC) needs 5.11; older kernels return EINVAL or ENOSYS
    let rc = unsafe {
        libc::syscall(
            SYS_CLOSE_RANGE,
            first as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    mark_cloexec_by_scan(first)
}

/// Fallback that does not need /proc, which may not exist inside the root
fn mark_cloexec_by_scan(first: i32) -> Result<()> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(SandboxError::Process(format!(
            "getrlimit(RLIMIT_NOFILE) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let ceiling = limit.rlim_cur.min(65_536) as i32;

    for fd in first..ceiling {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            continue;
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } != 0 {
            return Err(SandboxError::Process(format!(
                "failed to mark fd {} close-on-exec: {}",
                fd,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}
