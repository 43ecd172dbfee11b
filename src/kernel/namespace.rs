/// Namespace isolation for the sandbox proxy
/// Provides PID, mount, network, IPC, UTS and (unprivileged) user namespaces
use crate::config::types::{NetworkMode, Result, SandboxError};

use nix::sched::{unshare, CloneFlags};
use nix::unistd::sethostname;
use std::fs;

pub const SANDBOX_HOSTNAME: &str = "probebox";

/// Which namespaces a run gets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamespacePlan {
    pub pid: bool,
    pub mount: bool,
    pub network: bool,
    pub user: bool,
    pub ipc: bool,
    pub uts: bool,
}

impl NamespacePlan {
    /// Every namespace except network when the policy grants the host stack,
    /// and user only when the harness lacks real root.
    pub fn for_run(network: NetworkMode, is_root: bool) -> Self {
        Self {
            pid: true,
            mount: true,
            network: network != NetworkMode::Unrestricted,
            user: !is_root,
            ipc: true,
            uts: true,
        }
    }

    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    /// Names of the enabled namespaces, for enforcement reports
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.pid {
            names.push("pid_namespace");
        }
        if self.mount {
            names.push("mount_namespace");
        }
        if self.network {
            names.push("network_namespace");
        }
        if self.user {
            names.push("user_namespace");
        }
        if self.ipc {
            names.push("ipc_namespace");
        }
        if self.uts {
            names.push("uts_namespace");
        }
        names
    }

    /// Unshare every planned namespace from the calling (single-threaded) process.
    ///
    /// The pid namespace only applies to children forked afterwards.
    pub fn apply(&self) -> Result<()> {
        let outer_uid = unsafe { libc::geteuid() };
        let outer_gid = unsafe { libc::getegid() };

        let flags = self.clone_flags();
        if flags.is_empty() {
            return Ok(());
        }
        unshare(flags).map_err(|e| {
            SandboxError::Namespace(format!("Failed to unshare namespaces {:?}: {}", flags, e))
        })?;

        if self.user {
            write_identity_maps(outer_uid, outer_gid)?;
        }
        Ok(())
    }
}

/// Map the caller's own uid/gid into a fresh user namespace.
///
/// `setgroups` must be denied before an unprivileged process may write gid_map.
fn write_identity_maps(uid: libc::uid_t, gid: libc::gid_t) -> Result<()> {
    let write = |path: &str, content: String| -> Result<()> {
        fs::write(path, content).map_err(|e| {
            SandboxError::Namespace(format!("Failed to write {}: {}", path, e))
        })
    };

    match fs::write("/proc/self/setgroups", "deny") {
        Ok(()) => {}
        // Kernels before 3.19 lack the file; the gid_map write then needs no deny.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(SandboxError::Namespace(format!(
                "Failed to deny setgroups: {}",
                e
            )))
        }
    }
    write("/proc/self/uid_map", format!("{} {} 1\n", uid, uid))?;
    write("/proc/self/gid_map", format!("{} {} 1\n", gid, gid))?;
    Ok(())
}

/// Set the UTS hostname; only meaningful inside a fresh UTS namespace
pub fn set_sandbox_hostname() -> Result<()> {
    sethostname(SANDBOX_HOSTNAME)
        .map_err(|e| SandboxError::Namespace(format!("Failed to set hostname: {}", e)))
}

/// Bring `lo` up inside a fresh network namespace
pub fn bring_up_loopback() -> Result<()> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(SandboxError::Namespace(format!(
            "Failed to open socket for loopback setup: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (idx, b) in b"lo\0".iter().enumerate() {
        ifr.ifr_name[idx] = *b as libc::c_char;
    }

    let get_rc = unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut ifr) };
    if get_rc != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(sock) };
        return Err(SandboxError::Namespace(format!(
            "Failed to query loopback flags: {}",
            err
        )));
    }

    let flags = unsafe { ifr.ifr_ifru.ifru_flags } as libc::c_int | libc::IFF_UP;
    ifr.ifr_ifru.ifru_flags = flags as libc::c_short;

    let set_rc = unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &ifr) };
    let set_err = std::io::Error::last_os_error();
    unsafe { libc::close(sock) };

    if set_rc != 0 {
        return Err(SandboxError::Namespace(format!(
            "Failed to bring up loopback interface: {}",
            set_err
        )));
    }
    Ok(())
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL)
///
/// Must succeed before any other mount so nothing propagates back to the host.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        SandboxError::Namespace(format!(
            "Failed to make / private (MS_PRIVATE|MS_REC): {}",
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_network_keeps_host_stack() {
        let plan = NamespacePlan::for_run(NetworkMode::Unrestricted, true);
        assert!(!plan.network);
        assert!(!plan.clone_flags().contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn loopback_and_none_get_a_network_namespace() {
        for mode in [NetworkMode::None, NetworkMode::Loopback] {
            let plan = NamespacePlan::for_run(mode, true);
            assert!(plan.clone_flags().contains(CloneFlags::CLONE_NEWNET));
        }
    }

    #[test]
    fn user_namespace_only_without_root() {
        assert!(!NamespacePlan::for_run(NetworkMode::None, true).user);
        let unprivileged = NamespacePlan::for_run(NetworkMode::None, false);
        assert!(unprivileged.user);
        assert!(unprivileged.enabled().contains(&"user_namespace"));
    }

    #[test]
    fn pid_and_mount_are_always_planned() {
        let plan = NamespacePlan::for_run(NetworkMode::Unrestricted, false);
        let flags = plan.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
    }
}
