//! Host preflight: which isolation primitives this machine offers.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Snapshot of the host's isolation support, taken once at harness start
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub is_root: bool,
    pub user_namespaces: bool,
    /// Why user namespaces are unavailable, when they are
    pub user_namespace_note: Option<String>,
    pub cgroup_v2: bool,
    /// The configured cgroup root exists (or can be created) and is writable
    pub cgroup_delegated: bool,
    pub seccomp: bool,
    pub kernel_release: String,
    pub arch: String,
}

impl HostCapabilities {
    pub fn detect(cgroup_root: &Path) -> Self {
        let is_root = nix::unistd::geteuid().is_root();
        let (user_namespaces, user_namespace_note) = detect_user_namespaces(Path::new("/proc/sys"));
        let cgroup_v2 = Path::new("/sys/fs/cgroup/cgroup.controllers").exists();
        let cgroup_delegated = cgroup_v2 && cgroup_root_writable(cgroup_root);

        Self {
            is_root,
            user_namespaces,
            user_namespace_note,
            cgroup_v2,
            cgroup_delegated,
            seccomp: crate::kernel::seccomp::is_seccomp_supported(),
            kernel_release: nix::sys::utsname::uname()
                .map(|u| u.release().to_string_lossy().into_owned())
                .unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Namespaces can be created at all: as root, or through a user namespace
    pub fn can_isolate(&self) -> bool {
        self.is_root || self.user_namespaces
    }

    /// Explanation for [`crate::config::types::HarnessError::IsolationUnavailable`]
    pub fn isolation_gap(&self) -> Option<String> {
        if self.can_isolate() {
            return None;
        }
        Some(format!(
            "not running as root and user namespaces are unavailable ({})",
            self.user_namespace_note
                .as_deref()
                .unwrap_or("unknown reason")
        ))
    }
}

fn read_sysctl(proc_sys: &Path, name: &str) -> Option<i64> {
    fs::read_to_string(proc_sys.join(name))
        .ok()
        .and_then(|v| v.trim().parse().ok())
}

/// Knobs checked, in order: the generic ceiling, the Debian toggle, and the
/// Ubuntu AppArmor restriction.
fn detect_user_namespaces(proc_sys: &Path) -> (bool, Option<String>) {
    if !Path::new("/proc/self/ns/user").exists() {
        return (false, Some("kernel built without CONFIG_USER_NS".to_string()));
    }
    if read_sysctl(proc_sys, "user/max_user_namespaces") == Some(0) {
        return (false, Some("user.max_user_namespaces is 0".to_string()));
    }
    if read_sysctl(proc_sys, "kernel/unprivileged_userns_clone") == Some(0) {
        return (
            false,
            Some("kernel.unprivileged_userns_clone is 0".to_string()),
        );
    }
    if read_sysctl(proc_sys, "kernel/apparmor_restrict_unprivileged_userns") == Some(1) {
        return (
            false,
            Some("kernel.apparmor_restrict_unprivileged_userns is 1".to_string()),
        );
    }
    (true, None)
}

fn cgroup_root_writable(root: &Path) -> bool {
    let probe = if root.exists() {
        root
    } else {
        match root.parent() {
            Some(parent) => parent,
            None => return false,
        }
    };
    nix::unistd::access(probe, nix::unistd::AccessFlags::W_OK).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_does_not_panic() {
        let caps = HostCapabilities::detect(Path::new("/sys/fs/cgroup/probebox"));
        assert_eq!(caps.arch, std::env::consts::ARCH);
        assert_eq!(caps.isolation_gap().is_none(), caps.can_isolate());
    }

    #[test]
    fn sysctl_knobs_disable_user_namespaces() {
        if !Path::new("/proc/self/ns/user").exists() {
            return;
        }
        let fake = tempfile::tempdir().unwrap();
        fs::create_dir_all(fake.path().join("user")).unwrap();
        fs::create_dir_all(fake.path().join("kernel")).unwrap();

        assert_eq!(detect_user_namespaces(fake.path()), (true, None));

        fs::write(fake.path().join("kernel/apparmor_restrict_unprivileged_userns"), "1\n").unwrap();
        let (available, note) = detect_user_namespaces(fake.path());
        assert!(!available);
        assert!(note.unwrap().contains("apparmor"));

        fs::write(fake.path().join("user/max_user_namespaces"), "0\n").unwrap();
        let (_, note) = detect_user_namespaces(fake.path());
        assert!(note.unwrap().contains("max_user_namespaces"));
    }

    #[test]
    fn root_without_userns_can_still_isolate() {
        let caps = HostCapabilities {
            is_root: true,
            user_namespaces: false,
            user_namespace_note: Some("off".to_string()),
            cgroup_v2: false,
            cgroup_delegated: false,
            seccomp: true,
            kernel_release: String::new(),
            arch: "x86_64".to_string(),
        };
        assert!(caps.can_isolate());

        let unprivileged = HostCapabilities {
            is_root: false,
            ..caps
        };
        assert!(unprivileged.isolation_gap().unwrap().contains("off"));
    }
}
