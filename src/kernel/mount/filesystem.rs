/// Restricted filesystem view for one run
///
/// The root is assembled inside the sandbox mount namespace from nothing but
/// the private working directory, the allow-list, a few device nodes and a
/// size-capped tmpfs. Anything not explicitly mounted does not exist.
use crate::config::types::{FilesystemPolicy, PathAccess, PathRule, Result, SandboxError};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::statvfs::{statvfs, FsFlags};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Working directory of the payload, inside the sandbox root
pub const BOX_DIR: &str = "/box";

const DEVICES: [&str; 4] = ["null", "zero", "random", "urandom"];

/// What the root build did, reported back to the harness
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MountReport {
    pub bound: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub proc_mounted: bool,
    pub pivoted: bool,
}

/// Root filesystem builder for the sandbox init process
#[derive(Clone, Debug)]
pub struct SandboxRoot {
    /// Host directory that becomes `/`
    root: PathBuf,
    policy: FilesystemPolicy,
    /// Owner for `/box` when the payload drops to an unprivileged uid
    box_owner: Option<(u32, u32)>,
}

impl SandboxRoot {
    pub fn new(root: PathBuf, policy: FilesystemPolicy, box_owner: Option<(u32, u32)>) -> Self {
        Self {
            root,
            policy,
            box_owner,
        }
    }

    /// Host path under the new root where `inner` will appear
    pub fn target_for(&self, inner: &Path) -> PathBuf {
        self.root.join(inner.strip_prefix("/").unwrap_or(inner))
    }

    /// Mount everything. Must run inside a private mount namespace.
    pub fn build(&self) -> Result<MountReport> {
        let mut report = MountReport::default();

        // pivot_root needs the new root to be a mount point
        bind(&self.root, &self.root, false)?;

        let box_dir = self.target_for(Path::new(BOX_DIR));
        fs::create_dir_all(&box_dir)?;
        if let Some((uid, gid)) = self.box_owner {
            chown_tree(&box_dir, uid, gid)?;
        }
        // Separate mount so it stays writable once the root goes read-only
        bind(&box_dir, &box_dir, false)?;

        self.mount_devices()?;

        // Before the allow-list, so rules under /tmp land on top of the tmpfs
        if let Some(bytes) = self.policy.tmpfs_bytes {
            self.mount_tmp(bytes)?;
        }

        for rule in &self.policy.allow {
            if !rule.path.exists() {
                if rule.optional {
                    report.skipped.push(rule.path.clone());
                    continue;
                }
                return Err(SandboxError::Mount(format!(
                    "allow-listed path does not exist: {}",
                    rule.path.display()
                )));
            }
            self.bind_rule(rule)?;
            report.bound.push(rule.path.clone());
        }

        // Allow rules under /proc are refused by validation
        if self.policy.mount_proc {
            let target = self.target_for(Path::new("/proc"));
            fs::create_dir_all(&target)?;
            mount(
                Some("proc"),
                &target,
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            )
            .map_err(|e| SandboxError::Mount(format!("Failed to mount /proc: {}", e)))?;
            report.proc_mounted = true;
        }

        let root_flags = MsFlags::MS_BIND
            | MsFlags::MS_REMOUNT
            | MsFlags::MS_RDONLY
            | MsFlags::MS_NOSUID
            | MsFlags::MS_NODEV
            | locked_flags(&self.root);
        mount(None::<&str>, &self.root, None::<&str>, root_flags, None::<&str>)
            .map_err(|e| SandboxError::Mount(format!("Failed to seal sandbox root: {}", e)))?;

        Ok(report)
    }

    fn bind_rule(&self, rule: &PathRule) -> Result<()> {
        let target = self.target_for(&rule.path);
        prepare_mount_point(&rule.path, &target)?;
        bind(&rule.path, &target, true)?;

        // A plain MS_BIND ignores MS_RDONLY; the flags only stick on remount.
        let mut flags = MsFlags::MS_BIND
            | MsFlags::MS_REMOUNT
            | MsFlags::MS_NOSUID
            | MsFlags::MS_NODEV
            | locked_flags(&rule.path);
        if rule.access == PathAccess::ReadOnly {
            flags |= MsFlags::MS_RDONLY;
        }
        mount(None::<&str>, &target, None::<&str>, flags, None::<&str>).map_err(|e| {
            SandboxError::Mount(format!(
                "Failed to restrict bind mount {}: {}",
                target.display(),
                e
            ))
        })
    }

    fn mount_devices(&self) -> Result<()> {
        let dev_dir = self.target_for(Path::new("/dev"));
        fs::create_dir_all(&dev_dir)?;
        fs::set_permissions(&dev_dir, fs::Permissions::from_mode(0o755))?;
        for name in DEVICES {
            let source = Path::new("/dev").join(name);
            let target = dev_dir.join(name);
            fs::File::create(&target)?;
            bind(&source, &target, false)?;
        }
        Ok(())
    }

    fn mount_tmp(&self, bytes: u64) -> Result<()> {
        let target = self.target_for(Path::new("/tmp"));
        fs::create_dir_all(&target)?;
        let options = format!("size={},mode=1777", bytes);
        mount(
            Some("tmpfs"),
            &target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(options.as_str()),
        )
        .map_err(|e| SandboxError::Mount(format!("Failed to mount tmpfs on /tmp: {}", e)))
    }

    /// Switch the calling process into the new root and chdir to `/box`.
    ///
    /// Returns true when pivot_root succeeded, false when chroot was used.
    pub fn enter(&self) -> Result<bool> {
        std::env::set_current_dir(&self.root)?;

        let pivoted = match nix::unistd::pivot_root(".", ".") {
            Ok(()) => {
                // The old root is stacked under "."; detach it.
                umount2(".", MntFlags::MNT_DETACH).map_err(|e| {
                    SandboxError::Mount(format!("Failed to detach old root: {}", e))
                })?;
                true
            }
            Err(_) => {
                nix::unistd::chroot(".")
                    .map_err(|e| SandboxError::Mount(format!("chroot failed: {}", e)))?;
                false
            }
        };

        std::env::set_current_dir(BOX_DIR).map_err(|e| {
            SandboxError::Mount(format!("Failed to enter {}: {}", BOX_DIR, e))
        })?;
        Ok(pivoted)
    }
}

fn bind(source: &Path, target: &Path, recursive: bool) -> Result<()> {
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(|e| {
        SandboxError::Mount(format!(
            "Failed to bind {} to {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })
}

/// Mount points mirror the source type: directories for directories, empty
/// files for everything else.
fn prepare_mount_point(source: &Path, target: &Path) -> Result<()> {
    if source.is_dir() {
        fs::create_dir_all(target)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if !target.exists() {
            fs::File::create(target)?;
        }
    }
    Ok(())
}

/// Flags the kernel refuses to clear on a bind remount inside a user namespace.
fn locked_flags(source: &Path) -> MsFlags {
    let mut flags = MsFlags::empty();
    let Ok(stat) = statvfs(source) else {
        return flags;
    };
    let current = stat.flags();
    if current.contains(FsFlags::ST_NOEXEC) {
        flags |= MsFlags::MS_NOEXEC;
    }
    if current.contains(FsFlags::ST_RDONLY) {
        flags |= MsFlags::MS_RDONLY;
    }
    if current.contains(FsFlags::ST_NOATIME) {
        flags |= MsFlags::MS_NOATIME;
    }
    if current.contains(FsFlags::ST_NODIRATIME) {
        flags |= MsFlags::MS_NODIRATIME;
    }
    if current.contains(FsFlags::ST_RELATIME) {
        flags |= MsFlags::MS_RELATIME;
    }
    flags
}

fn chown_tree(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    if fs::symlink_metadata(path)?.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> SandboxRoot {
        SandboxRoot::new(
            PathBuf::from("/run/probebox/abc/root"),
            FilesystemPolicy::default(),
            None,
        )
    }

    #[test]
    fn targets_nest_under_the_new_root() {
        let root = root();
        assert_eq!(
            root.target_for(Path::new("/usr/lib")),
            PathBuf::from("/run/probebox/abc/root/usr/lib")
        );
        assert_eq!(
            root.target_for(Path::new(BOX_DIR)),
            PathBuf::from("/run/probebox/abc/root/box")
        );
    }

    #[test]
    fn mount_points_follow_source_type() {
        let scratch = tempfile::tempdir().unwrap();
        let file_source = scratch.path().join("data.txt");
        fs::write(&file_source, "x").unwrap();

        let dir_target = scratch.path().join("new/usr");
        prepare_mount_point(scratch.path(), &dir_target).unwrap();
        assert!(dir_target.is_dir());

        let file_target = scratch.path().join("new/etc/data.txt");
        prepare_mount_point(&file_source, &file_target).unwrap();
        assert!(file_target.is_file());
    }

    #[test]
    fn locked_flags_never_panic_on_missing_paths() {
        assert_eq!(locked_flags(Path::new("/definitely/not/here")), MsFlags::empty());
    }

    #[test]
    fn chown_tree_to_self_is_a_noop() {
        let scratch = tempfile::tempdir().unwrap();
        fs::create_dir_all(scratch.path().join("a/b")).unwrap();
        fs::write(scratch.path().join("a/b/f"), "x").unwrap();
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        chown_tree(scratch.path(), uid, gid).unwrap();
    }
}
