//! Symlink-proof recursive removal of run directories.
//!
//! Everything under a run directory was writable by untrusted code, so the
//! walk goes through directory fds (`openat`/`fstatat`/`unlinkat`) and never
//! follows a link or crosses onto another filesystem.
use crate::config::types::{Result, SandboxError};
use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

struct DirFd(RawFd);

impl Drop for DirFd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe { libc::close(self.0) };
        }
    }
}

const DIR_FLAGS: libc::c_int =
    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW;

fn last_error(what: &str, name: &dyn std::fmt::Debug) -> SandboxError {
    let err = std::io::Error::last_os_error();
    SandboxError::Io(std::io::Error::new(
        err.kind(),
        format!("{} {:?}: {}", what, name, err),
    ))
}

fn c_path(bytes: &[u8], display: &Path) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        SandboxError::Config(format!("path contains a NUL byte: {}", display.display()))
    })
}

fn open_dir(path: &Path) -> Result<DirFd> {
    let c = c_path(path.as_os_str().as_bytes(), path)?;
    let fd = unsafe { libc::open(c.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(last_error("open directory", &path));
    }
    Ok(DirFd(fd))
}

fn stat_at(parent: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(parent, name.as_ptr(), st.as_mut_ptr(), libc::AT_SYMLINK_NOFOLLOW)
    };
    if rc != 0 {
        return Err(last_error("fstatat", &name));
    }
    Ok(unsafe { st.assume_init() })
}

fn unlink_at(parent: RawFd, name: &CStr, flags: libc::c_int) -> Result<()> {
    if unsafe { libc::unlinkat(parent, name.as_ptr(), flags) } != 0 {
        return Err(last_error("unlinkat", &name));
    }
    Ok(())
}

fn open_child_dir(parent: RawFd, name: &CStr) -> Result<DirFd> {
    let mut fd = unsafe { libc::openat(parent, name.as_ptr(), DIR_FLAGS) };
    if fd < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EACCES) {
        // Payloads can create directories with mode 000; reopen after fixing it
        if unsafe { libc::fchmodat(parent, name.as_ptr(), 0o700, 0) } == 0 {
            fd = unsafe { libc::openat(parent, name.as_ptr(), DIR_FLAGS) };
        }
    }
    if fd < 0 {
        return Err(last_error("openat", &name));
    }
    Ok(DirFd(fd))
}

/// Names in a directory, `.` and `..` excluded
fn list_entries(dir: RawFd) -> Result<Vec<CString>> {
    let iter_fd = unsafe { libc::dup(dir) };
    if iter_fd < 0 {
        return Err(last_error("dup", &dir));
    }
    let stream = unsafe { libc::fdopendir(iter_fd) };
    if stream.is_null() {
        unsafe { libc::close(iter_fd) };
        return Err(last_error("fdopendir", &dir));
    }

    let mut names = Vec::new();
    let result = loop {
        unsafe { *libc::__errno_location() = 0 };
        let entry = unsafe { libc::readdir(stream) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            break if errno == 0 {
                Ok(())
            } else {
                Err(SandboxError::Io(std::io::Error::from_raw_os_error(errno)))
            };
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        if name.to_bytes() != b"." && name.to_bytes() != b".." {
            names.push(name.to_owned());
        }
    };
    unsafe { libc::closedir(stream) };
    result.map(|()| names)
}

fn empty_dir(dir: RawFd, device: libc::dev_t) -> Result<()> {
    for name in list_entries(dir)? {
        let st = stat_at(dir, &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != device {
                return Err(SandboxError::Mount(format!(
                    "refusing to descend into mount point {:?}",
                    name
                )));
            }
            let child = open_child_dir(dir, &name)?;
            empty_dir(child.0, device)?;
            drop(child);
            unlink_at(dir, &name, libc::AT_REMOVEDIR)?;
        } else {
            unlink_at(dir, &name, 0)?;
        }
    }
    Ok(())
}

/// Remove `path` and everything below it without following symlinks.
///
/// A missing path is not an error, so repeated calls are harmless.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }
    let parent = path.parent().ok_or_else(|| {
        SandboxError::Config(format!("cannot remove {}: no parent", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        SandboxError::Config(format!("cannot remove {}: no file name", path.display()))
    })?;
    let name = c_path(name.as_bytes(), path)?;

    let parent = open_dir(parent)?;
    let st = stat_at(parent.0, &name)?;
    if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
        return unlink_at(parent.0, &name, 0);
    }

    let dir = open_child_dir(parent.0, &name)?;
    empty_dir(dir.0, st.st_dev)?;
    drop(dir);
    unlink_at(parent.0, &name, libc::AT_REMOVEDIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::{symlink, PermissionsExt};

    #[test]
    fn removes_nested_tree() {
        let scratch = tempfile::tempdir().unwrap();
        let run = scratch.path().join("run");
        fs::create_dir_all(run.join("root/box/deep/er")).unwrap();
        fs::write(run.join("root/box/deep/er/file"), b"x").unwrap();
        fs::write(run.join("root/box/a.out"), b"y").unwrap();

        remove_tree_secure(&run).unwrap();
        assert!(!run.exists());
        // second call is a no-op
        remove_tree_secure(&run).unwrap();
    }

    #[test]
    fn symlinks_are_removed_not_followed() {
        let scratch = tempfile::tempdir().unwrap();
        let outside = scratch.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("keep"), b"keep").unwrap();

        let run = scratch.path().join("run");
        fs::create_dir(&run).unwrap();
        symlink(&outside, run.join("escape")).unwrap();

        remove_tree_secure(&run).unwrap();
        assert!(!run.exists());
        assert!(outside.join("keep").exists());
    }

    #[test]
    fn unreadable_directories_are_still_removed() {
        let scratch = tempfile::tempdir().unwrap();
        let run = scratch.path().join("run");
        let locked = run.join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("secret"), b"s").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        remove_tree_secure(&run).unwrap();
        assert!(!run.exists());
    }
}
