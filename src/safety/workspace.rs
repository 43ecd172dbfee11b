/// Run-scoped working directories
///
/// Layout of one run:
///   <runtime_root>/<run_id>/          mode 0700, owned by the harness
///   <runtime_root>/<run_id>/root/     becomes `/` inside the sandbox
///   <runtime_root>/<run_id>/root/box  the payload's private working directory
///
/// Nothing outside the run directory is ever written, and the directory is
/// removed when the run ends.
use crate::config::types::{Result, SandboxError};
use crate::kernel::mount::BOX_DIR;
use crate::safety::safe_cleanup;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Private directory tree for one run
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
    root_dir: PathBuf,
    removed: bool,
}

fn create_dir(path: &Path, mode: u32) -> Result<()> {
    fs::DirBuilder::new().mode(mode).create(path).map_err(|e| {
        SandboxError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to create {}: {}", path.display(), e),
        ))
    })?;
    // DirBuilder's mode is filtered by the umask
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

impl Workspace {
    /// Create the directories for `run_id` under `runtime_root`
    pub fn create(runtime_root: &Path, run_id: &str) -> Result<Self> {
        if !runtime_root.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(runtime_root)?;
        }

        let run_dir = runtime_root.join(run_id);
        create_dir(&run_dir, 0o700)?;
        let workspace = Self {
            run_id: run_id.to_string(),
            root_dir: run_dir.join("root"),
            run_dir,
            removed: false,
        };
        // The root must be traversable by the sandbox uid
        create_dir(&workspace.root_dir, 0o755)?;
        create_dir(&workspace.box_dir(), 0o755)?;
        Ok(workspace)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Host path that becomes the sandbox root
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Host path of `/box`
    pub fn box_dir(&self) -> PathBuf {
        self.root_dir.join(BOX_DIR.trim_start_matches('/'))
    }

    /// Copy `source` into `/box/<name>` with `mode`; returns the path the
    /// payload sees.
    pub fn stage_file(&self, source: &Path, name: &str, mode: u32) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SandboxError::Config(format!("invalid staged file name '{}'", name)));
        }
        let target = self.box_dir().join(name);
        fs::copy(source, &target).map_err(|e| {
            SandboxError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to stage {}: {}", source.display(), e),
            ))
        })?;
        fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        Ok(Path::new(BOX_DIR).join(name))
    }

    /// Host path of a file the payload sees at `/box/<name>`
    pub fn box_file(&self, name: &str) -> PathBuf {
        self.box_dir().join(name)
    }

    /// Delete the run directory. Idempotent.
    pub fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        safe_cleanup::remove_tree_secure(&self.run_dir)?;
        self.removed = true;
        Ok(())
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            log::warn!(
                "Failed to remove run directory {}: {}",
                self.run_dir.display(),
                e
            );
        }
    }
}

/// Remove run directories older than `max_age` left behind by a crashed harness
pub fn sweep_stale(runtime_root: &Path, max_age: Duration) -> Result<usize> {
    let entries = match fs::read_dir(runtime_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        let stale = now
            .duration_since(modified)
            .map(|age| age > max_age)
            .unwrap_or(false);
        if !stale || !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        match safe_cleanup::remove_tree_secure(&path) {
            Ok(()) => {
                log::info!("Removed stale run directory {}", path.display());
                removed += 1;
            }
            Err(e) => log::warn!("Failed to remove stale {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}
