/// Cgroup v2 backend
///
/// Each run gets `<root>/<run_id>`. The root must be a delegated subtree the
/// harness can write to; controllers are enabled on it best-effort.
use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::backend::{CgroupBackend, CgroupLimits};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const CONTROLLERS: [&str; 3] = ["memory", "pids", "cpu"];

/// Cgroup v2 group for one run
pub struct CgroupV2 {
    path: PathBuf,
}

impl CgroupV2 {
    /// Create the run group under `root`, enabling controllers on the way.
    pub fn create(root: &Path, run_id: &str) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            SandboxError::Cgroup(format!(
                "Failed to create cgroup root {}: {}",
                root.display(),
                e
            ))
        })?;

        if let Some(parent) = root.parent() {
            enable_controllers(parent);
        }
        enable_controllers(root);

        let path = root.join(run_id);
        fs::create_dir(&path).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        Ok(Self { path })
    }

    /// Wrap an existing group (used by tests and teardown retries)
    pub fn open(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self, file: &str) -> Result<String> {
        fs::read_to_string(self.path.join(file)).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to read {}: {}", file, e))
        })
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(file), value).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to write {}={}: {}", file, value, e))
        })
    }

    fn read_u64(&self, file: &str) -> Result<u64> {
        let content = self.read(file)?;
        content
            .trim()
            .parse::<u64>()
            .map_err(|e| SandboxError::Cgroup(format!("Failed to parse {}: {}", file, e)))
    }
}

/// Best-effort `+controller` writes; each one may fail independently.
fn enable_controllers(dir: &Path) {
    let control = dir.join("cgroup.subtree_control");
    for controller in CONTROLLERS {
        if let Err(e) = fs::write(&control, format!("+{}", controller)) {
            log::debug!(
                "Could not enable {} in {}: {}",
                controller,
                control.display(),
                e
            );
        }
    }
}

/// Value of `key` in a flat-keyed file such as cpu.stat or memory.events
pub fn parse_flat_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn attach_process(&self, pid: u32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    fn apply_limits(&self, limits: &CgroupLimits) -> Result<Vec<String>> {
        let mut applied = Vec::new();

        if let Some(bytes) = limits.memory_bytes {
            self.write("memory.max", &bytes.to_string())?;
            applied.push("cgroup_memory_max".to_string());

            if self.path.join("memory.swap.max").exists() {
                match self.write("memory.swap.max", "0") {
                    Ok(()) => applied.push("cgroup_swap_max".to_string()),
                    Err(e) => log::warn!("{}", e),
                }
            }
            if self.path.join("memory.oom.group").exists() {
                match self.write("memory.oom.group", "1") {
                    Ok(()) => applied.push("cgroup_oom_group".to_string()),
                    Err(e) => log::warn!("{}", e),
                }
            }
        }

        if let Some(max) = limits.pids_max {
            self.write("pids.max", &max.to_string())?;
            applied.push("cgroup_pids_max".to_string());
        }

        Ok(applied)
    }

    fn memory_current(&self) -> Result<u64> {
        self.read_u64("memory.current")
    }

    /// memory.peak (5.19+) with a fallback to memory.current
    fn memory_peak(&self) -> Result<u64> {
        if self.path.join("memory.peak").exists() {
            return self.read_u64("memory.peak");
        }
        self.memory_current()
    }

    fn cpu_usage_usec(&self) -> Result<u64> {
        let content = self.read("cpu.stat")?;
        parse_flat_keyed(&content, "usage_usec")
            .ok_or_else(|| SandboxError::Cgroup("cpu.stat has no usage_usec".to_string()))
    }

    fn process_count(&self) -> Result<u32> {
        if self.path.join("pids.current").exists() {
            return Ok(self.read_u64("pids.current")? as u32);
        }
        let procs = self.read("cgroup.procs")?;
        Ok(procs.lines().filter(|l| !l.trim().is_empty()).count() as u32)
    }

    fn procs(&self) -> Result<Vec<i32>> {
        Ok(self
            .read("cgroup.procs")?
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    fn oom_kill_count(&self) -> Result<u64> {
        if !self.path.join("memory.events").exists() {
            return Ok(0);
        }
        let content = self.read("memory.events")?;
        Ok(parse_flat_keyed(&content, "oom_kill").unwrap_or(0))
    }

    fn kill_all(&self) -> Result<()> {
        // cgroup.kill (5.14+) is atomic with respect to forks
        if self.path.join("cgroup.kill").exists() {
            return self.write("cgroup.kill", "1");
        }
        for pid in self.procs()? {
            crate::kernel::signal::signal_process(pid, nix::sys::signal::Signal::SIGKILL);
        }
        Ok(())
    }

    fn is_empty(&self) -> Result<bool> {
        if let Ok(events) = self.read("cgroup.events") {
            if let Some(populated) = parse_flat_keyed(&events, "populated") {
                return Ok(populated == 0);
            }
        }
        Ok(self.read("cgroup.procs")?.trim().is_empty())
    }

    /// rmdir, retried while the last members finish exiting
    fn remove(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_millis(1000);
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    return Err(SandboxError::Cgroup(format!(
                        "Failed to remove cgroup {}: {}",
                        self.path.display(),
                        e
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Regular directories stand in for cgroupfs: the interface files are
    // plain text, so reads and writes behave the same.
    fn fake_group() -> (tempfile::TempDir, CgroupV2) {
        let root = tempfile::tempdir().unwrap();
        let group = CgroupV2::create(root.path(), "run-1").unwrap();
        (root, group)
    }

    #[test]
    fn group_lives_under_root() {
        let (root, group) = fake_group();
        assert_eq!(group.path(), root.path().join("run-1"));
        assert!(group.path().is_dir());
    }

    #[test]
    fn limits_are_written_and_reported() {
        let (_root, group) = fake_group();
        fs::write(group.path().join("memory.oom.group"), "0").unwrap();

        let applied = group
            .apply_limits(&CgroupLimits {
                memory_bytes: Some(64 * 1024 * 1024),
                pids_max: Some(10),
            })
            .unwrap();

        assert_eq!(
            fs::read_to_string(group.path().join("memory.max")).unwrap(),
            "67108864"
        );
        assert_eq!(fs::read_to_string(group.path().join("pids.max")).unwrap(), "10");
        assert_eq!(
            fs::read_to_string(group.path().join("memory.oom.group")).unwrap(),
            "1"
        );
        assert!(applied.contains(&"cgroup_memory_max".to_string()));
        assert!(applied.contains(&"cgroup_oom_group".to_string()));
        assert!(!applied.contains(&"cgroup_swap_max".to_string()));
    }

    #[test]
    fn accounting_files_are_parsed() {
        let (_root, group) = fake_group();
        fs::write(group.path().join("memory.current"), "4096\n").unwrap();
        fs::write(
            group.path().join("cpu.stat"),
            "usage_usec 1500000\nuser_usec 1000000\nsystem_usec 500000\n",
        )
        .unwrap();
        fs::write(
            group.path().join("memory.events"),
            "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n",
        )
        .unwrap();

        assert_eq!(group.memory_current().unwrap(), 4096);
        assert_eq!(group.memory_peak().unwrap(), 4096);
        assert_eq!(group.cpu_usage_usec().unwrap(), 1_500_000);
        assert_eq!(group.oom_kill_count().unwrap(), 1);
    }

    #[test]
    fn peak_prefers_memory_peak() {
        let (_root, group) = fake_group();
        fs::write(group.path().join("memory.current"), "10").unwrap();
        fs::write(group.path().join("memory.peak"), "99").unwrap();
        assert_eq!(group.memory_peak().unwrap(), 99);
    }

    #[test]
    fn emptiness_follows_cgroup_events() {
        let (_root, group) = fake_group();
        fs::write(group.path().join("cgroup.events"), "populated 1\nfrozen 0\n").unwrap();
        assert!(!group.is_empty().unwrap());
        fs::write(group.path().join("cgroup.events"), "populated 0\nfrozen 0\n").unwrap();
        assert!(group.is_empty().unwrap());
    }

    #[test]
    fn flat_keyed_lookup_ignores_other_keys() {
        assert_eq!(parse_flat_keyed("oom 2\noom_kill 5\n", "oom_kill"), Some(5));
        assert_eq!(parse_flat_keyed("oom 2\n", "oom_kill"), None);
    }

    #[test]
    fn member_pids_are_listed() {
        let (_root, group) = fake_group();
        fs::write(group.path().join("cgroup.procs"), "101\n102\n\n").unwrap();
        assert_eq!(group.procs().unwrap(), vec![101, 102]);
        assert_eq!(group.process_count().unwrap(), 2);
    }

    #[test]
    fn remove_of_missing_group_is_ok() {
        let group = CgroupV2::open(PathBuf::from("/nonexistent/probebox/run"));
        assert!(group.remove().is_ok());
    }
}
