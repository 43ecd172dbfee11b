//! Cgroup backend abstraction.
//!
//! One backend instance governs exactly one run's cgroup; nothing in here is
//! shared between runs.

use crate::config::types::Result;
use std::path::Path;

/// Kernel-enforced ceilings for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupLimits {
    pub memory_bytes: Option<u64>,
    /// Task ceiling for the whole group, sandbox plumbing included
    pub pids_max: Option<u32>,
}

/// Per-run resource controller
pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    fn path(&self) -> &Path;
    fn attach_process(&self, pid: u32) -> Result<()>;
    /// Apply limits; returns the names of the controls that took effect
    fn apply_limits(&self, limits: &CgroupLimits) -> Result<Vec<String>>;
    fn memory_current(&self) -> Result<u64>;
    fn memory_peak(&self) -> Result<u64>;
    fn cpu_usage_usec(&self) -> Result<u64>;
    fn process_count(&self) -> Result<u32>;
    /// Host pids of the current members
    fn procs(&self) -> Result<Vec<i32>>;
    fn oom_kill_count(&self) -> Result<u64>;
    /// SIGKILL every member
    fn kill_all(&self) -> Result<()>;
    fn is_empty(&self) -> Result<bool>;
    fn remove(&self) -> Result<()>;
}
