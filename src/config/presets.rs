/// Named execution policy presets
///
/// Presets are immutable templates. A run derives its policy from one preset,
/// optionally layers [`PolicyOverrides`] on top, and freezes the result.
use crate::config::types::{ExecutionPolicy, FilesystemPolicy, NetworkMode, PathRule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Syscalls denied to adversarial probes. `execve` stays callable exactly once
/// for the payload image itself; every later attempt is refused.
pub const PROBE_DENY_LIST: &[&str] = &[
    "chmod",
    "fchmod",
    "fchmodat",
    "execve",
    "execveat",
    "ptrace",
    "mount",
    "umount2",
    "pivot_root",
    "chroot",
    "unshare",
    "setns",
    "kexec_load",
    "init_module",
    "finit_module",
    "delete_module",
    "bpf",
    "perf_event_open",
    "keyctl",
    "add_key",
    "request_key",
    "reboot",
    "swapon",
    "swapoff",
];

/// Deny-list for toolchains: they fork and exec helpers and chmod their output.
pub const TOOLCHAIN_DENY_LIST: &[&str] = &[
    "ptrace",
    "mount",
    "umount2",
    "pivot_root",
    "chroot",
    "unshare",
    "setns",
    "kexec_load",
    "init_module",
    "finit_module",
    "delete_module",
    "bpf",
    "perf_event_open",
    "reboot",
    "swapon",
    "swapoff",
];

const MB: u64 = 1024 * 1024;

fn deny(list: &[&str]) -> Vec<String> {
    list.iter().map(|name| name.to_string()).collect()
}

/// Registry of named presets
pub struct PolicyPresets {
    presets: BTreeMap<String, ExecutionPolicy>,
}

impl PolicyPresets {
    pub fn new() -> Self {
        let mut presets = Self {
            presets: BTreeMap::new(),
        };
        presets.register(probe());
        presets.register(judge());
        presets.register(loopback());
        presets.register(compile());
        presets.register(jvm());
        presets
    }

    fn register(&mut self, policy: ExecutionPolicy) {
        self.presets.insert(policy.name.clone(), policy);
    }

    pub fn get(&self, name: &str) -> Option<&ExecutionPolicy> {
        self.presets.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.presets.keys().map(String::as_str).collect()
    }

    pub fn list(&self) -> Vec<&ExecutionPolicy> {
        self.presets.values().collect()
    }
}

impl Default for PolicyPresets {
    fn default() -> Self {
        Self::new()
    }
}

static PRESETS: OnceLock<PolicyPresets> = OnceLock::new();

/// Shared read-only preset registry
pub fn get_presets() -> &'static PolicyPresets {
    PRESETS.get_or_init(PolicyPresets::new)
}

/// Resolve a preset by name, cloning it so the caller can specialise it
pub fn preset(name: &str) -> Option<ExecutionPolicy> {
    get_presets().get(name).cloned()
}

/// Adversarial probes: no network, tight memory and process ceilings.
fn probe() -> ExecutionPolicy {
    ExecutionPolicy {
        name: "probe".to_string(),
        wall_time_limit_ms: 10_000,
        cpu_time_limit_ms: Some(5_000),
        memory_limit_bytes: Some(128 * MB),
        max_processes: Some(8),
        syscall_deny_list: deny(PROBE_DENY_LIST),
        ..ExecutionPolicy::default()
    }
}

/// Algorithm fixtures: single process, judge-style limits.
fn judge() -> ExecutionPolicy {
    ExecutionPolicy {
        name: "judge".to_string(),
        wall_time_limit_ms: 5_000,
        cpu_time_limit_ms: Some(2_000),
        memory_limit_bytes: Some(256 * MB),
        max_processes: Some(1),
        syscall_deny_list: deny(PROBE_DENY_LIST),
        ..ExecutionPolicy::default()
    }
}

fn loopback() -> ExecutionPolicy {
    ExecutionPolicy {
        name: "loopback".to_string(),
        network: NetworkMode::Loopback,
        ..probe()
    }
}

/// Compiler invocations inside the run directory.
fn compile() -> ExecutionPolicy {
    let mut filesystem = FilesystemPolicy::default();
    filesystem.allow.push(PathRule::optional("/etc/alternatives"));
    filesystem.tmpfs_bytes = Some(256 * MB);

    ExecutionPolicy {
        name: "compile".to_string(),
        wall_time_limit_ms: 45_000,
        cpu_time_limit_ms: Some(30_000),
        memory_limit_bytes: Some(768 * MB),
        max_processes: Some(64),
        filesystem,
        syscall_deny_list: deny(TOOLCHAIN_DENY_LIST),
        max_file_size_bytes: Some(64 * MB),
        max_open_files: Some(256),
        environment: BTreeMap::from([("TMPDIR".to_string(), "/tmp".to_string())]),
        ..ExecutionPolicy::default()
    }
}

/// JVM runtime: thread-heavy and reads /proc/self.
fn jvm() -> ExecutionPolicy {
    let mut filesystem = FilesystemPolicy::default();
    filesystem.allow.push(PathRule::optional("/etc/alternatives"));
    filesystem.allow.push(PathRule::optional("/etc/java-17-openjdk"));
    filesystem.allow.push(PathRule::optional("/etc/java-21-openjdk"));
    filesystem.mount_proc = true;
    filesystem.tmpfs_bytes = Some(64 * MB);

    ExecutionPolicy {
        name: "jvm".to_string(),
        wall_time_limit_ms: 15_000,
        cpu_time_limit_ms: Some(10_000),
        memory_limit_bytes: Some(1024 * MB),
        max_processes: Some(256),
        filesystem,
        syscall_deny_list: deny(TOOLCHAIN_DENY_LIST),
        max_open_files: Some(256),
        ..ExecutionPolicy::default()
    }
}

/// Optional per-field adjustments layered over a preset
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    pub wall_time_limit_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub sample_interval_ms: Option<u64>,
    pub cpu_time_limit_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub max_processes: Option<u32>,
    pub network: Option<NetworkMode>,
    pub syscall_deny_list: Option<Vec<String>>,
    /// Appended to the preset allow-list
    #[serde(default)]
    pub extra_paths: Vec<PathRule>,
    pub mount_proc: Option<bool>,
    pub output_limit_bytes: Option<usize>,
    pub max_file_size_bytes: Option<u64>,
    pub max_open_files: Option<u64>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub require_hard_limits: Option<bool>,
}

impl PolicyOverrides {
    pub fn is_empty(&self) -> bool {
        *self == PolicyOverrides::default()
    }

    /// Produce a new policy; the input is left untouched
    pub fn apply(&self, base: &ExecutionPolicy) -> ExecutionPolicy {
        let mut policy = base.clone();
        if let Some(v) = self.wall_time_limit_ms {
            policy.wall_time_limit_ms = v;
        }
        if let Some(v) = self.grace_period_ms {
            policy.grace_period_ms = v;
        }
        if let Some(v) = self.sample_interval_ms {
            policy.sample_interval_ms = v;
        }
        if let Some(v) = self.cpu_time_limit_ms {
            policy.cpu_time_limit_ms = Some(v);
        }
        if let Some(v) = self.memory_limit_bytes {
            policy.memory_limit_bytes = Some(v);
        }
        if let Some(v) = self.max_processes {
            policy.max_processes = Some(v);
        }
        if let Some(v) = self.network {
            policy.network = v;
        }
        if let Some(list) = &self.syscall_deny_list {
            policy.syscall_deny_list = list.clone();
        }
        policy
            .filesystem
            .allow
            .extend(self.extra_paths.iter().cloned());
        if let Some(v) = self.mount_proc {
            policy.filesystem.mount_proc = v;
        }
        if let Some(v) = self.output_limit_bytes {
            policy.output_limit_bytes = v;
        }
        if let Some(v) = self.max_file_size_bytes {
            policy.max_file_size_bytes = Some(v);
        }
        if let Some(v) = self.max_open_files {
            policy.max_open_files = Some(v);
        }
        policy.environment.extend(
            self.environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if let Some(v) = self.require_hard_limits {
            policy.require_hard_limits = v;
        }
        if !self.is_empty() && !policy.name.ends_with("+overrides") {
            policy.name = format!("{}+overrides", policy.name);
        }
        policy
    }
}
