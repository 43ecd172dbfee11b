/// Core types shared by every stage of a run
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Network reachability granted to the sandboxed process
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Fresh network namespace with every interface down
    #[default]
    None,
    /// Fresh network namespace with only `lo` brought up
    Loopback,
    /// Host network stack
    Unrestricted,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Loopback => write!(f, "loopback"),
            NetworkMode::Unrestricted => write!(f, "unrestricted"),
        }
    }
}

/// Access granted to one allow-listed host path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathAccess {
    ReadOnly,
    ReadWrite,
}

/// One entry of the filesystem allow-list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    /// Absolute host path, mounted at the same location inside the sandbox
    pub path: PathBuf,
    pub access: PathAccess,
    /// Skip silently when the host path does not exist
    #[serde(default)]
    pub optional: bool,
}

impl PathRule {
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            access: PathAccess::ReadOnly,
            optional: false,
        }
    }

    pub fn optional(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            access: PathAccess::ReadOnly,
            optional: true,
        }
    }

    pub fn read_write(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            access: PathAccess::ReadWrite,
            optional: false,
        }
    }

    /// Parse the CLI form `PATH[:ro|rw][,optional]`
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let (path, options) = match spec.split_once(':') {
            Some((path, options)) => (path, options),
            None => (spec, ""),
        };
        if path.is_empty() {
            return Err(format!("empty path in allow-list entry '{}'", spec));
        }

        let mut rule = PathRule::read_only(path);
        for option in options.split(',') {
            match option.trim() {
                "ro" => rule.access = PathAccess::ReadOnly,
                "rw" => rule.access = PathAccess::ReadWrite,
                "optional" | "maybe" => rule.optional = true,
                "" => {}
                other => return Err(format!("unknown allow-list option '{}'", other)),
            }
        }
        Ok(rule)
    }
}

/// Filesystem view of the sandbox
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    /// Host paths visible inside the sandbox besides the private working directory
    pub allow: Vec<PathRule>,
    /// Mount a fresh procfs for the sandbox pid namespace
    #[serde(default)]
    pub mount_proc: bool,
    /// Size of the private tmpfs mounted at /tmp; `None` leaves /tmp absent
    #[serde(default)]
    pub tmpfs_bytes: Option<u64>,
}

impl Default for FilesystemPolicy {
    fn default() -> Self {
        Self {
            allow: vec![
                PathRule::read_only("/bin"),
                PathRule::read_only("/usr"),
                PathRule::optional("/lib"),
                PathRule::optional("/lib64"),
                PathRule::optional("/lib32"),
            ],
            mount_proc: false,
            tmpfs_bytes: Some(16 * 1024 * 1024),
        }
    }
}

/// Limits and access rules applied to exactly one run.
///
/// A policy is frozen before the run starts and is only ever read afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Preset name this policy was derived from (or "custom")
    pub name: String,
    pub wall_time_limit_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default)]
    pub cpu_time_limit_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
    /// Submission process plus every descendant (and thread) alive at once
    #[serde(default)]
    pub max_processes: Option<u32>,
    #[serde(default)]
    pub filesystem: FilesystemPolicy,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub syscall_deny_list: Vec<String>,
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
    #[serde(default)]
    pub max_file_size_bytes: Option<u64>,
    #[serde(default)]
    pub max_open_files: Option<u64>,
    #[serde(default)]
    pub stack_limit_bytes: Option<u64>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_sandbox_id")]
    pub sandbox_uid: u32,
    #[serde(default = "default_sandbox_id")]
    pub sandbox_gid: u32,
    /// Refuse to run when memory/process limits cannot be kernel-enforced
    #[serde(default)]
    pub require_hard_limits: bool,
}

fn default_grace_period_ms() -> u64 {
    1000
}

fn default_sample_interval_ms() -> u64 {
    100
}

fn default_output_limit_bytes() -> usize {
    1024 * 1024
}

fn default_sandbox_id() -> u32 {
    65534
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            name: "custom".to_string(),
            wall_time_limit_ms: 10_000,
            grace_period_ms: default_grace_period_ms(),
            sample_interval_ms: default_sample_interval_ms(),
            cpu_time_limit_ms: Some(5_000),
            memory_limit_bytes: Some(512 * 1024 * 1024),
            max_processes: Some(16),
            filesystem: FilesystemPolicy::default(),
            network: NetworkMode::None,
            syscall_deny_list: Vec::new(),
            output_limit_bytes: default_output_limit_bytes(),
            max_file_size_bytes: Some(16 * 1024 * 1024),
            max_open_files: Some(64),
            stack_limit_bytes: Some(8 * 1024 * 1024),
            environment: BTreeMap::new(),
            sandbox_uid: default_sandbox_id(),
            sandbox_gid: default_sandbox_id(),
            require_hard_limits: false,
        }
    }
}

impl ExecutionPolicy {
    /// Stable fingerprint of every field, used to correlate repeated runs
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};

        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// One program to run, as accepted from the caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Language tag resolved through the runner registry
    pub language: String,
    /// Source file, or prebuilt executable for the `native` runner
    pub source: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    /// Host file fed to stdin instead of `stdin`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_file: Option<PathBuf>,
}

impl Submission {
    pub fn new(language: impl Into<String>, source: impl AsRef<Path>) -> Self {
        Self {
            language: language.into(),
            source: source.as_ref().to_path_buf(),
            args: Vec::new(),
            stdin: None,
            stdin_file: None,
        }
    }

    /// What the payload reads on stdin, loading `stdin_file` if set
    pub fn stdin_data(&self) -> std::result::Result<Option<String>, RunError> {
        match (&self.stdin, &self.stdin_file) {
            (Some(_), Some(_)) => Err(RunError::InvalidSubmission(
                "stdin and stdin_file are mutually exclusive".to_string(),
            )),
            (Some(data), None) => Ok(Some(data.clone())),
            (None, Some(path)) => std::fs::read_to_string(path).map(Some).map_err(|e| {
                RunError::InvalidSubmission(format!(
                    "cannot read stdin file {}: {}",
                    path.display(),
                    e
                ))
            }),
            (None, None) => Ok(None),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_stdin_file(mut self, path: impl AsRef<Path>) -> Self {
        self.stdin_file = Some(path.as_ref().to_path_buf());
        self
    }
}

/// Why a run ended. Exactly one per run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationCause {
    Normal,
    TimedOut,
    MemoryExceeded,
    CpuExceeded,
    Signaled { signal: i32 },
    PolicyViolation { detail: String },
}

impl TerminationCause {
    /// True for the causes the harness itself imposes on a runaway program
    pub fn is_limit_breach(&self) -> bool {
        matches!(
            self,
            TerminationCause::TimedOut
                | TerminationCause::MemoryExceeded
                | TerminationCause::CpuExceeded
        )
    }

    pub fn kind(&self) -> CauseKind {
        match self {
            TerminationCause::Normal => CauseKind::Normal,
            TerminationCause::TimedOut => CauseKind::TimedOut,
            TerminationCause::MemoryExceeded => CauseKind::MemoryExceeded,
            TerminationCause::CpuExceeded => CauseKind::CpuExceeded,
            TerminationCause::Signaled { .. } => CauseKind::Signaled,
            TerminationCause::PolicyViolation { .. } => CauseKind::PolicyViolation,
        }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::Normal => write!(f, "normal exit"),
            TerminationCause::TimedOut => write!(f, "wall-clock limit exceeded"),
            TerminationCause::MemoryExceeded => write!(f, "memory limit exceeded"),
            TerminationCause::CpuExceeded => write!(f, "CPU-time limit exceeded"),
            TerminationCause::Signaled { signal } => write!(f, "killed by signal {}", signal),
            TerminationCause::PolicyViolation { detail } => {
                write!(f, "policy violation: {}", detail)
            }
        }
    }
}

/// Payload-free discriminant of [`TerminationCause`], used by oracles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseKind {
    Normal,
    TimedOut,
    MemoryExceeded,
    CpuExceeded,
    Signaled,
    PolicyViolation,
}

impl fmt::Display for CauseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CauseKind::Normal => "normal",
            CauseKind::TimedOut => "timed_out",
            CauseKind::MemoryExceeded => "memory_exceeded",
            CauseKind::CpuExceeded => "cpu_exceeded",
            CauseKind::Signaled => "signaled",
            CauseKind::PolicyViolation => "policy_violation",
        };
        write!(f, "{}", name)
    }
}

/// Output integrity classification for one captured stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputIntegrity {
    /// Stream reached EOF within the cap
    Complete,
    /// Stream exceeded the cap and was cut
    Truncated,
    /// Reading the pipe failed
    WriteError,
}

impl fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::Truncated => write!(f, "truncated"),
            OutputIntegrity::WriteError => write!(f, "write_error"),
        }
    }
}

/// Which controls the kernel enforced for a run and which fell back
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementReport {
    pub applied: Vec<String>,
    pub degraded: Vec<String>,
}

/// Outcome of the compile stage, when the language has one
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSummary {
    pub exit_code: Option<i32>,
    pub cause: TerminationCause,
    pub wall_time_ms: u64,
    pub diagnostics: String,
}

/// Structured result of one run. Produced once, never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub exit_code: Option<i32>,
    pub cause: TerminationCause,
    pub stdout: String,
    pub stderr: String,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub policy_name: String,
    pub policy_digest: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub enforcement: EnforcementReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<CompileSummary>,
}

/// Error taxonomy exposed to callers through [`crate::verdict::Verdict`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSubmission,
    SetupFailed,
    SpawnFailed,
    CompileFailed,
    InternalMonitorFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidSubmission => "InvalidSubmission",
            ErrorKind::SetupFailed => "SetupFailed",
            ErrorKind::SpawnFailed => "SpawnFailed",
            ErrorKind::CompileFailed => "CompileFailed",
            ErrorKind::InternalMonitorFailure => "InternalMonitorFailure",
        };
        write!(f, "{}", name)
    }
}

/// Low-level failures raised by the kernel-facing modules
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Status channel error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Protocol(err.to_string())
    }
}

/// Run-level failures. None of these is a judgement on the program itself.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("sandbox setup failed: {0}")]
    SetupFailed(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("compilation failed: {}", .0.diagnostics.lines().next().unwrap_or("no diagnostics"))]
    CompileFailed(Box<CompileSummary>),

    #[error("internal monitor failure: {0}")]
    InternalMonitorFailure(String),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::InvalidSubmission(_) => ErrorKind::InvalidSubmission,
            RunError::SetupFailed(_) => ErrorKind::SetupFailed,
            RunError::SpawnFailed(_) => ErrorKind::SpawnFailed,
            RunError::CompileFailed(_) => ErrorKind::CompileFailed,
            RunError::InternalMonitorFailure(_) => ErrorKind::InternalMonitorFailure,
        }
    }
}

impl From<SandboxError> for RunError {
    fn from(err: SandboxError) -> Self {
        RunError::SetupFailed(err.to_string())
    }
}

/// Conditions that stop the harness from starting at all
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("isolation unavailable on this host: {0}")]
    IsolationUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
