/// Configuration loading: harness settings and batch manifests (JSON)
use crate::config::presets::{self, PolicyOverrides};
use crate::config::types::{ExecutionPolicy, Result, SandboxError, Submission};
use crate::safety::identity::IdRange;
use crate::verdict::Oracle;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Harness-wide settings. Nothing here is specific to one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Parent of every per-run working directory
    pub runtime_root: PathBuf,
    /// Delegated cgroup v2 subtree; one child group per run
    pub cgroup_root: PathBuf,
    /// Set to false to skip cgroups even when delegation is available
    pub use_cgroups: bool,
    /// Concurrent runs
    pub workers: usize,
    /// Submissions waiting for a worker before `submit` blocks
    pub queue_capacity: usize,
    /// Binary that implements `--internal-role proxy`; defaults to the current executable
    pub proxy_executable: Option<PathBuf>,
    /// How long the proxy may take to report the sandbox init pid
    pub setup_timeout_ms: u64,
    /// How long teardown waits for tracked processes to disappear
    pub teardown_timeout_ms: u64,
    /// Ids a root harness hands out, one per run. `null` makes every run use
    /// the policy's `sandbox_uid`/`sandbox_gid`.
    pub sandbox_ids: Option<IdRange>,
}

impl HarnessConfig {
    /// UID-scoped runtime root, so concurrent users never share run directories
    pub fn default_runtime_root() -> PathBuf {
        let euid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("probebox-uid-{}", euid))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: HarnessConfig = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        if config.workers == 0 {
            return Err(SandboxError::Config("workers must be at least 1".to_string()));
        }
        if config.sandbox_ids.is_some_and(|ids| ids.count == 0) {
            return Err(SandboxError::Config("sandbox_ids.count must be at least 1".to_string()));
        }
        log::info!("Loaded harness configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve the proxy binary, falling back to the running executable
    pub fn proxy_binary(&self) -> Result<PathBuf> {
        match &self.proxy_executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(SandboxError::Io),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            runtime_root: Self::default_runtime_root(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/probebox"),
            use_cgroups: true,
            workers: 4,
            queue_capacity: 64,
            proxy_executable: None,
            setup_timeout_ms: 10_000,
            teardown_timeout_ms: 3_000,
            sandbox_ids: Some(IdRange::default()),
        }
    }
}

/// How a case names its policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PolicySelector {
    /// A bare preset name
    Preset(String),
    /// A complete policy (must carry `name` and `wall_time_limit_ms`)
    Full(Box<ExecutionPolicy>),
    /// A preset plus field overrides
    Layered {
        #[serde(default)]
        preset: Option<String>,
        #[serde(default, flatten)]
        overrides: PolicyOverrides,
    },
}

impl PolicySelector {
    pub fn resolve(&self, fallback_preset: &str) -> Result<ExecutionPolicy> {
        match self {
            PolicySelector::Preset(name) => lookup_preset(name),
            PolicySelector::Layered { preset, overrides } => {
                let base = lookup_preset(preset.as_deref().unwrap_or(fallback_preset))?;
                Ok(overrides.apply(&base))
            }
            PolicySelector::Full(policy) => Ok((**policy).clone()),
        }
    }
}

pub fn lookup_preset(name: &str) -> Result<ExecutionPolicy> {
    presets::preset(name).ok_or_else(|| {
        SandboxError::Config(format!(
            "unknown policy preset '{}' (known: {})",
            name,
            presets::get_presets().names().join(", ")
        ))
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestDefaults {
    #[serde(default)]
    pub policy: Option<PolicySelector>,
}

/// One case of a batch manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestCase {
    pub name: String,
    pub language: String,
    pub source: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    /// Relative paths resolve against the manifest's directory
    #[serde(default)]
    pub stdin_file: Option<PathBuf>,
    #[serde(default)]
    pub policy: Option<PolicySelector>,
    pub oracle: Oracle,
}

/// Batch of submissions with their expected behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub defaults: ManifestDefaults,
    pub cases: Vec<ManifestCase>,
}

/// A manifest case resolved into runnable parts
#[derive(Debug, Clone)]
pub struct ResolvedCase {
    pub name: String,
    pub submission: Submission,
    pub policy: ExecutionPolicy,
    pub oracle: Oracle,
}

impl Manifest {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse manifest: {}", e)))
    }

    /// Load a manifest; relative sources resolve against its directory
    pub fn load(path: &Path) -> Result<Vec<ResolvedCase>> {
        let content = fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read manifest {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&content)?.resolve(base_dir)
    }

    pub fn resolve(&self, base_dir: &Path) -> Result<Vec<ResolvedCase>> {
        let mut resolved = Vec::with_capacity(self.cases.len());
        for case in &self.cases {
            let selector = case
                .policy
                .as_ref()
                .or(self.defaults.policy.as_ref())
                .cloned()
                .unwrap_or_else(|| PolicySelector::Preset("probe".to_string()));
            let policy = selector.resolve("probe").map_err(|e| {
                SandboxError::Config(format!("case '{}': {}", case.name, e))
            })?;

            let relative_to_manifest = |path: &PathBuf| {
                if path.is_absolute() {
                    path.clone()
                } else {
                    base_dir.join(path)
                }
            };

            resolved.push(ResolvedCase {
                name: case.name.clone(),
                submission: Submission {
                    language: case.language.clone(),
                    source: relative_to_manifest(&case.source),
                    args: case.args.clone(),
                    stdin: case.stdin.clone(),
                    stdin_file: case.stdin_file.as_ref().map(relative_to_manifest),
                },
                policy,
                oracle: case.oracle.clone(),
            });
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::NetworkMode;

    #[test]
    fn default_runtime_root_is_uid_scoped() {
        let root = HarnessConfig::default_runtime_root();
        let name = root.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("probebox-uid-"));
    }

    #[test]
    fn partial_harness_config_uses_defaults() {
        let config: HarnessConfig = serde_json::from_str(r#"{"workers": 2}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.queue_capacity, 64);
        assert!(config.use_cgroups);
        assert_eq!(config.sandbox_ids, Some(IdRange::default()));

        let shared: HarnessConfig = serde_json::from_str(r#"{"sandbox_ids": null}"#).unwrap();
        assert_eq!(shared.sandbox_ids, None);
    }

    #[test]
    fn empty_id_range_is_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("harness.json");
        fs::write(&path, r#"{"sandbox_ids": {"first": 60000, "count": 0}}"#).unwrap();
        assert!(HarnessConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn policy_selector_forms() {
        let preset: PolicySelector = serde_json::from_str(r#""loopback""#).unwrap();
        assert_eq!(preset.resolve("probe").unwrap().network, NetworkMode::Loopback);

        let layered: PolicySelector =
            serde_json::from_str(r#"{"preset":"probe","wall_time_limit_ms":3000}"#).unwrap();
        let policy = layered.resolve("judge").unwrap();
        assert_eq!(policy.wall_time_limit_ms, 3000);
        assert_eq!(policy.name, "probe+overrides");

        let full: PolicySelector =
            serde_json::from_str(r#"{"name":"mine","wall_time_limit_ms":1500}"#).unwrap();
        assert_eq!(full.resolve("probe").unwrap().name, "mine");

        let unknown: PolicySelector = serde_json::from_str(r#""nope""#).unwrap();
        assert!(unknown.resolve("probe").is_err());
    }

    #[test]
    fn manifest_resolves_relative_sources_and_defaults() {
        let manifest = Manifest::from_json(
            r#"{
                "defaults": {"policy": "judge"},
                "cases": [
                    {"name": "lis", "language": "cpp", "source": "lis.cpp",
                     "stdin_file": "lis.in",
                     "oracle": {"kind": "exact", "expected": "LIS length: 4\n"}},
                    {"name": "spin", "language": "c", "source": "/abs/timeout.c",
                     "args": ["infinite"],
                     "policy": {"preset": "probe", "wall_time_limit_ms": 3000},
                     "oracle": {"kind": "terminated"}}
                ]
            }"#,
        )
        .unwrap();

        let cases = manifest.resolve(Path::new("/probes")).unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].submission.source, PathBuf::from("/probes/lis.cpp"));
        assert_eq!(cases[0].policy.name, "judge");
        assert_eq!(cases[0].submission.stdin_file, Some(PathBuf::from("/probes/lis.in")));
        assert_eq!(cases[1].submission.stdin_file, None);
        assert_eq!(cases[1].submission.source, PathBuf::from("/abs/timeout.c"));
        assert_eq!(cases[1].submission.args, vec!["infinite".to_string()]);
        assert_eq!(cases[1].policy.wall_time_limit_ms, 3000);
    }
}
