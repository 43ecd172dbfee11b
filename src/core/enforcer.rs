//! Policy enforcer: turns a validated policy into the isolation handles of
//! one run.
//!
//! `prepare` creates the run-scoped context (id, working directory, process
//! arena). `arm` then creates the kernel-side controls for one stage of that
//! run. Controls the host cannot provide are recorded as degraded, unless the
//! policy demands hard limits, in which case the run fails with
//! `SetupFailed` rather than running with weaker enforcement.
use crate::config::loader::HarnessConfig;
use crate::config::types::{EnforcementReport, ExecutionPolicy, NetworkMode, RunError, Submission};
use crate::config::validator::validate_policy;
use crate::core::types::ProcessArena;
use crate::kernel::cgroup::{CgroupBackend, CgroupLimits, CgroupV2};
use crate::kernel::host::HostCapabilities;
use crate::kernel::namespace::NamespacePlan;
use crate::observability::audit;
use crate::safety::identity::{IdentityLease, IdentityPool};
use crate::safety::workspace::Workspace;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything one run owns. Dropping it removes the working directory.
pub struct RunContext {
    pub run_id: String,
    pub workspace: Workspace,
    pub arena: Arc<ProcessArena>,
    pub harness_is_root: bool,
    /// Run-private sandbox uid/gid, held until the context is dropped
    pub identity: Option<IdentityLease>,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    /// No other process on the host runs as the payload's uid. Without a
    /// cgroup, RLIMIT_NPROC only bounds this run when that holds.
    pub fn private_identity(&self) -> bool {
        !self.harness_is_root || self.identity.is_some()
    }
}

/// Controls created for one stage (compile or run) of a run
pub struct ArmedStage {
    pub label: &'static str,
    pub policy: Arc<ExecutionPolicy>,
    pub cgroup: Option<Arc<dyn CgroupBackend>>,
    /// RLIMIT_NPROC may stand in for pids.max
    pub nproc_fallback: bool,
    pub enforcement: EnforcementReport,
}

impl ArmedStage {
    /// Memory and process ceilings are kernel-enforced by the cgroup
    pub fn cgroup_enforced(&self) -> bool {
        self.cgroup.is_some()
    }

    /// The process ceiling lost its cgroup. Falls back to RLIMIT_NPROC when
    /// the payload's uid is private to the run, otherwise records the
    /// ceiling as not enforced.
    pub fn degrade_process_limit(&mut self, run_id: &str, reason: &str) -> Result<(), RunError> {
        let reason = if self.nproc_fallback {
            format!("{}; using RLIMIT_NPROC", reason)
        } else {
            format!("{}; sandbox uid is shared, process count is not enforced", reason)
        };
        self.degrade(run_id, "max_processes", &reason)
    }

    /// Record a control that fell back after arming
    pub fn degrade(&mut self, run_id: &str, control: &str, reason: &str) -> Result<(), RunError> {
        if self.policy.require_hard_limits {
            return Err(RunError::SetupFailed(format!(
                "{} cannot be enforced: {}",
                control, reason
            )));
        }
        log::warn!("[{}] {} degraded: {}", run_id, control, reason);
        audit::control_degraded(run_id, control, reason);
        self.enforcement.degraded.push(format!("{}: {}", control, reason));
        Ok(())
    }

    /// Remove the stage cgroup. Only call once its members are gone.
    pub fn release(&mut self) -> Option<String> {
        let cgroup = self.cgroup.take()?;
        cgroup
            .remove()
            .err()
            .map(|e| format!("cgroup {}: {}", cgroup.path().display(), e))
    }
}

impl Drop for ArmedStage {
    fn drop(&mut self) {
        if let Some(error) = self.release() {
            log::warn!("{}", error);
        }
    }
}

/// Builds isolated contexts against one host
pub struct PolicyEnforcer {
    host: HostCapabilities,
    runtime_root: PathBuf,
    cgroup_root: PathBuf,
    use_cgroups: bool,
    identities: Option<Arc<IdentityPool>>,
}

impl PolicyEnforcer {
    pub fn new(config: &HarnessConfig, host: HostCapabilities) -> Self {
        Self {
            host,
            runtime_root: config.runtime_root.clone(),
            cgroup_root: config.cgroup_root.clone(),
            use_cgroups: config.use_cgroups,
            identities: config.sandbox_ids.map(IdentityPool::new),
        }
    }

    pub fn host(&self) -> &HostCapabilities {
        &self.host
    }

    /// Check the policy and the host, then create the run's private
    /// working directory.
    pub fn prepare(
        &self,
        submission: &Submission,
        policy: &ExecutionPolicy,
    ) -> Result<RunContext, RunError> {
        let validation = validate_policy(policy);
        for warning in &validation.warnings {
            log::warn!("policy '{}': {}", policy.name, warning);
        }
        if !validation.is_valid() {
            return Err(RunError::InvalidSubmission(format!(
                "policy '{}' rejected: {}",
                policy.name,
                validation.errors.join("; ")
            )));
        }

        if let Some(gap) = self.host.isolation_gap() {
            return Err(RunError::SetupFailed(gap));
        }
        if !policy.syscall_deny_list.is_empty() && !self.host.seccomp {
            return Err(RunError::SetupFailed(
                "syscall deny-list requested but seccomp is unavailable".to_string(),
            ));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let identity = match (&self.identities, self.host.is_root) {
            (Some(pool), true) => {
                let lease = pool.lease();
                if lease.is_none() {
                    log::warn!(
                        "[{}] every sandbox id in {:?} is in use; using the policy's uid",
                        run_id,
                        pool.range()
                    );
                }
                lease
            }
            _ => None,
        };
        let workspace = Workspace::create(&self.runtime_root, &run_id)?;
        log::info!(
            "[{}] prepared {} submission {} in {}",
            run_id,
            submission.language,
            submission.source.display(),
            workspace.run_dir().display()
        );

        Ok(RunContext {
            arena: Arc::new(ProcessArena::new(run_id.clone())),
            run_id,
            workspace,
            harness_is_root: self.host.is_root,
            identity,
            started_at: Utc::now(),
        })
    }

    /// Create the controls for one stage. `label` distinguishes the stage
    /// cgroups of a run.
    pub fn arm(
        &self,
        context: &RunContext,
        label: &'static str,
        mut policy: ExecutionPolicy,
    ) -> Result<ArmedStage, RunError> {
        if let Some(identity) = &context.identity {
            policy.sandbox_uid = identity.id();
            policy.sandbox_gid = identity.id();
        }
        let plan = NamespacePlan::for_run(policy.network, context.harness_is_root);
        let mut enforcement = EnforcementReport::default();
        enforcement
            .applied
            .extend(plan.enabled().into_iter().map(String::from));
        enforcement.applied.push("restricted_root".to_string());
        if !policy.syscall_deny_list.is_empty() {
            enforcement.applied.push("seccomp_deny_list".to_string());
        }
        if policy.network == NetworkMode::Loopback {
            enforcement.applied.push("loopback_only".to_string());
        }
        if policy.cpu_time_limit_ms.is_some() {
            enforcement.applied.push("rlimit_cpu".to_string());
        }
        enforcement.applied.push("wall_clock_monitor".to_string());
        if context.identity.is_some() {
            enforcement.applied.push("private_sandbox_uid".to_string());
        }

        let mut stage = ArmedStage {
            label,
            policy: Arc::new(policy),
            cgroup: None,
            nproc_fallback: context.private_identity(),
            enforcement,
        };

        let wants_cgroup =
            stage.policy.memory_limit_bytes.is_some() || stage.policy.max_processes.is_some();
        if !wants_cgroup {
            return Ok(stage);
        }

        let cgroup_name = match label {
            "run" => context.run_id.clone(),
            other => format!("{}-{}", context.run_id, other),
        };
        match self.create_cgroup(&cgroup_name, &stage.policy) {
            Ok((cgroup, applied)) => {
                stage.enforcement.applied.extend(applied);
                stage.cgroup = Some(cgroup);
            }
            Err(reason) => {
                if stage.policy.memory_limit_bytes.is_some() {
                    let reason = format!("{}; using RLIMIT_AS and the monitor", reason);
                    stage.degrade(&context.run_id, "memory_limit", &reason)?;
                }
                if stage.policy.max_processes.is_some() {
                    stage.degrade_process_limit(&context.run_id, &reason)?;
                }
            }
        }
        Ok(stage)
    }

    fn create_cgroup(
        &self,
        name: &str,
        policy: &ExecutionPolicy,
    ) -> Result<(Arc<dyn CgroupBackend>, Vec<String>), String> {
        if !self.use_cgroups {
            return Err("cgroups disabled by configuration".to_string());
        }
        if !self.host.cgroup_delegated {
            return Err(format!(
                "no writable cgroup v2 subtree at {}",
                self.cgroup_root.display()
            ));
        }

        let cgroup = CgroupV2::create(&self.cgroup_root, name).map_err(|e| e.to_string())?;
        let limits = CgroupLimits {
            memory_bytes: policy.memory_limit_bytes,
            // proxy and sandbox init share the group with the submission
            pids_max: policy.max_processes.map(|n| n.saturating_add(2)),
        };
        match cgroup.apply_limits(&limits) {
            Ok(applied) => Ok((Arc::new(cgroup), applied)),
            Err(e) => {
                let _ = cgroup.remove();
                Err(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::presets;

    fn host(delegated: bool) -> HostCapabilities {
        HostCapabilities {
            is_root: false,
            user_namespaces: true,
            user_namespace_note: None,
            cgroup_v2: delegated,
            cgroup_delegated: delegated,
            seccomp: true,
            kernel_release: "test".to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    fn enforcer(runtime: &std::path::Path, host: HostCapabilities) -> PolicyEnforcer {
        let config = HarnessConfig {
            runtime_root: runtime.to_path_buf(),
            cgroup_root: runtime.join("no-cgroup"),
            ..HarnessConfig::default()
        };
        PolicyEnforcer::new(&config, host)
    }

    fn submission() -> Submission {
        Submission::new("c", "/probes/timeout.c")
    }

    #[test]
    fn prepare_creates_private_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let enforcer = enforcer(scratch.path(), host(false));
        let policy = presets::preset("probe").unwrap();

        let context = enforcer.prepare(&submission(), &policy).unwrap();
        let run_dir = context.workspace.run_dir().to_path_buf();
        assert!(context.workspace.box_dir().is_dir());
        assert_eq!(context.arena.run_id(), context.run_id);
        drop(context);
        assert!(!run_dir.exists());
    }

    #[test]
    fn invalid_policy_is_rejected_before_anything_is_created() {
        let scratch = tempfile::tempdir().unwrap();
        let enforcer = enforcer(scratch.path(), host(false));
        let mut policy = presets::preset("probe").unwrap();
        policy.syscall_deny_list.push("not_a_syscall".to_string());

        let err = enforcer.prepare(&submission(), &policy).err().unwrap();
        assert!(matches!(err, RunError::InvalidSubmission(_)));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn host_without_isolation_fails_setup() {
        let scratch = tempfile::tempdir().unwrap();
        let mut bare = host(false);
        bare.user_namespaces = false;
        bare.user_namespace_note = Some("disabled".to_string());
        let enforcer = enforcer(scratch.path(), bare);

        let err = enforcer
            .prepare(&submission(), &presets::preset("probe").unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, RunError::SetupFailed(_)));
    }

    #[test]
    fn missing_cgroups_degrade_unless_hard_limits_required() {
        let scratch = tempfile::tempdir().unwrap();
        let enforcer = enforcer(scratch.path(), host(false));
        let policy = presets::preset("probe").unwrap();
        let context = enforcer.prepare(&submission(), &policy).unwrap();

        let stage = enforcer.arm(&context, "run", policy.clone()).unwrap();
        assert!(!stage.cgroup_enforced());
        assert!(stage.enforcement.degraded.iter().any(|d| d.starts_with("memory_limit")));
        assert!(stage.enforcement.degraded.iter().any(|d| d.starts_with("max_processes")));
        assert!(stage.enforcement.applied.contains(&"pid_namespace".to_string()));
        assert!(stage.enforcement.applied.contains(&"seccomp_deny_list".to_string()));

        let mut strict = policy;
        strict.require_hard_limits = true;
        let err = enforcer.arm(&context, "run", strict).err().unwrap();
        assert!(matches!(err, RunError::SetupFailed(_)));
    }

    #[test]
    fn root_runs_get_private_sandbox_ids() {
        let scratch = tempfile::tempdir().unwrap();
        let mut root_host = host(false);
        root_host.is_root = true;
        let enforcer = enforcer(scratch.path(), root_host);
        let policy = presets::preset("judge").unwrap();

        let first = enforcer.prepare(&submission(), &policy).unwrap();
        let second = enforcer.prepare(&submission(), &policy).unwrap();
        let (a, b) = (
            first.identity.as_ref().unwrap().id(),
            second.identity.as_ref().unwrap().id(),
        );
        assert_ne!(a, b);
        assert!(first.private_identity());

        let stage = enforcer.arm(&first, "run", policy.clone()).unwrap();
        assert_eq!((stage.policy.sandbox_uid, stage.policy.sandbox_gid), (a, a));
        assert!(stage.nproc_fallback);
        assert!(stage.enforcement.applied.contains(&"private_sandbox_uid".to_string()));
        assert!(stage
            .enforcement
            .degraded
            .iter()
            .any(|d| d.starts_with("max_processes") && d.contains("RLIMIT_NPROC")));

        drop(stage);
        drop(first);
        let third = enforcer.prepare(&submission(), &policy).unwrap();
        assert_eq!(third.identity.as_ref().unwrap().id(), a);
    }

    #[test]
    fn shared_sandbox_uid_leaves_process_count_unenforced() {
        let scratch = tempfile::tempdir().unwrap();
        let mut root_host = host(false);
        root_host.is_root = true;
        let config = HarnessConfig {
            runtime_root: scratch.path().to_path_buf(),
            cgroup_root: scratch.path().join("no-cgroup"),
            sandbox_ids: None,
            ..HarnessConfig::default()
        };
        let enforcer = PolicyEnforcer::new(&config, root_host);
        let policy = presets::preset("judge").unwrap();
        let context = enforcer.prepare(&submission(), &policy).unwrap();
        assert!(context.identity.is_none());
        assert!(!context.private_identity());

        let stage = enforcer.arm(&context, "run", policy).unwrap();
        assert_eq!(stage.policy.sandbox_uid, 65534);
        assert!(!stage.nproc_fallback);
        assert!(stage
            .enforcement
            .degraded
            .iter()
            .any(|d| d.starts_with("max_processes") && d.contains("not enforced")));
    }

    #[test]
    fn unlimited_policy_needs_no_cgroup() {
        let scratch = tempfile::tempdir().unwrap();
        let enforcer = enforcer(scratch.path(), host(false));
        let mut policy = presets::preset("probe").unwrap();
        policy.memory_limit_bytes = None;
        policy.max_processes = None;
        policy.require_hard_limits = true;
        let context = enforcer.prepare(&submission(), &policy).unwrap();

        let stage = enforcer.arm(&context, "compile", policy).unwrap();
        assert!(stage.enforcement.degraded.is_empty());
        assert_eq!(stage.label, "compile");
    }
}
