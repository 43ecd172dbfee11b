//! Library entry point: host preflight plus the orchestrator and evaluator.
use crate::config::loader::HarnessConfig;
use crate::config::types::{ExecutionPolicy, ExecutionResult, HarnessError, RunError, Submission};
use crate::core::orchestrator::Orchestrator;
use crate::core::pool::{Evaluation, Evaluator, Job, WorkerPool};
use crate::judge::RunnerRegistry;
use crate::kernel::host::HostCapabilities;
use crate::safety::workspace;
use crate::verdict::{judge, Oracle, Verdict};
use std::sync::Arc;
use std::time::Duration;

/// Run directories older than this are leftovers of a crashed harness
const STALE_RUN_AGE: Duration = Duration::from_secs(3600);

pub struct Harness {
    config: HarnessConfig,
    host: HostCapabilities,
    orchestrator: Orchestrator,
}

impl Harness {
    /// Refuses to start on a host that cannot isolate anything
    pub fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        Self::with_registry(config, RunnerRegistry::default())
    }

    pub fn with_registry(
        config: HarnessConfig,
        registry: RunnerRegistry,
    ) -> Result<Self, HarnessError> {
        let host = HostCapabilities::detect(&config.cgroup_root);
        Self::with_host(config, host, registry)
    }

    pub fn with_host(
        config: HarnessConfig,
        host: HostCapabilities,
        registry: RunnerRegistry,
    ) -> Result<Self, HarnessError> {
        if let Some(gap) = host.isolation_gap() {
            return Err(HarnessError::IsolationUnavailable(gap));
        }
        if config.workers == 0 {
            return Err(HarnessError::Config("workers must be at least 1".to_string()));
        }
        if !host.cgroup_delegated {
            log::warn!(
                "no delegated cgroup v2 subtree at {}; memory and process limits fall back to rlimits",
                config.cgroup_root.display()
            );
        }
        if !host.seccomp {
            log::warn!("seccomp unavailable; policies with a syscall deny-list will not run");
        }

        match workspace::sweep_stale(&config.runtime_root, STALE_RUN_AGE) {
            Ok(0) => {}
            Ok(removed) => log::info!("removed {} stale run directories", removed),
            Err(e) => log::warn!("stale run sweep failed: {}", e),
        }

        let orchestrator = Orchestrator::new(&config, host.clone(), registry)?;
        log::info!(
            "harness ready (root: {}, userns: {}, cgroups: {}, kernel {})",
            host.is_root,
            host.user_namespaces,
            host.cgroup_delegated,
            host.kernel_release
        );
        Ok(Self {
            config,
            host,
            orchestrator,
        })
    }

    pub fn host(&self) -> &HostCapabilities {
        &self.host
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn run(
        &self,
        submission: &Submission,
        policy: ExecutionPolicy,
    ) -> Result<ExecutionResult, RunError> {
        self.orchestrator.run(submission, policy)
    }

    /// Run and judge in one step
    pub fn evaluate(
        &self,
        submission: &Submission,
        policy: ExecutionPolicy,
        oracle: &Oracle,
    ) -> (Result<ExecutionResult, RunError>, Verdict) {
        let outcome = self.run(submission, policy);
        let verdict = judge(&outcome, oracle);
        (outcome, verdict)
    }

    /// Worker pool sized from the configuration
    pub fn pool(self: &Arc<Self>) -> std::io::Result<WorkerPool> {
        WorkerPool::new(self.clone(), self.config.workers, self.config.queue_capacity)
    }
}

impl Evaluator for Harness {
    fn evaluate(&self, job: &Job) -> Evaluation {
        let (outcome, verdict) =
            Harness::evaluate(self, &job.submission, job.policy.clone(), &job.oracle);
        log::info!("case '{}': {}", job.name, verdict);
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Evaluation {
            name: job.name.clone(),
            result,
            error,
            verdict,
        }
    }
}
