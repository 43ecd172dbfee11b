//! Execution orchestrator.
//!
//! One call to [`Orchestrator::run`] owns one run from start to finish:
//!
//! 1. check the submission and resolve its language runner
//! 2. let the [`PolicyEnforcer`] create the run context and stage the source
//! 3. compile inside the sandbox when the language needs it
//! 4. launch the payload through the proxy and wait on a single event
//!    channel for whichever comes first: exit, breach or setup failure
//! 5. tear everything down, then assemble the [`ExecutionResult`]
//!
//! Teardown runs on every path once a proxy has been started. `run` does not
//! return until the proxy is reaped, the arena is swept and the stage cgroup
//! is gone.
use crate::config::loader::HarnessConfig;
use crate::config::presets;
use crate::config::types::{
    CompileSummary, EnforcementReport, ExecutionPolicy, ExecutionResult, HarnessError, RunError,
    Submission, TerminationCause,
};
use crate::core::enforcer::{ArmedStage, PolicyEnforcer, RunContext};
use crate::core::monitor::{sampler_for, spawn_monitor, MonitorLimits, MonitorTarget, Supervision};
use crate::core::supervisor::{SpawnError, SpawnedProxy};
use crate::core::types::{LaunchRequest, OutcomeLatch, RunEvent, StatusEvent};
use crate::judge::{LanguageRunner, RunnerRegistry};
use crate::kernel::host::HostCapabilities;
use crate::kernel::signal::{process_exists, KillReport};
use crate::observability::audit;
use crate::utils::output::CapturedStream;
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const EVENT_TICK: Duration = Duration::from_millis(50);
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The payload's exit as reported by sandbox init
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PayloadExit {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cpu_time_ms: u64,
    pub max_rss_kb: u64,
}

/// Everything one stage reported, as input to [`classify`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageObservation {
    pub exited: Option<PayloadExit>,
    pub breach: Option<TerminationCause>,
    pub setup_error: Option<String>,
    pub exec_errno: Option<i32>,
    pub internal_failure: Option<String>,
    pub oom_kills: u64,
    pub cpu_time_ms: u64,
    pub cpu_limit_ms: Option<u64>,
}

/// Decide how a stage ended. Returns the exit code and the single
/// termination cause, or the run-level error that voids the result.
pub fn classify(
    observed: &StageObservation,
) -> Result<(Option<i32>, TerminationCause), RunError> {
    if let Some(failure) = &observed.internal_failure {
        return Err(RunError::InternalMonitorFailure(failure.clone()));
    }
    if let Some(error) = &observed.setup_error {
        return Err(RunError::SetupFailed(error.clone()));
    }
    if let Some(errno) = observed.exec_errno {
        return Err(RunError::SpawnFailed(format!(
            "execve failed: {}",
            nix::errno::Errno::from_i32(errno)
        )));
    }

    let exit = match observed.exited {
        Some(exit) => exit,
        None => {
            // Init died before it could report, so the breach kill took it
            if let Some(breach) = &observed.breach {
                return Ok((None, breach.clone()));
            }
            if observed.oom_kills > 0 {
                return Ok((None, TerminationCause::MemoryExceeded));
            }
            return Err(RunError::InternalMonitorFailure(
                "sandbox ended without reporting the payload's exit".to_string(),
            ));
        }
    };

    if let Some(breach) = &observed.breach {
        return Ok((exit.exit_code, breach.clone()));
    }
    let signal = match exit.signal {
        Some(signal) => signal,
        None => return Ok((exit.exit_code, TerminationCause::Normal)),
    };
    let cpu_spent = observed
        .cpu_limit_ms
        .is_some_and(|limit| observed.cpu_time_ms.max(exit.cpu_time_ms) >= limit);
    let cause = match signal {
        libc::SIGXCPU => TerminationCause::CpuExceeded,
        libc::SIGKILL if observed.oom_kills > 0 => TerminationCause::MemoryExceeded,
        // RLIMIT_CPU's hard limit is delivered as SIGKILL
        libc::SIGKILL if cpu_spent => TerminationCause::CpuExceeded,
        libc::SIGSYS => TerminationCause::PolicyViolation {
            detail: "denied syscall".to_string(),
        },
        libc::SIGXFSZ => TerminationCause::PolicyViolation {
            detail: "file size limit exceeded".to_string(),
        },
        other => TerminationCause::Signaled { signal: other },
    };
    Ok((None, cause))
}

/// Measured outcome of one sandboxed stage
#[derive(Debug)]
pub struct StageOutcome {
    pub exit_code: Option<i32>,
    pub cause: TerminationCause,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub enforcement: EnforcementReport,
}

/// Mutable view of a stage while its events arrive. Owned by one
/// `execute_stage` call, never shared.
struct StageTracker {
    spawned_at: Instant,
    init_pid: Option<i32>,
    payload_started: Option<Instant>,
    payload_exited: Option<Instant>,
    proxy_exited: Option<Instant>,
    status_closed: bool,
    setup_killed: bool,
    backstop_fired: bool,
    monitor: Option<(JoinHandle<Supervision>, Sender<()>)>,
    monitor_attempted: bool,
    observed: StageObservation,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            spawned_at: Instant::now(),
            init_pid: None,
            payload_started: None,
            payload_exited: None,
            proxy_exited: None,
            status_closed: false,
            setup_killed: false,
            backstop_fired: false,
            monitor: None,
            monitor_attempted: false,
            observed: StageObservation::default(),
        }
    }

    fn stop_monitor(&self) {
        if let Some((_, stop)) = &self.monitor {
            let _ = stop.try_send(());
        }
    }

    /// The payload's exit or the proxy's has been seen
    fn stage_over(&self) -> bool {
        self.observed.exited.is_some() || self.proxy_exited.is_some()
    }

    fn finished(&self, teardown_timeout: Duration) -> bool {
        match self.proxy_exited {
            Some(at) => self.status_closed || at.elapsed() >= teardown_timeout,
            None => false,
        }
    }
}

pub struct Orchestrator {
    enforcer: PolicyEnforcer,
    registry: RunnerRegistry,
    proxy_executable: PathBuf,
    setup_timeout: Duration,
    teardown_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &HarnessConfig,
        host: HostCapabilities,
        registry: RunnerRegistry,
    ) -> Result<Self, HarnessError> {
        let proxy_executable = config
            .proxy_binary()
            .map_err(|e| HarnessError::Config(format!("cannot locate proxy binary: {}", e)))?;
        Ok(Self {
            enforcer: PolicyEnforcer::new(config, host),
            registry,
            proxy_executable,
            setup_timeout: Duration::from_millis(config.setup_timeout_ms),
            teardown_timeout: Duration::from_millis(config.teardown_timeout_ms),
        })
    }

    pub fn enforcer(&self) -> &PolicyEnforcer {
        &self.enforcer
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    /// Run one submission under `policy`
    pub fn run(
        &self,
        submission: &Submission,
        policy: ExecutionPolicy,
    ) -> Result<ExecutionResult, RunError> {
        let runner = self.registry.get(&submission.language)?;
        match std::fs::metadata(&submission.source) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(RunError::InvalidSubmission(format!(
                    "{} is not a regular file",
                    submission.source.display()
                )))
            }
            Err(e) => {
                return Err(RunError::InvalidSubmission(format!(
                    "cannot read {}: {}",
                    submission.source.display(),
                    e
                )))
            }
        }

        let stdin = submission.stdin_data()?;

        let mut context = self.enforcer.prepare(submission, &policy)?;
        let policy_digest = policy.digest();
        audit::run_started(
            &context.run_id,
            runner.language(),
            &policy.name,
            &policy_digest,
        );

        let outcome =
            self.run_in_context(&context, runner.as_ref(), submission, stdin, policy.clone());

        if let Err(e) = context.workspace.remove() {
            log::error!("[{}] run directory not removed: {}", context.run_id, e);
            audit::teardown_result(&context.run_id, &[format!("run directory: {}", e)]);
        }

        let (compile, stage) = outcome?;
        let result = ExecutionResult {
            run_id: context.run_id.clone(),
            exit_code: stage.exit_code,
            cause: stage.cause,
            stdout: stage.stdout.render(),
            stderr: stage.stderr.render(),
            stdout_integrity: stage.stdout.integrity,
            stderr_integrity: stage.stderr.integrity,
            wall_time_ms: stage.wall_time_ms,
            cpu_time_ms: stage.cpu_time_ms,
            peak_memory_bytes: stage.peak_memory_bytes,
            policy_name: policy.name.clone(),
            policy_digest,
            started_at: context.started_at,
            enforcement: stage.enforcement,
            compile,
        };
        audit::run_finished(
            &result.run_id,
            &result.cause,
            result.wall_time_ms,
            &result.enforcement,
        );
        log::info!(
            "[{}] finished: {} in {} ms",
            result.run_id,
            result.cause,
            result.wall_time_ms
        );
        Ok(result)
    }

    fn run_in_context(
        &self,
        context: &RunContext,
        runner: &dyn LanguageRunner,
        submission: &Submission,
        stdin: Option<String>,
        policy: ExecutionPolicy,
    ) -> Result<(Option<CompileSummary>, StageOutcome), RunError> {
        let staged = runner.staged_name(submission);
        context
            .workspace
            .stage_file(&submission.source, &staged, runner.staged_mode())?;

        let compile = match runner.compile_command(&staged)? {
            Some(command) => {
                let mut compile_policy = presets::preset("compile").ok_or_else(|| {
                    RunError::SetupFailed("compile preset is not defined".to_string())
                })?;
                compile_policy.require_hard_limits = policy.require_hard_limits;
                // Replaced by the run's leased id when there is one
                compile_policy.sandbox_uid = policy.sandbox_uid;
                compile_policy.sandbox_gid = policy.sandbox_gid;
                let compile_policy = runner.compile_requirements().apply(&compile_policy);

                log::info!("[{}] compiling {}", context.run_id, staged);
                let stage = self.enforcer.arm(context, "compile", compile_policy)?;
                let outcome = self.execute_stage(context, stage, command, None)?;
                let summary = CompileSummary {
                    exit_code: outcome.exit_code,
                    cause: outcome.cause.clone(),
                    wall_time_ms: outcome.wall_time_ms,
                    diagnostics: format!("{}{}", outcome.stderr.render(), outcome.stdout.render()),
                };
                if summary.cause != TerminationCause::Normal || summary.exit_code != Some(0) {
                    return Err(RunError::CompileFailed(Box::new(summary)));
                }
                Some(summary)
            }
            None => None,
        };

        let policy = runner.requirements().apply(&policy);
        let command = runner.launch_command(&staged, &submission.args)?;
        let stage = self.enforcer.arm(context, "run", policy)?;
        let outcome = self.execute_stage(context, stage, command, stdin)?;
        Ok((compile, outcome))
    }

    fn spawn_proxy(&self, run_id: &str) -> Result<SpawnedProxy, RunError> {
        match SpawnedProxy::spawn(&self.proxy_executable) {
            Ok(proxy) => Ok(proxy),
            Err(SpawnError::Transient(e)) => {
                log::warn!("[{}] proxy spawn failed ({}); retrying once", run_id, e);
                std::thread::sleep(SPAWN_RETRY_DELAY);
                SpawnedProxy::spawn(&self.proxy_executable).map_err(|e| match e {
                    SpawnError::Transient(e) => RunError::SpawnFailed(e.to_string()),
                    SpawnError::Setup(e) => RunError::SetupFailed(e.to_string()),
                })
            }
            Err(SpawnError::Setup(e)) => Err(RunError::SetupFailed(format!(
                "cannot start {}: {}",
                self.proxy_executable.display(),
                e
            ))),
        }
    }

    /// Run `command` in a fresh sandbox for one stage and wait for it to end
    fn execute_stage(
        &self,
        context: &RunContext,
        mut stage: ArmedStage,
        command: Vec<String>,
        stdin: Option<String>,
    ) -> Result<StageOutcome, RunError> {
        let run_id = context.run_id.as_str();
        let mut proxy = self.spawn_proxy(run_id)?;
        context.arena.track(proxy.pid());

        // The proxy blocks on its launch fd, so nothing has run yet
        if let Some(cgroup) = stage.cgroup.clone() {
            if let Err(e) = cgroup.attach_process(proxy.pid() as u32) {
                if let Some(error) = stage.release() {
                    log::warn!("[{}] {}", run_id, error);
                }
                let reason = format!("cannot join cgroup: {}", e);
                if stage.policy.memory_limit_bytes.is_some() {
                    stage.degrade(run_id, "memory_limit", &reason)?;
                }
                if stage.policy.max_processes.is_some() {
                    stage.degrade_process_limit(run_id, &reason)?;
                }
            }
        }

        let request = LaunchRequest {
            run_id: run_id.to_string(),
            policy: (*stage.policy).clone(),
            root_dir: context.workspace.root_dir().to_path_buf(),
            command,
            harness_is_root: context.harness_is_root,
            cgroup_enforced: stage.cgroup_enforced(),
            nproc_fallback: stage.nproc_fallback,
        };
        proxy
            .release(&request)
            .map_err(|e| RunError::SpawnFailed(format!("launch request not delivered: {}", e)))?;

        let latch = Arc::new(OutcomeLatch::new());
        let (events_tx, events_rx) = unbounded();
        let output_limit = stage.policy.output_limit_bytes;
        let watch = match proxy.watch(stdin, output_limit, latch.clone(), events_tx.clone()) {
            Ok(watch) => watch,
            Err(e) => {
                if let Some(cgroup) = &stage.cgroup {
                    let _ = cgroup.kill_all();
                }
                return Err(RunError::SpawnFailed(format!(
                    "cannot attach to the proxy: {}",
                    e
                )));
            }
        };
        log::debug!("[{}] {} stage launched, proxy {}", run_id, stage.label, watch.pid);

        let limits = MonitorLimits::from_policy(&stage.policy);
        let backstop = limits.wall_time + limits.grace_period + self.teardown_timeout;
        let mut tracker = StageTracker::new();

        while !tracker.finished(self.teardown_timeout) {
            let now = Instant::now();
            if tracker.payload_started.is_none()
                && tracker.proxy_exited.is_none()
                && !tracker.setup_killed
                && now.duration_since(tracker.spawned_at) >= self.setup_timeout
            {
                tracker.observed.setup_error.get_or_insert_with(|| {
                    format!(
                        "sandbox did not start within {} ms",
                        self.setup_timeout.as_millis()
                    )
                });
                self.kill_tree(context, &stage, &tracker, watch.pid);
                tracker.setup_killed = true;
            }
            if let Some(started) = tracker.payload_started {
                if tracker.observed.exited.is_none()
                    && tracker.proxy_exited.is_none()
                    && !tracker.backstop_fired
                    && now.duration_since(started) >= backstop
                {
                    log::error!("[{}] payload outlived every deadline; killing", run_id);
                    tracker
                        .observed
                        .internal_failure
                        .get_or_insert_with(|| "monitor did not stop the payload".to_string());
                    self.kill_tree(context, &stage, &tracker, watch.pid);
                    tracker.backstop_fired = true;
                }
            }

            let event = match events_rx.recv_timeout(EVENT_TICK) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.handle_event(context, &stage, &mut tracker, event);

            if !tracker.monitor_attempted
                && tracker.proxy_exited.is_none()
                && tracker.observed.exited.is_none()
            {
                if let (Some(init_pid), Some(started)) = (tracker.init_pid, tracker.payload_started)
                {
                    tracker.monitor_attempted = true;
                    let target = MonitorTarget {
                        run_id: run_id.to_string(),
                        init_pid,
                        cgroup: stage.cgroup.clone(),
                        arena: context.arena.clone(),
                    };
                    let mut sampler = sampler_for(init_pid, stage.cgroup.as_ref());
                    let sampler_name = sampler.name();
                    let (stop_tx, stop_rx) = bounded(1);
                    let attached = sampler
                        .attach()
                        .map_err(|e| format!("{} sampler cannot attach: {}", sampler_name, e))
                        .and_then(|()| {
                            spawn_monitor(
                                sampler,
                                target,
                                limits,
                                latch.clone(),
                                started,
                                stop_rx,
                                events_tx.clone(),
                            )
                            .map_err(|e| format!("cannot start monitor thread: {}", e))
                        });
                    match attached {
                        Ok(handle) => tracker.monitor = Some((handle, stop_tx)),
                        Err(reason) => {
                            // A short payload can take init with it before the sampler looks
                            while let Ok(event) = events_rx.try_recv() {
                                self.handle_event(context, &stage, &mut tracker, event);
                            }
                            if tracker.stage_over() || !process_exists(init_pid) {
                                log::debug!(
                                    "[{}] stage ended before the monitor attached ({})",
                                    run_id,
                                    reason
                                );
                            } else {
                                log::error!("[{}] {}; aborting run", run_id, reason);
                                tracker.observed.internal_failure = Some(reason);
                                self.kill_tree(context, &stage, &tracker, watch.pid);
                            }
                        }
                    }
                }
            }
        }

        // Teardown: monitor, cgroup, arena, output, in that order
        tracker.stop_monitor();
        let supervision = match tracker.monitor.take() {
            Some((handle, _stop)) => handle.join().unwrap_or_else(|_| {
                tracker
                    .observed
                    .internal_failure
                    .get_or_insert_with(|| "monitor thread panicked".to_string());
                Supervision::default()
            }),
            None => Supervision::default(),
        };
        if tracker.observed.breach.is_none() {
            tracker.observed.breach = supervision.breach.clone();
        }
        log::debug!(
            "[{}] {} sampler took {} samples ({} failed)",
            run_id,
            supervision.sampler,
            supervision.samples,
            supervision.sample_errors
        );

        let mut leftovers = Vec::new();
        let mut cgroup_peak = 0;
        let mut cgroup_cpu_ms = 0;
        if let Some(cgroup) = stage.cgroup.clone() {
            cgroup_peak = cgroup.memory_peak().unwrap_or(0);
            cgroup_cpu_ms = cgroup.cpu_usage_usec().unwrap_or(0) / 1000;
            tracker.observed.oom_kills = cgroup.oom_kill_count().unwrap_or(0);

            let deadline = Instant::now() + self.teardown_timeout;
            while !cgroup.is_empty().unwrap_or(true) {
                if Instant::now() >= deadline {
                    leftovers.push(format!("cgroup {} still populated", cgroup.path().display()));
                    break;
                }
                let _ = cgroup.kill_all();
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        if let Some(error) = stage.release() {
            leftovers.push(error);
        }

        let survivors = context.arena.sweep(self.teardown_timeout, process_exists);
        if !survivors.is_empty() {
            leftovers.push(format!("processes still present: {:?}", survivors));
        }
        if let Some(error) = supervision.kill.notes.iter().find(|n| n.contains("failed")) {
            leftovers.push(error.clone());
        }
        if !leftovers.is_empty() {
            log::warn!("[{}] teardown incomplete: {}", run_id, leftovers.join("; "));
        }
        audit::teardown_result(run_id, &leftovers);

        let (stdout, stderr) = watch.collect(output_limit);

        tracker.observed.cpu_limit_ms = stage.policy.cpu_time_limit_ms;
        let rusage_cpu = tracker.observed.exited.map(|e| e.cpu_time_ms).unwrap_or(0);
        tracker.observed.cpu_time_ms = cgroup_cpu_ms.max(rusage_cpu).max(supervision.cpu_time_ms);
        let (exit_code, cause) = classify(&tracker.observed)?;

        let rss_peak = tracker
            .observed
            .exited
            .map(|e| e.max_rss_kb.saturating_mul(1024))
            .unwrap_or(0);
        let wall_time_ms = match tracker.payload_started {
            Some(started) => tracker
                .payload_exited
                .or(tracker.proxy_exited)
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(started)
                .as_millis() as u64,
            None => 0,
        };

        Ok(StageOutcome {
            exit_code,
            cause,
            stdout,
            stderr,
            wall_time_ms,
            cpu_time_ms: tracker.observed.cpu_time_ms,
            peak_memory_bytes: supervision.peak_memory_bytes.max(cgroup_peak).max(rss_peak),
            enforcement: stage.enforcement.clone(),
        })
    }

    fn handle_event(
        &self,
        context: &RunContext,
        stage: &ArmedStage,
        tracker: &mut StageTracker,
        event: RunEvent,
    ) {
        let run_id = context.run_id.as_str();
        match event {
            RunEvent::Status(StatusEvent::Spawned { init_pid }) => {
                context.arena.track(init_pid);
                tracker.init_pid = Some(init_pid);
            }
            RunEvent::Status(StatusEvent::RootReady { skipped, pivoted }) => {
                if !skipped.is_empty() {
                    log::debug!("[{}] optional paths absent: {:?}", run_id, skipped);
                }
                if !pivoted {
                    log::debug!("[{}] root entered with chroot", run_id);
                }
            }
            RunEvent::Status(StatusEvent::PayloadStarted) => {
                tracker.payload_started.get_or_insert_with(Instant::now);
            }
            RunEvent::Status(StatusEvent::PayloadExited {
                exit_code,
                signal,
                cpu_time_ms,
                max_rss_kb,
            }) => {
                tracker.payload_exited = Some(Instant::now());
                tracker.observed.exited = Some(PayloadExit {
                    exit_code,
                    signal,
                    cpu_time_ms,
                    max_rss_kb,
                });
                tracker.stop_monitor();
            }
            RunEvent::Status(StatusEvent::SetupFailed { stage: step, error }) => {
                log::warn!(
                    "[{}] {} stage setup failed at {}: {}",
                    run_id,
                    stage.label,
                    step,
                    error
                );
                tracker
                    .observed
                    .setup_error
                    .get_or_insert_with(|| format!("{}: {}", step, error));
            }
            RunEvent::Status(StatusEvent::ExecFailed { errno }) => {
                tracker.observed.exec_errno = Some(errno);
            }
            RunEvent::Breach(cause) => {
                tracker.observed.breach = Some(cause);
            }
            RunEvent::StatusClosed { error } => {
                if let Some(error) = error {
                    log::warn!("[{}] status channel: {}", run_id, error);
                }
                tracker.status_closed = true;
            }
            RunEvent::ProxyExited { exit_code, signal } => {
                log::debug!(
                    "[{}] proxy exited (code {:?}, signal {:?})",
                    run_id,
                    exit_code,
                    signal
                );
                tracker.proxy_exited = Some(Instant::now());
                tracker.stop_monitor();
            }
        }
    }

    /// Kill whatever of the stage is still running. Pids are only signalled
    /// while the proxy is unreaped, so they cannot have been recycled.
    fn kill_tree(
        &self,
        context: &RunContext,
        stage: &ArmedStage,
        tracker: &StageTracker,
        proxy_pid: i32,
    ) {
        let mut report = KillReport::default();
        if tracker.proxy_exited.is_none() {
            if let Some(init_pid) = tracker.init_pid {
                let target = MonitorTarget {
                    run_id: context.run_id.clone(),
                    init_pid,
                    cgroup: stage.cgroup.clone(),
                    arena: context.arena.clone(),
                };
                target.kill_now(&mut report);
            }
            report.kill_sent |= crate::kernel::signal::signal_process(
                proxy_pid,
                nix::sys::signal::Signal::SIGKILL,
            );
        } else if let Some(cgroup) = &stage.cgroup {
            report.kill_sent |= cgroup.kill_all().is_ok();
        }
        log::debug!("[{}] tree kill: {:?}", context.run_id, report);
    }
}
