//! Resource monitor: samples a running sandbox and terminates it when a
//! ceiling is crossed.
//!
//! Wall-clock breaches get SIGTERM to the process group, a grace period, then
//! SIGKILL. Memory and CPU breaches are killed immediately. Every kill is
//! preceded by a claim on the run's [`OutcomeLatch`], so a payload whose exit
//! was already observed is never reported as breached.
use crate::config::types::{ExecutionPolicy, Result, SandboxError, TerminationCause};
use crate::core::types::{OutcomeLatch, ProcessArena, RunEvent};
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::signal::{signal_group, signal_process, KillReport};
use crate::observability::audit;
use crossbeam_channel::{select, Receiver, Sender};
use nix::sys::signal::Signal;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One observation of the sandbox tree
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsageSample {
    pub memory_bytes: u64,
    pub cpu_time_ms: u64,
    /// Host pids seen in this sample
    pub pids: Vec<i32>,
}

/// Source of usage figures for one run
pub trait UsageSampler: Send {
    fn name(&self) -> &'static str;
    /// Verify the sampler can see the run at all. Failing here aborts the run.
    fn attach(&mut self) -> Result<()>;
    fn sample(&mut self) -> Result<UsageSample>;
}

/// Reads the run's own cgroup
pub struct CgroupSampler {
    cgroup: Arc<dyn CgroupBackend>,
}

impl CgroupSampler {
    pub fn new(cgroup: Arc<dyn CgroupBackend>) -> Self {
        Self { cgroup }
    }
}

impl UsageSampler for CgroupSampler {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn attach(&mut self) -> Result<()> {
        self.cgroup.memory_current()?;
        self.cgroup.cpu_usage_usec()?;
        Ok(())
    }

    fn sample(&mut self) -> Result<UsageSample> {
        Ok(UsageSample {
            memory_bytes: self.cgroup.memory_current()?,
            cpu_time_ms: self.cgroup.cpu_usage_usec()? / 1000,
            pids: self.cgroup.procs().unwrap_or_default(),
        })
    }
}

/// Walks the descendants of the sandbox init through procfs.
///
/// Used when no cgroup governs the run. Sums resident memory of the live
/// descendants and the CPU time of everything they and their reaped children
/// consumed.
pub struct ProcfsSampler {
    init_pid: i32,
    proc_root: PathBuf,
    ticks_per_second: u64,
}

impl ProcfsSampler {
    pub fn new(init_pid: i32) -> Self {
        Self::with_proc_root(init_pid, PathBuf::from("/proc"))
    }

    pub fn with_proc_root(init_pid: i32, proc_root: PathBuf) -> Self {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            init_pid,
            proc_root,
            ticks_per_second: if ticks > 0 { ticks as u64 } else { 100 },
        }
    }

    fn descendants(&self) -> Vec<i32> {
        let mut seen = BTreeSet::new();
        let mut queue = vec![self.init_pid];
        while let Some(pid) = queue.pop() {
            for child in self.children_of(pid) {
                if seen.insert(child) {
                    queue.push(child);
                }
            }
        }
        seen.into_iter().collect()
    }

    fn children_of(&self, pid: i32) -> Vec<i32> {
        let tasks = match fs::read_dir(self.proc_root.join(pid.to_string()).join("task")) {
            Ok(tasks) => tasks,
            Err(_) => return Vec::new(),
        };
        let mut children = Vec::new();
        for task in tasks.flatten() {
            if let Ok(content) = fs::read_to_string(task.path().join("children")) {
                children.extend(content.split_whitespace().filter_map(|p| p.parse::<i32>().ok()));
            }
        }
        children
    }
}

impl UsageSampler for ProcfsSampler {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn attach(&mut self) -> Result<()> {
        let children = self
            .proc_root
            .join(self.init_pid.to_string())
            .join("task")
            .join(self.init_pid.to_string())
            .join("children");
        fs::read_to_string(&children).map(|_| ()).map_err(|e| {
            SandboxError::Process(format!(
                "cannot observe sandbox init {} through {}: {}",
                self.init_pid,
                children.display(),
                e
            ))
        })
    }

    fn sample(&mut self) -> Result<UsageSample> {
        let pids = self.descendants();
        let mut sample = UsageSample::default();
        let mut ticks = 0;
        for pid in &pids {
            let dir = self.proc_root.join(pid.to_string());
            // Processes vanish between listing and reading; skip them
            if let Ok(status) = fs::read_to_string(dir.join("status")) {
                sample.memory_bytes += parse_vm_rss_kb(&status).unwrap_or(0) * 1024;
            }
            if let Ok(stat) = fs::read_to_string(dir.join("stat")) {
                ticks += parse_cpu_ticks(&stat).unwrap_or(0);
            }
        }
        sample.cpu_time_ms = ticks * 1000 / self.ticks_per_second;
        sample.pids = pids;
        Ok(sample)
    }
}

/// `VmRSS` from a `/proc/<pid>/status` document, in KiB
pub fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// utime + stime + cutime + cstime from a `/proc/<pid>/stat` line, in ticks.
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3); utime is field 14
    let mut total = 0u64;
    for index in 11..=14 {
        let value: i64 = fields.get(index)?.parse().ok()?;
        total += value.max(0) as u64;
    }
    Some(total)
}

/// Ceilings the monitor enforces, read once from the frozen policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorLimits {
    pub wall_time: Duration,
    pub grace_period: Duration,
    pub sample_interval: Duration,
    pub cpu_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
}

impl MonitorLimits {
    pub fn from_policy(policy: &ExecutionPolicy) -> Self {
        Self {
            wall_time: Duration::from_millis(policy.wall_time_limit_ms),
            grace_period: Duration::from_millis(policy.grace_period_ms),
            sample_interval: Duration::from_millis(policy.sample_interval_ms.max(1)),
            cpu_time_ms: policy.cpu_time_limit_ms,
            memory_bytes: policy.memory_limit_bytes,
        }
    }
}

/// What the monitor saw and did over one run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Supervision {
    pub sampler: &'static str,
    pub breach: Option<TerminationCause>,
    pub peak_memory_bytes: u64,
    pub cpu_time_ms: u64,
    pub samples: u64,
    pub sample_errors: u64,
    pub kill: KillReport,
}

/// Process handles the monitor may signal
#[derive(Clone)]
pub struct MonitorTarget {
    pub run_id: String,
    /// Sandbox init; its pid is also the payload's process group
    pub init_pid: i32,
    pub cgroup: Option<Arc<dyn CgroupBackend>>,
    pub arena: Arc<ProcessArena>,
}

impl MonitorTarget {
    pub(crate) fn kill_now(&self, report: &mut KillReport) {
        // SIGKILL to a namespace init takes the whole namespace with it
        report.kill_sent |= signal_process(self.init_pid, Signal::SIGKILL);
        if let Some(cgroup) = &self.cgroup {
            match cgroup.kill_all() {
                Ok(()) => report.kill_sent = true,
                Err(e) => report.notes.push(format!("cgroup kill failed: {}", e)),
            }
        }
    }
}

/// Supervise one run until `stop` fires or the run is terminated.
///
/// `started` is when the payload began; the wall clock counts from there.
pub fn supervise(
    mut sampler: Box<dyn UsageSampler>,
    target: &MonitorTarget,
    limits: MonitorLimits,
    latch: &OutcomeLatch,
    started: Instant,
    stop: &Receiver<()>,
    events: &Sender<RunEvent>,
) -> Supervision {
    let mut supervision = Supervision {
        sampler: sampler.name(),
        ..Supervision::default()
    };
    let deadline = started + limits.wall_time;

    loop {
        if latch.exit_observed() {
            return supervision;
        }

        match sampler.sample() {
            Ok(sample) => {
                supervision.samples += 1;
                supervision.peak_memory_bytes =
                    supervision.peak_memory_bytes.max(sample.memory_bytes);
                supervision.cpu_time_ms = supervision.cpu_time_ms.max(sample.cpu_time_ms);
                target.arena.track_all(sample.pids);
            }
            Err(e) => {
                supervision.sample_errors += 1;
                log::debug!("[{}] usage sample failed: {}", target.run_id, e);
            }
        }

        if let Some(cause) = breached_limit(&supervision, &limits, Instant::now() >= deadline) {
            if !latch.claim_breach() {
                // The exit won the race; nothing to terminate
                return supervision;
            }
            log::warn!("[{}] {}; terminating", target.run_id, cause);
            audit::limit_breach(&target.run_id, &cause, observed(&cause, &supervision, &limits));
            let _ = events.send(RunEvent::Breach(cause.clone()));

            if cause == TerminationCause::TimedOut {
                terminate_gracefully(target, limits.grace_period, stop, &mut supervision.kill);
            } else {
                target.kill_now(&mut supervision.kill);
                audit::signal_escalation(&target.run_id, "SIGKILL", target.init_pid);
            }
            supervision.breach = Some(cause);
            return supervision;
        }

        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(limits.sample_interval);
        select! {
            recv(stop) -> _ => return supervision,
            default(wait) => {}
        }
    }
}

fn breached_limit(
    supervision: &Supervision,
    limits: &MonitorLimits,
    wall_expired: bool,
) -> Option<TerminationCause> {
    if let Some(memory) = limits.memory_bytes {
        if supervision.peak_memory_bytes >= memory {
            return Some(TerminationCause::MemoryExceeded);
        }
    }
    if let Some(cpu) = limits.cpu_time_ms {
        if supervision.cpu_time_ms >= cpu {
            return Some(TerminationCause::CpuExceeded);
        }
    }
    wall_expired.then_some(TerminationCause::TimedOut)
}

fn observed(cause: &TerminationCause, supervision: &Supervision, limits: &MonitorLimits) -> String {
    match cause {
        TerminationCause::MemoryExceeded => format!(
            "{} of {} bytes",
            supervision.peak_memory_bytes,
            limits.memory_bytes.unwrap_or(0)
        ),
        TerminationCause::CpuExceeded => format!(
            "{} of {} ms cpu",
            supervision.cpu_time_ms,
            limits.cpu_time_ms.unwrap_or(0)
        ),
        _ => format!("{} ms wall", limits.wall_time.as_millis()),
    }
}

fn terminate_gracefully(
    target: &MonitorTarget,
    grace: Duration,
    stop: &Receiver<()>,
    report: &mut KillReport,
) {
    report.term_sent = signal_group(target.init_pid, Signal::SIGTERM);
    audit::signal_escalation(&target.run_id, "SIGTERM", target.init_pid);

    let waited = Instant::now();
    let stopped = select! {
        recv(stop) -> _ => true,
        default(grace) => false,
    };
    report.waited_ms = waited.elapsed().as_millis() as u64;

    if stopped {
        report.notes.push("exited within grace period".to_string());
        return;
    }
    target.kill_now(report);
    audit::signal_escalation(&target.run_id, "SIGKILL", target.init_pid);
}

/// Start [`supervise`] on its own thread
pub fn spawn_monitor(
    sampler: Box<dyn UsageSampler>,
    target: MonitorTarget,
    limits: MonitorLimits,
    latch: Arc<OutcomeLatch>,
    started: Instant,
    stop: Receiver<()>,
    events: Sender<RunEvent>,
) -> std::io::Result<JoinHandle<Supervision>> {
    thread::Builder::new()
        .name(format!("probebox-monitor-{}", target.init_pid))
        .spawn(move || supervise(sampler, &target, limits, &latch, started, &stop, &events))
}

/// Choose the sampler for a run: the cgroup when one governs it, procfs otherwise
pub fn sampler_for(
    init_pid: i32,
    cgroup: Option<&Arc<dyn CgroupBackend>>,
) -> Box<dyn UsageSampler> {
    match cgroup {
        Some(cgroup) => Box::new(CgroupSampler::new(cgroup.clone())),
        None => Box::new(ProcfsSampler::new(init_pid)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, unbounded};
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command};

    struct ScriptedSampler {
        samples: Vec<UsageSample>,
    }

    impl UsageSampler for ScriptedSampler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn attach(&mut self) -> Result<()> {
            Ok(())
        }

        fn sample(&mut self) -> Result<UsageSample> {
            if self.samples.len() > 1 {
                Ok(self.samples.remove(0))
            } else {
                self.samples
                    .first()
                    .cloned()
                    .ok_or_else(|| SandboxError::Process("no samples".to_string()))
            }
        }
    }

    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap()
    }

    fn target(child: &Child) -> MonitorTarget {
        MonitorTarget {
            run_id: "monitor-test".to_string(),
            init_pid: child.id() as i32,
            cgroup: None,
            arena: Arc::new(ProcessArena::new("monitor-test")),
        }
    }

    fn limits(wall_ms: u64) -> MonitorLimits {
        MonitorLimits {
            wall_time: Duration::from_millis(wall_ms),
            grace_period: Duration::from_millis(100),
            sample_interval: Duration::from_millis(10),
            cpu_time_ms: Some(1_000),
            memory_bytes: Some(10 * 1024 * 1024),
        }
    }

    #[test]
    fn parses_rss_and_cpu_ticks() {
        let status = "Name:\tcat\nVmPeak:\t  9000 kB\nVmRSS:\t    1234 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss_kb(status), Some(1234));
        assert_eq!(parse_vm_rss_kb("Name:\tkthread\n"), None);

        let stat = "42 (odd ) name) S 1 42 42 0 -1 4194560 100 0 0 0 7 3 2 1 20 0 1 0 5 0 0";
        assert_eq!(parse_cpu_ticks(stat), Some(13));
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[test]
    fn memory_breach_kills_immediately() {
        let mut child = sleeper();
        let target = target(&child);
        let sampler = ScriptedSampler {
            samples: vec![
                UsageSample {
                    memory_bytes: 5 * 1024 * 1024,
                    cpu_time_ms: 1,
                    pids: vec![999_999],
                },
                UsageSample {
                    memory_bytes: 11 * 1024 * 1024,
                    cpu_time_ms: 2,
                    pids: vec![],
                },
            ],
        };
        let latch = OutcomeLatch::new();
        let (_stop_tx, stop) = bounded(1);
        let (events_tx, events) = unbounded();

        let supervision = supervise(
            Box::new(sampler),
            &target,
            limits(10_000),
            &latch,
            Instant::now(),
            &stop,
            &events_tx,
        );

        assert_eq!(supervision.breach, Some(TerminationCause::MemoryExceeded));
        assert!(supervision.kill.kill_sent);
        assert!(!supervision.kill.term_sent);
        assert!(latch.breached());
        assert_eq!(
            events.try_recv().unwrap(),
            RunEvent::Breach(TerminationCause::MemoryExceeded)
        );
        assert!(target.arena.tracked().contains(&999_999));
        assert!(child.wait().unwrap().code().is_none());
    }

    #[test]
    fn wall_breach_terminates_then_escalates() {
        let mut child = sleeper();
        let target = target(&child);
        let sampler = ScriptedSampler {
            samples: vec![UsageSample::default()],
        };
        let latch = OutcomeLatch::new();
        let (_stop_tx, stop) = bounded(1);
        let (events_tx, _events) = unbounded();

        let started = Instant::now();
        let supervision = supervise(
            Box::new(sampler),
            &target,
            limits(150),
            &latch,
            started,
            &stop,
            &events_tx,
        );

        assert_eq!(supervision.breach, Some(TerminationCause::TimedOut));
        assert!(supervision.kill.term_sent);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.wait().unwrap().code().is_none());
    }

    #[test]
    fn observed_exit_wins_over_breach() {
        let mut child = sleeper();
        let target = target(&child);
        let sampler = ScriptedSampler {
            samples: vec![UsageSample {
                memory_bytes: u64::MAX,
                cpu_time_ms: 0,
                pids: vec![],
            }],
        };
        let latch = OutcomeLatch::new();
        assert!(latch.claim_exit());
        let (_stop_tx, stop) = bounded(1);
        let (events_tx, events) = unbounded();

        let supervision = supervise(
            Box::new(sampler),
            &target,
            limits(10_000),
            &latch,
            Instant::now(),
            &stop,
            &events_tx,
        );

        assert_eq!(supervision.breach, None);
        assert!(!supervision.kill.kill_sent);
        assert!(events.try_recv().is_err());
        assert!(crate::kernel::signal::process_exists(child.id() as i32));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn stop_channel_ends_supervision_without_signals() {
        let mut child = sleeper();
        let target = target(&child);
        let sampler = ScriptedSampler {
            samples: vec![UsageSample::default()],
        };
        let latch = Arc::new(OutcomeLatch::new());
        let (stop_tx, stop) = bounded(1);
        let (events_tx, _events) = unbounded();

        let handle = spawn_monitor(
            Box::new(sampler),
            target.clone(),
            limits(10_000),
            latch,
            Instant::now(),
            stop,
            events_tx,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        stop_tx.send(()).unwrap();

        let supervision = handle.join().unwrap();
        assert_eq!(supervision.breach, None);
        assert!(supervision.samples >= 1);
        assert_eq!(supervision.kill, KillReport::default());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn procfs_sampler_sees_children_of_this_process() {
        let own = std::process::id() as i32;
        let mut sampler = ProcfsSampler::new(own);
        if sampler.attach().is_err() {
            println!("skipping: /proc/<pid>/task/<tid>/children unavailable");
            return;
        }
        let mut child = sleeper();
        let sample = sampler.sample().unwrap();
        assert!(sample.pids.contains(&(child.id() as i32)));
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
