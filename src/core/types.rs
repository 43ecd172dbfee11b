use crate::config::types::{ExecutionPolicy, TerminationCause};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Host->proxy launch contract, written as one JSON document on the launch fd.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub run_id: String,
    pub policy: ExecutionPolicy,
    /// `<run_dir>/root`, the directory that becomes `/`
    pub root_dir: PathBuf,
    /// argv; `command[0]` is the program path as seen inside the sandbox
    pub command: Vec<String>,
    pub harness_is_root: bool,
    /// cgroup limits are live, so the rlimit fallbacks for memory and
    /// process count are not needed
    pub cgroup_enforced: bool,
    /// The payload's uid belongs to this run alone, so RLIMIT_NPROC can
    /// replace pids.max when the cgroup is missing
    #[serde(default)]
    pub nproc_fallback: bool,
}

/// Sandbox->host status line. Proxy, init and payload all write to the
/// same pipe; each event is a single `write` shorter than PIPE_BUF.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Sandbox init forked; pid is in the harness pid namespace
    Spawned { init_pid: i32 },
    RootReady {
        skipped: Vec<PathBuf>,
        pivoted: bool,
    },
    /// Payload forked and running its pre-exec chain
    PayloadStarted,
    PayloadExited {
        exit_code: Option<i32>,
        signal: Option<i32>,
        cpu_time_ms: u64,
        max_rss_kb: u64,
    },
    SetupFailed { stage: String, error: String },
    ExecFailed { errno: i32 },
}

impl StatusEvent {
    pub fn setup_failed(stage: &str, error: impl std::fmt::Display) -> Self {
        StatusEvent::SetupFailed {
            stage: stage.to_string(),
            error: error.to_string(),
        }
    }
}

/// Everything the orchestrator waits on, funnelled into one channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunEvent {
    Status(StatusEvent),
    /// Monitor decided the run breached a limit and began terminating it
    Breach(TerminationCause),
    /// Status pipe reached EOF or carried garbage
    StatusClosed { error: Option<String> },
    ProxyExited {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

const OUTCOME_PENDING: u8 = 0;
const OUTCOME_EXITED: u8 = 1;
const OUTCOME_BREACHED: u8 = 2;

/// First-observer-wins latch between the payload's exit and a limit breach.
///
/// The status reader claims it on `PayloadExited`; the monitor claims it
/// before sending any signal. Whoever loses the race does nothing decisive.
#[derive(Debug, Default)]
pub struct OutcomeLatch {
    state: AtomicU8,
}

impl OutcomeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim_exit(&self) -> bool {
        self.claim(OUTCOME_EXITED)
    }

    pub fn claim_breach(&self) -> bool {
        self.claim(OUTCOME_BREACHED)
    }

    fn claim(&self, outcome: u8) -> bool {
        self.state
            .compare_exchange(OUTCOME_PENDING, outcome, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn exit_observed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == OUTCOME_EXITED
    }

    pub fn breached(&self) -> bool {
        self.state.load(Ordering::SeqCst) == OUTCOME_BREACHED
    }
}

/// Host pids that belonged to one run. Swept on teardown.
#[derive(Debug)]
pub struct ProcessArena {
    run_id: String,
    pids: Mutex<BTreeSet<i32>>,
}

impl ProcessArena {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            pids: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn track(&self, pid: i32) {
        if pid <= 1 {
            return;
        }
        if let Ok(mut pids) = self.pids.lock() {
            pids.insert(pid);
        }
    }

    pub fn track_all(&self, pids: impl IntoIterator<Item = i32>) {
        for pid in pids {
            self.track(pid);
        }
    }

    pub fn tracked(&self) -> Vec<i32> {
        self.pids
            .lock()
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pids.lock().map(|pids| pids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every tracked pid is gone or `timeout` passes; returns the
    /// survivors. Pids are only observed here, never signalled, since a gone
    /// pid may already belong to someone else.
    pub fn sweep(&self, timeout: Duration, alive: impl Fn(i32) -> bool) -> Vec<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            let survivors: Vec<i32> =
                self.tracked().into_iter().filter(|pid| alive(*pid)).collect();
            if survivors.is_empty() || Instant::now() >= deadline {
                return survivors;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_events_are_single_json_lines() {
        let event = StatusEvent::PayloadExited {
            exit_code: Some(0),
            signal: None,
            cpu_time_ms: 12,
            max_rss_kb: 2048,
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains(r#""event":"payload_exited""#));
        let back: StatusEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn latch_has_exactly_one_winner() {
        let latch = OutcomeLatch::new();
        assert!(latch.claim_exit());
        assert!(!latch.claim_breach());
        assert!(latch.exit_observed());
        assert!(!latch.breached());

        let latch = OutcomeLatch::new();
        assert!(latch.claim_breach());
        assert!(!latch.claim_exit());
        assert!(latch.breached());
    }

    #[test]
    fn latch_race_from_threads() {
        let latch = std::sync::Arc::new(OutcomeLatch::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let latch = latch.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        latch.claim_exit()
                    } else {
                        latch.claim_breach()
                    }
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn arena_ignores_reserved_pids_and_dedups() {
        let arena = ProcessArena::new("run-a");
        arena.track_all([0, 1, 42, 42, 43]);
        assert_eq!(arena.tracked(), vec![42, 43]);
        assert_eq!(arena.run_id(), "run-a");
    }

    #[test]
    fn sweep_reports_survivors_after_deadline() {
        let arena = ProcessArena::new("run-b");
        arena.track_all([100, 200]);

        let survivors = arena.sweep(Duration::from_millis(20), |pid| pid == 200);
        assert_eq!(survivors, vec![200]);

        let survivors = arena.sweep(Duration::from_millis(20), |_| false);
        assert!(survivors.is_empty());
    }
}
