//! Signal plumbing: process-group delivery for the monitor, and an
//! async-safe shutdown flag for the batch front end.
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// What the harness did to stop a run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Deliver `sig` to every member of process group `pgid`.
///
/// Returns false when the group no longer exists.
pub fn signal_group(pgid: i32, sig: Signal) -> bool {
    if pgid <= 1 {
        return false;
    }
    signal::killpg(Pid::from_raw(pgid), sig).is_ok()
}

pub fn signal_process(pid: i32, sig: Signal) -> bool {
    if pid <= 1 {
        return false;
    }
    signal::kill(Pid::from_raw(pid), sig).is_ok()
}

/// True while `pid` exists (zombies included)
pub fn process_exists(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// SIGINT/SIGTERM/SIGHUP handler that only records the request.
///
/// Batch runs stop queueing new cases once it is set; runs already in flight
/// still finish and tear down.
pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers. Call before spawning threads.
    pub fn init() -> Result<Self, String> {
        let action = SigAction::new(
            SigHandler::Handler(Self::record),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only stores to atomics.
            unsafe { signal::sigaction(sig, &action) }
                .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
        }
        Ok(Self)
    }

    extern "C" fn record(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn received(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}
