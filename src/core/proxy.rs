//! Sandbox side of the process model: proxy -> init -> payload.
//!
//! None of this code may log: the proxy's stdio is the payload's stdio.
//! Diagnostics travel as [`StatusEvent`] lines on the status fd.
use crate::config::types::{NetworkMode, Result, SandboxError};
use crate::core::types::{LaunchRequest, StatusEvent};
use crate::exec::preexec::Payload;
use crate::kernel::mount::SandboxRoot;
use crate::kernel::namespace::{
    bring_up_loopback, harden_mount_propagation, set_sandbox_hostname, NamespacePlan,
};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setpgid, setsid, ForkResult, Pid};
use std::fs::File;
use std::io::Read;
use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;

/// Descriptor numbers the harness hands to the proxy
pub const LAUNCH_FD: RawFd = 3;
pub const STATUS_FD: RawFd = 4;

/// Exit code of a payload whose execve failed
pub const EXEC_FAILED_EXIT: i32 = 127;
/// Exit code of a sandbox process that failed before exec
pub const SETUP_FAILED_EXIT: i32 = 126;

const MAX_ERROR_LEN: usize = 1024;

/// Write one status line. A lost line is detected host-side as a missing
/// event, so failures here are ignored.
pub fn emit(fd: RawFd, event: &StatusEvent) {
    let event = match event {
        StatusEvent::SetupFailed { stage, error } if error.len() > MAX_ERROR_LEN => {
            let mut cut = MAX_ERROR_LEN;
            while !error.is_char_boundary(cut) {
                cut -= 1;
            }
            StatusEvent::SetupFailed {
                stage: stage.clone(),
                error: error[..cut].to_string(),
            }
        }
        other => other.clone(),
    };
    let mut line = match serde_json::to_vec(&event) {
        Ok(line) => line,
        Err(_) => return,
    };
    line.push(b'\n');
    // One write below PIPE_BUF is atomic with respect to the other writers
    unsafe { libc::write(fd, line.as_ptr() as *const libc::c_void, line.len()) };
}

pub fn read_launch_request(fd: RawFd) -> Result<LaunchRequest> {
    // SAFETY: the fd was dup2'd for us by the harness and is read exactly once.
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    serde_json::from_slice(&data)
        .map_err(|e| SandboxError::Protocol(format!("failed to decode launch request: {}", e)))
}

fn set_parent_death_signal() -> Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) };
    if rc != 0 {
        return Err(SandboxError::Process(format!(
            "Failed to set parent death signal: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn exit_code_of(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Entry point of `probebox --internal-role proxy`. Returns the exit code.
pub fn run_proxy_role(launch_fd: RawFd, status_fd: RawFd) -> i32 {
    let request = match read_launch_request(launch_fd) {
        Ok(request) => request,
        Err(e) => {
            emit(status_fd, &StatusEvent::setup_failed("launch_request", e));
            return SETUP_FAILED_EXIT;
        }
    };

    match run_proxy(&request, status_fd) {
        Ok(code) => code,
        Err((stage, e)) => {
            emit(status_fd, &StatusEvent::setup_failed(stage, e));
            SETUP_FAILED_EXIT
        }
    }
}

type StageResult<T> = std::result::Result<T, (&'static str, SandboxError)>;

fn stage<T>(name: &'static str, result: Result<T>) -> StageResult<T> {
    result.map_err(|e| (name, e))
}

fn run_proxy(request: &LaunchRequest, status_fd: RawFd) -> StageResult<i32> {
    stage("setsid", setsid().map(|_| ()).map_err(SandboxError::from))?;
    stage("pdeathsig", set_parent_death_signal())?;

    let plan = NamespacePlan::for_run(request.policy.network, request.harness_is_root);
    stage("namespaces", plan.apply())?;

    // CLONE_NEWPID applies to children: the next fork becomes PID 1
    let init_pid = match stage("fork_init", unsafe { fork() }.map_err(SandboxError::from))? {
        ForkResult::Child => {
            let code = run_init(request, &plan, status_fd);
            unsafe { libc::_exit(code) };
        }
        ForkResult::Parent { child } => child,
    };
    emit(
        status_fd,
        &StatusEvent::Spawned {
            init_pid: init_pid.as_raw(),
        },
    );

    loop {
        match waitpid(init_pid, None) {
            Ok(status) => {
                if let Some(code) = exit_code_of(status) {
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(("wait_init", SandboxError::from(e))),
        }
    }
}

/// PID 1 of the sandbox. Builds the root, forks the payload, reaps
/// everything, and reports the payload's exit.
fn run_init(request: &LaunchRequest, plan: &NamespacePlan, status_fd: RawFd) -> i32 {
    match prepare_init(request, plan) {
        Ok((skipped, pivoted)) => {
            emit(status_fd, &StatusEvent::RootReady { skipped, pivoted });
        }
        Err((stage, e)) => {
            emit(status_fd, &StatusEvent::setup_failed(stage, e));
            return SETUP_FAILED_EXIT;
        }
    }

    let payload_pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => run_payload(request, status_fd),
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            emit(status_fd, &StatusEvent::setup_failed("fork_payload", e));
            return SETUP_FAILED_EXIT;
        }
    };
    emit(status_fd, &StatusEvent::PayloadStarted);

    reap_until_payload_exits(payload_pid, status_fd)
}

fn prepare_init(
    request: &LaunchRequest,
    plan: &NamespacePlan,
) -> StageResult<(Vec<std::path::PathBuf>, bool)> {
    stage("pdeathsig", set_parent_death_signal())?;
    // Host-side group signals address this process group
    stage(
        "setpgid",
        setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(SandboxError::from),
    )?;

    if plan.uts {
        stage("hostname", set_sandbox_hostname())?;
    }
    if request.policy.network == NetworkMode::Loopback {
        stage("loopback", bring_up_loopback())?;
    }
    stage("mount_propagation", harden_mount_propagation())?;

    let box_owner = request
        .harness_is_root
        .then_some((request.policy.sandbox_uid, request.policy.sandbox_gid));
    let root = SandboxRoot::new(
        request.root_dir.clone(),
        request.policy.filesystem.clone(),
        box_owner,
    );
    let report = stage("root", root.build())?;
    let pivoted = stage("enter_root", root.enter())?;
    Ok((report.skipped, pivoted))
}

fn run_payload(request: &LaunchRequest, status_fd: RawFd) -> ! {
    let ready = Payload::prepare(request)
        .and_then(Payload::apply_limits)
        .and_then(Payload::drop_credentials)
        .and_then(Payload::lock_privileges)
        .and_then(Payload::install_syscall_filter);

    let code = match ready {
        Ok(ready) => {
            let errno = ready.exec();
            emit(status_fd, &StatusEvent::ExecFailed { errno: errno as i32 });
            EXEC_FAILED_EXIT
        }
        Err(e) => {
            emit(status_fd, &StatusEvent::setup_failed("payload", e));
            SETUP_FAILED_EXIT
        }
    };
    unsafe { libc::_exit(code) }
}

fn reap_until_payload_exits(payload_pid: Pid, status_fd: RawFd) -> i32 {
    loop {
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let pid = unsafe { libc::wait4(-1, &mut status, 0, &mut usage) };

        if pid < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                e => {
                    emit(status_fd, &StatusEvent::setup_failed("wait_payload", e));
                    return SETUP_FAILED_EXIT;
                }
            }
        }
        if pid != payload_pid.as_raw() {
            // orphan re-parented to us
            continue;
        }

        let (exit_code, signal) = if libc::WIFEXITED(status) {
            (Some(libc::WEXITSTATUS(status)), None)
        } else if libc::WIFSIGNALED(status) {
            (None, Some(libc::WTERMSIG(status)))
        } else {
            continue;
        };
        let cpu_time_ms = timeval_ms(usage.ru_utime) + timeval_ms(usage.ru_stime);
        emit(
            status_fd,
            &StatusEvent::PayloadExited {
                exit_code,
                signal,
                cpu_time_ms,
                max_rss_kb: usage.ru_maxrss.max(0) as u64,
            },
        );
        // Leaving PID 1 tears down every remaining namespace member
        return 0;
    }
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000
}
