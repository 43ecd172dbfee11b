//! Host side of the process model: spawn the proxy, hand it the launch
//! request, and turn its pipes and exit into [`RunEvent`]s.
use crate::core::proxy::{LAUNCH_FD, STATUS_FD};
use crate::core::types::{LaunchRequest, OutcomeLatch, RunEvent, StatusEvent};
use crate::utils::output::{spawn_collector, CapturedStream};
use crossbeam_channel::Sender;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Why the proxy could not be started
#[derive(Debug)]
pub enum SpawnError {
    /// Host resource exhaustion; worth one retry
    Transient(std::io::Error),
    /// The proxy binary is missing or unusable
    Setup(std::io::Error),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Transient(e) => write!(f, "transient spawn failure: {}", e),
            SpawnError::Setup(e) => write!(f, "proxy unavailable: {}", e),
        }
    }
}

fn classify_spawn_error(err: std::io::Error) -> SpawnError {
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::ENOMEM) => SpawnError::Transient(err),
        _ => SpawnError::Setup(err),
    }
}

fn cloexec_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
    // SAFETY: pipe2 just returned these descriptors and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

/// A started proxy, waiting for its launch request
pub struct SpawnedProxy {
    child: Option<Child>,
    pid: i32,
    launch: Option<File>,
    status: Option<File>,
}

impl SpawnedProxy {
    /// Start `probebox --internal-role proxy`. The launch pipe's read end
    /// becomes fd 3 and the status pipe's write end fd 4; nothing else leaks.
    pub fn spawn(proxy_exe: &Path) -> Result<Self, SpawnError> {
        let (launch_read, launch_write) = cloexec_pipe().map_err(classify_spawn_error)?;
        let (status_read, status_write) = cloexec_pipe().map_err(classify_spawn_error)?;
        let launch_src = launch_read.as_raw_fd();
        let status_src = status_write.as_raw_fd();

        let mut command = Command::new(proxy_exe);
        command
            .args([
                "--internal-role",
                "proxy",
                "--launch-fd",
                &LAUNCH_FD.to_string(),
                "--status-fd",
                &STATUS_FD.to_string(),
            ])
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(move || {
                // Park both above the targets first so neither dup2 can
                // clobber the other's source.
                let launch = libc::fcntl(launch_src, libc::F_DUPFD, 10);
                let status = libc::fcntl(status_src, libc::F_DUPFD, 10);
                if launch < 0
                    || status < 0
                    || libc::dup2(launch, LAUNCH_FD) < 0
                    || libc::dup2(status, STATUS_FD) < 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(launch);
                libc::close(status);
                Ok(())
            });
        }

        let child = command.spawn().map_err(classify_spawn_error)?;
        drop(launch_read);
        drop(status_write);

        Ok(Self {
            pid: child.id() as i32,
            child: Some(child),
            launch: Some(File::from(launch_write)),
            status: Some(File::from(status_read)),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Send the request and close the launch pipe, releasing the proxy
    pub fn release(&mut self, request: &LaunchRequest) -> std::io::Result<()> {
        let mut launch = self.launch.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "launch request already sent")
        })?;
        let payload = serde_json::to_vec(request)?;
        launch.write_all(&payload)?;
        launch.flush()
    }

    /// Hand the pipes and the child to background threads. Every observation
    /// ends up on `events`.
    ///
    /// The proxy is reaped by pid, so a thread that fails to start never
    /// leaves it running unobserved.
    pub fn watch(
        mut self,
        stdin: Option<String>,
        output_limit: usize,
        latch: Arc<OutcomeLatch>,
        events: Sender<RunEvent>,
    ) -> std::io::Result<ProxyWatch> {
        let mut child = self.child.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "proxy already watched")
        })?;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdin_pipe = child.stdin.take();
        let status = self.status.take();
        // Dropping a Child neither kills nor reaps it
        drop(child);

        let pid = self.pid;
        let reaper_events = events.clone();
        let reaper = match thread::Builder::new()
            .name("probebox-reaper".to_string())
            .spawn(move || reap_proxy(pid, &reaper_events))
        {
            Ok(handle) => handle,
            Err(e) => {
                crate::kernel::signal::signal_process(pid, Signal::SIGKILL);
                let _ = waitpid(Pid::from_raw(pid), None);
                return Err(e);
            }
        };

        let started = (|| -> std::io::Result<ProxyWatch> {
            let stdout = stdout_pipe
                .map(|s| spawn_collector("stdout", s, output_limit))
                .transpose()?;
            let stderr = stderr_pipe
                .map(|s| spawn_collector("stderr", s, output_limit))
                .transpose()?;
            let mut threads = vec![reaper];
            if let Some(writer) = spawn_stdin_writer(stdin_pipe, stdin)? {
                threads.push(writer);
            }
            if let Some(status) = status {
                threads.push(spawn_status_reader(status, latch, events)?);
            }
            Ok(ProxyWatch {
                pid,
                stdout,
                stderr,
                threads,
            })
        })();

        if started.is_err() {
            // The reaper is running and will report the exit
            crate::kernel::signal::signal_process(pid, Signal::SIGKILL);
        }
        started
    }
}

fn reap_proxy(pid: i32, events: &Sender<RunEvent>) {
    let (exit_code, signal) = loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => break (Some(code), None),
            Ok(WaitStatus::Signaled(_, sig, _)) => break (None, Some(sig as i32)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break (None, None),
        }
    };
    let _ = events.send(RunEvent::ProxyExited { exit_code, signal });
}

impl Drop for SpawnedProxy {
    // A proxy that was never handed to `watch` is killed and reaped here
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn spawn_stdin_writer(
    pipe: Option<ChildStdin>,
    data: Option<String>,
) -> std::io::Result<Option<JoinHandle<()>>> {
    let mut pipe = match pipe {
        Some(pipe) => pipe,
        None => return Ok(None),
    };
    let handle = thread::Builder::new()
        .name("probebox-stdin".to_string())
        .spawn(move || {
            if let Some(data) = data {
                // EPIPE just means the payload stopped reading
                let _ = pipe.write_all(data.as_bytes());
            }
        })?;
    Ok(Some(handle))
}

fn spawn_status_reader(
    status: File,
    latch: Arc<OutcomeLatch>,
    events: Sender<RunEvent>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("probebox-status".to_string())
        .spawn(move || {
            let mut error = None;
            for line in BufReader::new(status).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        error = Some(e.to_string());
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StatusEvent>(&line) {
                    Ok(event) => {
                        if matches!(event, StatusEvent::PayloadExited { .. }) {
                            latch.claim_exit();
                        }
                        if events.send(RunEvent::Status(event)).is_err() {
                            return;
                        }
                    }
                    Err(e) => error = Some(format!("malformed status line: {}", e)),
                }
            }
            let _ = events.send(RunEvent::StatusClosed { error });
        })
}

/// Background threads attached to one proxy
pub struct ProxyWatch {
    pub pid: i32,
    stdout: Option<JoinHandle<CapturedStream>>,
    stderr: Option<JoinHandle<CapturedStream>>,
    threads: Vec<JoinHandle<()>>,
}

impl ProxyWatch {
    /// Join the collectors. Only call once the proxy tree is dead, or this
    /// blocks for as long as something holds the pipes open.
    pub fn collect(self, limit: usize) -> (CapturedStream, CapturedStream) {
        let stdout = crate::utils::output::join_collector(self.stdout, limit);
        let stderr = crate::utils::output::join_collector(self.stderr, limit);
        for handle in self.threads {
            let _ = handle.join();
        }
        (stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn missing_proxy_binary_is_a_setup_error() {
        match SpawnedProxy::spawn(Path::new("/nonexistent/probebox")) {
            Err(SpawnError::Setup(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("spawn of a missing binary succeeded"),
        }
    }

    #[test]
    fn exhaustion_errors_are_transient() {
        let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert!(matches!(classify_spawn_error(err), SpawnError::Transient(_)));
        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert!(matches!(classify_spawn_error(err), SpawnError::Setup(_)));
    }

    #[test]
    fn status_reader_claims_exit_before_forwarding() {
        let (read, write) = cloexec_pipe().unwrap();
        let mut write = File::from(write);
        writeln!(write, r#"{{"event":"spawned","init_pid":77}}"#).unwrap();
        writeln!(write, "garbage").unwrap();
        writeln!(
            write,
            r#"{{"event":"payload_exited","exit_code":0,"signal":null,"cpu_time_ms":1,"max_rss_kb":10}}"#
        )
        .unwrap();
        drop(write);

        let latch = Arc::new(OutcomeLatch::new());
        let (tx, rx) = unbounded();
        spawn_status_reader(File::from(read), latch.clone(), tx)
            .unwrap()
            .join()
            .unwrap();

        let events: Vec<RunEvent> = rx.try_iter().collect();
        assert_eq!(
            events[0],
            RunEvent::Status(StatusEvent::Spawned { init_pid: 77 })
        );
        assert!(matches!(
            events[1],
            RunEvent::Status(StatusEvent::PayloadExited { exit_code: Some(0), .. })
        ));
        assert!(matches!(
            &events[2],
            RunEvent::StatusClosed { error: Some(e) } if e.contains("malformed")
        ));
        assert!(latch.exit_observed());
    }

    #[test]
    fn watched_proxy_reports_exit_and_closed_status() {
        let mut proxy = match SpawnedProxy::spawn(Path::new("/bin/true")) {
            Ok(proxy) => proxy,
            Err(e) => {
                println!("skipping: cannot spawn /bin/true: {}", e);
                return;
            }
        };
        assert!(proxy.pid() > 1);
        let request = LaunchRequest {
            run_id: "watch-test".to_string(),
            policy: crate::config::types::ExecutionPolicy::default(),
            root_dir: std::path::PathBuf::from("/nonexistent"),
            command: vec!["/bin/true".to_string()],
            harness_is_root: false,
            cgroup_enforced: false,
            nproc_fallback: true,
        };
        // /bin/true may already be gone; a broken pipe is fine here
        let _ = proxy.release(&request);

        let (tx, rx) = unbounded();
        let watch = proxy
            .watch(None, 1024, Arc::new(OutcomeLatch::new()), tx)
            .unwrap();

        let mut exited = None;
        let mut closed = false;
        while exited.is_none() || !closed {
            match rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap() {
                RunEvent::ProxyExited { exit_code, .. } => exited = Some(exit_code),
                RunEvent::StatusClosed { error } => {
                    assert!(error.is_none());
                    closed = true;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(exited, Some(Some(0)));
        let (stdout, stderr) = watch.collect(1024);
        assert!(stdout.data.is_empty());
        assert!(stderr.data.is_empty());
    }
}
