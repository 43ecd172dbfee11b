use crate::config::types::{ExecutionPolicy, Result, SandboxError};
use crate::core::types::LaunchRequest;
/// Payload pre-exec chain
///
/// Runs in the freshly forked payload, after sandbox init has built and
/// entered the restricted root. The order is fixed:
/// 1. rlimits, umask, signal dispositions, close-on-exec for fds >= 3
/// 2. bounding set cleared, then (as root) setresgid/setresuid
/// 3. remaining capabilities cleared, no_new_privs
/// 4. seccomp deny filter, with execve pinned to the payload path
/// 5. execve
///
/// Each step consumes the previous state; only `Payload<ExecReady>` can exec.
use crate::kernel::capabilities::{
    check_no_new_privs, clear_process_capabilities, restrict_bounding_set, set_no_new_privs,
};
use crate::kernel::credentials::transition_to_unprivileged;
use crate::kernel::seccomp::{DenyFilter, PinnedExecPath};
use crate::utils::env_hygiene::{sandbox_environment, to_envp, PAYLOAD_UMASK};
use crate::utils::fd_closure::mark_cloexec_from;
use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use std::ffi::CString;
use std::marker::PhantomData;

/// One resource limit applied in the payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitSetting {
    pub name: &'static str,
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

impl RlimitSetting {
    fn exact(name: &'static str, resource: Resource, value: u64) -> Self {
        Self {
            name,
            resource,
            soft: value,
            hard: value,
        }
    }
}

/// Rlimits for a run. Memory and process count fall back to RLIMIT_AS and
/// RLIMIT_NPROC only when the cgroup is not enforcing them. RLIMIT_NPROC
/// counts every process of the real uid, so it is only set when
/// `nproc_fallback` says that uid is private to the run.
pub fn rlimit_plan(
    policy: &ExecutionPolicy,
    cgroup_enforced: bool,
    nproc_fallback: bool,
) -> Vec<RlimitSetting> {
    let mut plan = vec![RlimitSetting::exact("RLIMIT_CORE", Resource::RLIMIT_CORE, 0)];

    if let Some(cpu_ms) = policy.cpu_time_limit_ms {
        // soft -> SIGXCPU, hard -> SIGKILL one second later
        let secs = cpu_ms.div_ceil(1000).max(1);
        plan.push(RlimitSetting {
            name: "RLIMIT_CPU",
            resource: Resource::RLIMIT_CPU,
            soft: secs,
            hard: secs + 1,
        });
    }
    if let Some(bytes) = policy.max_file_size_bytes {
        plan.push(RlimitSetting::exact("RLIMIT_FSIZE", Resource::RLIMIT_FSIZE, bytes));
    }
    if let Some(files) = policy.max_open_files {
        plan.push(RlimitSetting::exact("RLIMIT_NOFILE", Resource::RLIMIT_NOFILE, files));
    }
    if let Some(bytes) = policy.stack_limit_bytes {
        plan.push(RlimitSetting::exact("RLIMIT_STACK", Resource::RLIMIT_STACK, bytes));
    }

    if !cgroup_enforced {
        if let Some(bytes) = policy.memory_limit_bytes {
            plan.push(RlimitSetting::exact("RLIMIT_AS", Resource::RLIMIT_AS, bytes));
        }
        if let Some(count) = policy.max_processes.filter(|_| nproc_fallback) {
            plan.push(RlimitSetting::exact(
                "RLIMIT_NPROC",
                Resource::RLIMIT_NPROC,
                count as u64,
            ));
        }
    }
    plan
}

/// Type-state marker: forked, nothing applied yet
pub struct Fresh;

/// Type-state marker: rlimits and process hygiene applied
pub struct Limited;

/// Type-state marker: running as the sandbox identity
pub struct CredsDropped;

/// Type-state marker: no capabilities, no_new_privs set
pub struct PrivsLocked;

/// Type-state marker: seccomp installed, nothing left but execve
pub struct ExecReady;

/// The payload process on its way to execve
pub struct Payload<S> {
    argv: Vec<CString>,
    envp: Vec<CString>,
    rlimits: Vec<RlimitSetting>,
    credentials: Option<(u32, u32)>,
    deny_list: Vec<String>,
    pinned: Option<PinnedExecPath>,
    _state: PhantomData<S>,
}

impl<S> Payload<S> {
    fn advance<T>(self) -> Payload<T> {
        Payload {
            argv: self.argv,
            envp: self.envp,
            rlimits: self.rlimits,
            credentials: self.credentials,
            deny_list: self.deny_list,
            pinned: self.pinned,
            _state: PhantomData,
        }
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn envp(&self) -> &[CString] {
        &self.envp
    }

    pub fn rlimits(&self) -> &[RlimitSetting] {
        &self.rlimits
    }
}

impl Payload<Fresh> {
    /// Convert the request into C strings before any process state changes
    pub fn prepare(request: &LaunchRequest) -> Result<Self> {
        if request.command.is_empty() {
            return Err(SandboxError::Config("empty payload command".to_string()));
        }
        let argv = request
            .command
            .iter()
            .map(|arg| {
                CString::new(arg.as_str()).map_err(|_| {
                    SandboxError::Config(format!("argument contains NUL byte: {:?}", arg))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let envp = to_envp(&sandbox_environment(&request.policy.environment))?;
        let credentials = request
            .harness_is_root
            .then_some((request.policy.sandbox_uid, request.policy.sandbox_gid));

        Ok(Self {
            argv,
            envp,
            rlimits: rlimit_plan(
                &request.policy,
                request.cgroup_enforced,
                request.nproc_fallback,
            ),
            credentials,
            deny_list: request.policy.syscall_deny_list.clone(),
            pinned: None,
            _state: PhantomData,
        })
    }

    pub fn apply_limits(self) -> Result<Payload<Limited>> {
        for limit in &self.rlimits {
            setrlimit(limit.resource, limit.soft, limit.hard).map_err(|e| {
                SandboxError::Process(format!(
                    "Failed to apply {}={} (hard={}): {}",
                    limit.name, limit.soft, limit.hard, e
                ))
            })?;
        }

        unsafe { libc::umask(PAYLOAD_UMASK) };
        reset_signal_dispositions()?;
        mark_cloexec_from(3)?;

        Ok(self.advance())
    }
}

/// Dispositions survive execve, and the proxy binary ignores SIGPIPE like
/// every Rust program. Restore defaults and unblock everything.
fn reset_signal_dispositions() -> Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in Signal::iterator() {
        if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: installing SIG_DFL has no handler to race with.
        unsafe { sigaction(sig, &default) }.map_err(|e| {
            SandboxError::Process(format!("Failed to reset {} disposition: {}", sig, e))
        })?;
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|e| SandboxError::Process(format!("Failed to clear signal mask: {}", e)))?;
    Ok(())
}

impl Payload<Limited> {
    /// The bounding set needs CAP_SETPCAP, so it goes before the uid change.
    pub fn drop_credentials(self) -> Result<Payload<CredsDropped>> {
        restrict_bounding_set()?;
        if let Some((uid, gid)) = self.credentials {
            transition_to_unprivileged(uid, gid)?;
        }
        Ok(self.advance())
    }
}

impl Payload<CredsDropped> {
    pub fn lock_privileges(self) -> Result<Payload<PrivsLocked>> {
        clear_process_capabilities()?;
        set_no_new_privs()?;
        if !check_no_new_privs()? {
            return Err(SandboxError::Privilege(
                "PR_SET_NO_NEW_PRIVS verification failed".to_string(),
            ));
        }
        Ok(self.advance())
    }
}

impl Payload<PrivsLocked> {
    /// Pin the program path and install the deny filter. With `execve` on the
    /// deny-list, only the pinned pointer still passes.
    pub fn install_syscall_filter(mut self) -> Result<Payload<ExecReady>> {
        let pinned = PinnedExecPath::new(&self.argv[0])?;
        let filter = DenyFilter::build(&self.deny_list, Some(pinned.address()))?;
        filter.install()?;
        self.pinned = Some(pinned);
        Ok(self.advance())
    }
}

impl Payload<ExecReady> {
    /// Replace the process image. Only returns on failure.
    pub fn exec(self) -> Errno {
        let path = match &self.pinned {
            Some(pinned) => pinned.as_ptr(),
            None => return Errno::EINVAL,
        };

        let mut argv: Vec<*const libc::c_char> = self.argv.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());
        let mut envp: Vec<*const libc::c_char> = self.envp.iter().map(|e| e.as_ptr()).collect();
        envp.push(std::ptr::null());

        // SAFETY: argv/envp are NULL-terminated and outlive the call; path
        // points into the pinned page.
        unsafe { libc::execve(path, argv.as_ptr(), envp.as_ptr()) };
        Errno::last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn request(policy: ExecutionPolicy, is_root: bool, cgroup: bool) -> LaunchRequest {
        LaunchRequest {
            run_id: "run-test".to_string(),
            policy,
            root_dir: PathBuf::from("/tmp/root"),
            command: vec!["/box/main".to_string(), "infinite".to_string()],
            harness_is_root: is_root,
            cgroup_enforced: cgroup,
            nproc_fallback: true,
        }
    }

    fn names(plan: &[RlimitSetting]) -> Vec<&'static str> {
        plan.iter().map(|l| l.name).collect()
    }

    #[test]
    fn cpu_limit_has_one_second_hard_headroom() {
        let policy = ExecutionPolicy {
            cpu_time_limit_ms: Some(2500),
            ..ExecutionPolicy::default()
        };
        let plan = rlimit_plan(&policy, true, true);
        let cpu = plan.iter().find(|l| l.name == "RLIMIT_CPU").unwrap();
        assert_eq!((cpu.soft, cpu.hard), (3, 4));
    }

    #[test]
    fn sub_second_cpu_limit_rounds_up_to_one() {
        let policy = ExecutionPolicy {
            cpu_time_limit_ms: Some(200),
            ..ExecutionPolicy::default()
        };
        let cpu = rlimit_plan(&policy, true, true)
            .into_iter()
            .find(|l| l.name == "RLIMIT_CPU")
            .unwrap();
        assert_eq!(cpu.soft, 1);
    }

    #[test]
    fn memory_and_nproc_rlimits_only_without_cgroup() {
        let policy = ExecutionPolicy::default();
        let with_cgroup = names(&rlimit_plan(&policy, true, true));
        assert!(!with_cgroup.contains(&"RLIMIT_AS"));
        assert!(!with_cgroup.contains(&"RLIMIT_NPROC"));
        assert!(with_cgroup.contains(&"RLIMIT_CORE"));
        assert!(with_cgroup.contains(&"RLIMIT_FSIZE"));

        let without = rlimit_plan(&policy, false, true);
        let nproc = without.iter().find(|l| l.name == "RLIMIT_NPROC").unwrap();
        assert_eq!(nproc.soft, 16);
        assert!(names(&without).contains(&"RLIMIT_AS"));
    }

    #[test]
    fn nproc_is_skipped_when_the_uid_is_shared() {
        let policy = ExecutionPolicy::default();
        let shared = names(&rlimit_plan(&policy, false, false));
        assert!(!shared.contains(&"RLIMIT_NPROC"));
        assert!(shared.contains(&"RLIMIT_AS"));

        let mut req = request(policy, true, false);
        req.nproc_fallback = false;
        assert!(!names(Payload::prepare(&req).unwrap().rlimits()).contains(&"RLIMIT_NPROC"));
    }

    #[test]
    fn prepare_builds_clean_environment_and_credentials() {
        let mut policy = ExecutionPolicy::default();
        policy.environment = BTreeMap::from([("PROBE".to_string(), "1".to_string())]);

        let payload = Payload::prepare(&request(policy.clone(), true, true)).unwrap();
        assert_eq!(payload.argv()[0].to_str().unwrap(), "/box/main");
        assert!(payload
            .envp()
            .iter()
            .any(|e| e.to_str().unwrap() == "PROBE=1"));
        assert_eq!(payload.credentials, Some((65534, 65534)));

        let unprivileged = Payload::prepare(&request(policy, false, true)).unwrap();
        assert_eq!(unprivileged.credentials, None);
    }

    #[test]
    fn prepare_rejects_empty_and_nul_commands() {
        let mut req = request(ExecutionPolicy::default(), false, true);
        req.command.clear();
        assert!(Payload::prepare(&req).is_err());

        req.command = vec!["/box/a\0b".to_string()];
        assert!(Payload::prepare(&req).is_err());
    }

    #[test]
    fn chain_runs_to_exec_in_forked_child() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};

        let mut policy = ExecutionPolicy::default();
        policy.syscall_deny_list = vec!["execve".to_string(), "chmod".to_string()];
        let mut req = request(policy, false, true);
        req.command = vec!["/bin/true".to_string()];
        let payload = Payload::prepare(&req).unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match payload
                    .apply_limits()
                    .and_then(Payload::drop_credentials)
                    .and_then(Payload::lock_privileges)
                    .and_then(Payload::install_syscall_filter)
                {
                    Ok(ready) => {
                        ready.exec();
                        126
                    }
                    // Hosts without seccomp or prctl access skip the check
                    Err(_) => 0,
                };
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }
}
