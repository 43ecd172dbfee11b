//! Syscall deny-list filtering (seccomp-BPF).
//!
//! The filter is a flat deny-list: every listed syscall returns `EPERM`,
//! everything else is allowed. Foreign architectures are killed outright.
//!
//! `execve` gets special treatment. The launcher must be able to exec the
//! payload once, after the filter is installed, while the payload itself must
//! never exec again. The filter therefore allows `execve` only when its path
//! argument is the exact address of a [`PinnedExecPath`], a read-only string
//! placed at a randomized address in the launcher. After a successful exec that
//! mapping is gone, so every later `execve` (including the one behind
//! `system()`) is refused.

use crate::config::types::{Result, SandboxError};
use std::ffi::CStr;

const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;

// struct seccomp_data offsets
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARG0_LO: u32 = 16;
const OFFSET_ARG0_HI: u32 = 20;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_00b7;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("seccomp deny filter is only defined for x86_64 and aarch64");

#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

const BPF_MAXINSNS: usize = 4096;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

const COMMON_SYSCALLS: &[(&str, libc::c_long)] = &[
    ("fchmod", libc::SYS_fchmod),
    ("fchmodat", libc::SYS_fchmodat),
    ("fchown", libc::SYS_fchown),
    ("fchownat", libc::SYS_fchownat),
    ("execve", libc::SYS_execve),
    ("execveat", libc::SYS_execveat),
    ("clone", libc::SYS_clone),
    ("clone3", libc::SYS_clone3),
    ("ptrace", libc::SYS_ptrace),
    ("mount", libc::SYS_mount),
    ("umount2", libc::SYS_umount2),
    ("pivot_root", libc::SYS_pivot_root),
    ("chroot", libc::SYS_chroot),
    ("unshare", libc::SYS_unshare),
    ("setns", libc::SYS_setns),
    ("kexec_load", libc::SYS_kexec_load),
    ("kexec_file_load", libc::SYS_kexec_file_load),
    ("init_module", libc::SYS_init_module),
    ("finit_module", libc::SYS_finit_module),
    ("delete_module", libc::SYS_delete_module),
    ("bpf", libc::SYS_bpf),
    ("perf_event_open", libc::SYS_perf_event_open),
    ("keyctl", libc::SYS_keyctl),
    ("add_key", libc::SYS_add_key),
    ("request_key", libc::SYS_request_key),
    ("reboot", libc::SYS_reboot),
    ("swapon", libc::SYS_swapon),
    ("swapoff", libc::SYS_swapoff),
    ("socket", libc::SYS_socket),
    ("socketpair", libc::SYS_socketpair),
    ("connect", libc::SYS_connect),
    ("bind", libc::SYS_bind),
    ("listen", libc::SYS_listen),
    ("accept", libc::SYS_accept),
    ("accept4", libc::SYS_accept4),
    ("sendto", libc::SYS_sendto),
    ("kill", libc::SYS_kill),
    ("tkill", libc::SYS_tkill),
    ("tgkill", libc::SYS_tgkill),
    ("setuid", libc::SYS_setuid),
    ("setgid", libc::SYS_setgid),
    ("setresuid", libc::SYS_setresuid),
    ("setresgid", libc::SYS_setresgid),
    ("setgroups", libc::SYS_setgroups),
    ("setsid", libc::SYS_setsid),
    ("setpgid", libc::SYS_setpgid),
    ("personality", libc::SYS_personality),
    ("userfaultfd", libc::SYS_userfaultfd),
    ("acct", libc::SYS_acct),
    ("quotactl", libc::SYS_quotactl),
    ("settimeofday", libc::SYS_settimeofday),
    ("clock_settime", libc::SYS_clock_settime),
    ("sethostname", libc::SYS_sethostname),
    ("setdomainname", libc::SYS_setdomainname),
    ("process_vm_readv", libc::SYS_process_vm_readv),
    ("process_vm_writev", libc::SYS_process_vm_writev),
    ("memfd_create", libc::SYS_memfd_create),
    ("linkat", libc::SYS_linkat),
    ("symlinkat", libc::SYS_symlinkat),
    ("unlinkat", libc::SYS_unlinkat),
    ("renameat", libc::SYS_renameat),
    ("mkdirat", libc::SYS_mkdirat),
    ("openat", libc::SYS_openat),
    ("truncate", libc::SYS_truncate),
    ("ftruncate", libc::SYS_ftruncate),
];

#[cfg(target_arch = "x86_64")]
const LEGACY_SYSCALLS: &[(&str, libc::c_long)] = &[
    ("chmod", libc::SYS_chmod),
    ("chown", libc::SYS_chown),
    ("lchown", libc::SYS_lchown),
    ("fork", libc::SYS_fork),
    ("vfork", libc::SYS_vfork),
    ("iopl", libc::SYS_iopl),
    ("ioperm", libc::SYS_ioperm),
    ("link", libc::SYS_link),
    ("symlink", libc::SYS_symlink),
    ("unlink", libc::SYS_unlink),
    ("rename", libc::SYS_rename),
    ("mkdir", libc::SYS_mkdir),
    ("rmdir", libc::SYS_rmdir),
    ("open", libc::SYS_open),
    ("creat", libc::SYS_creat),
];

// Architectures without the legacy path-based calls route them through *at().
#[cfg(not(target_arch = "x86_64"))]
const LEGACY_SYSCALLS: &[(&str, libc::c_long)] = &[];

/// Syscall number for a name on the running architecture
pub fn syscall_number(name: &str) -> Option<libc::c_long> {
    COMMON_SYSCALLS
        .iter()
        .chain(LEGACY_SYSCALLS.iter())
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, nr)| *nr)
        .or_else(|| legacy_alias(name))
}

// Names that only exist on x86_64 resolve to their *at() successor elsewhere,
// so one deny-list works on both architectures.
#[cfg(target_arch = "x86_64")]
fn legacy_alias(name: &str) -> Option<libc::c_long> {
    match name {
        "system" => Some(libc::SYS_execve),
        _ => None,
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn legacy_alias(name: &str) -> Option<libc::c_long> {
    match name {
        "system" => Some(libc::SYS_execve),
        "chmod" => Some(libc::SYS_fchmodat),
        "chown" | "lchown" => Some(libc::SYS_fchownat),
        "link" => Some(libc::SYS_linkat),
        "symlink" => Some(libc::SYS_symlinkat),
        "unlink" | "rmdir" => Some(libc::SYS_unlinkat),
        "rename" => Some(libc::SYS_renameat),
        "mkdir" => Some(libc::SYS_mkdirat),
        "open" | "creat" => Some(libc::SYS_openat),
        "fork" | "vfork" => Some(libc::SYS_clone),
        _ => None,
    }
}

/// Compiled deny-list program, ready to install
#[derive(Debug, Clone)]
pub struct DenyFilter {
    program: Vec<SockFilter>,
    denied: Vec<libc::c_long>,
    exec_gate: Option<u64>,
}

impl DenyFilter {
    /// Build the program. `exec_path` is the address of the one path that
    /// may still be passed to `execve`; `None` denies it unconditionally.
    pub fn build(names: &[String], exec_path: Option<u64>) -> Result<Self> {
        let mut denied: Vec<libc::c_long> = Vec::with_capacity(names.len());
        for name in names {
            let nr = syscall_number(name).ok_or_else(|| {
                SandboxError::Seccomp(format!(
                    "unknown syscall '{}' for {}",
                    name,
                    std::env::consts::ARCH
                ))
            })?;
            if !denied.contains(&nr) {
                denied.push(nr);
            }
        }

        let errno = SECCOMP_RET_ERRNO | (libc::EPERM as u32 & 0xffff);
        let gate_exec = exec_path.is_some() && denied.contains(&libc::SYS_execve);

        let mut program = vec![
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_CURRENT, 1, 0),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR),
        ];

        #[cfg(target_arch = "x86_64")]
        {
            program.push(SockFilter::jump(
                BPF_JMP | BPF_JGE | BPF_K,
                X32_SYSCALL_BIT,
                0,
                1,
            ));
            program.push(SockFilter::stmt(BPF_RET | BPF_K, errno));
        }

        for nr in &denied {
            if gate_exec && *nr == libc::SYS_execve {
                continue;
            }
            program.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, *nr as u32, 0, 1));
            program.push(SockFilter::stmt(BPF_RET | BPF_K, errno));
        }

        let exec_gate = if gate_exec { exec_path } else { None };
        if let Some(address) = exec_gate {
            let lo = (address & 0xffff_ffff) as u32;
            let hi = (address >> 32) as u32;
            program.extend_from_slice(&[
                SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, libc::SYS_execve as u32, 0, 6),
                SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARG0_LO),
                SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, lo, 0, 3),
                SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARG0_HI),
                SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, hi, 0, 1),
                SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
                SockFilter::stmt(BPF_RET | BPF_K, errno),
            ]);
        }

        program.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));

        if program.len() > BPF_MAXINSNS {
            return Err(SandboxError::Seccomp(format!(
                "deny filter too large: {} instructions",
                program.len()
            )));
        }

        Ok(Self {
            program,
            denied,
            exec_gate,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.denied.is_empty()
    }

    pub fn denied(&self) -> &[libc::c_long] {
        &self.denied
    }

    pub fn instructions(&self) -> &[SockFilter] {
        &self.program
    }

    pub fn exec_gate(&self) -> Option<u64> {
        self.exec_gate
    }

    /// Install on the calling thread. Requires no_new_privs.
    pub fn install(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let prog = SockFprog {
            len: self.program.len() as u16,
            filter: self.program.as_ptr(),
        };

        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(SandboxError::Seccomp(format!(
                "PR_SET_NO_NEW_PRIVS failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let rc = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                0 as libc::c_uint,
                &prog as *const SockFprog,
            )
        };
        if rc != 0 {
            return Err(SandboxError::Seccomp(format!(
                "seccomp(SET_MODE_FILTER) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// Whether the running kernel accepts seccomp filters
pub fn is_seccomp_supported() -> bool {
    let rc = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) };
    rc >= 0
}

/// NUL-terminated path in a private read-only page at a random address.
///
/// The page is never unmapped; it disappears with the address space on exec.
pub struct PinnedExecPath {
    ptr: *const libc::c_char,
}

const PAGE_SIZE: usize = 4096;

impl PinnedExecPath {
    pub fn new(path: &CStr) -> Result<Self> {
        let bytes = path.to_bytes_with_nul();
        if bytes.len() > PAGE_SIZE / 2 {
            return Err(SandboxError::Seccomp(format!(
                "exec path too long to pin: {} bytes",
                bytes.len()
            )));
        }

        let mut seed = [0u8; 16];
        let got = unsafe {
            libc::getrandom(seed.as_mut_ptr() as *mut libc::c_void, seed.len(), 0)
        };
        if got != seed.len() as isize {
            return Err(SandboxError::Seccomp(format!(
                "getrandom failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let mut hint_bytes = [0u8; 8];
        hint_bytes.copy_from_slice(&seed[..8]);
        let mut offset_bytes = [0u8; 8];
        offset_bytes.copy_from_slice(&seed[8..]);

        let hint = (0x1000_0000_0000u64 + u64::from_ne_bytes(hint_bytes) % 0x5000_0000_0000u64)
            & !(PAGE_SIZE as u64 - 1);
        let offset = (u64::from_ne_bytes(offset_bytes) as usize % (PAGE_SIZE - bytes.len())) & !7;

        let page = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if page == libc::MAP_FAILED {
            return Err(SandboxError::Seccomp(format!(
                "mmap for exec path failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: page is a fresh PAGE_SIZE mapping and offset + len <= PAGE_SIZE.
        let dst = unsafe { (page as *mut u8).add(offset) };
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            libc::mprotect(page, PAGE_SIZE, libc::PROT_READ);
        }

        Ok(Self {
            ptr: dst as *const libc::c_char,
        })
    }

    pub fn as_ptr(&self) -> *const libc::c_char {
        self.ptr
    }

    pub fn address(&self) -> u64 {
        self.ptr as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_names_on_every_supported_arch() {
        for name in ["chmod", "fchmodat", "execve", "execveat", "ptrace", "mount", "system"] {
            assert!(syscall_number(name).is_some(), "{} should resolve", name);
        }
        assert!(syscall_number("frobnicate").is_none());
        assert_eq!(syscall_number("system"), Some(libc::SYS_execve));
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(DenyFilter::build(&names(&["nope"]), None).is_err());
    }

    #[test]
    fn empty_list_builds_an_allow_all_program() {
        let filter = DenyFilter::build(&[], None).unwrap();
        assert!(filter.is_empty());
        let last = filter.instructions().last().unwrap();
        assert_eq!(last.k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn every_denied_syscall_returns_eperm() {
        let filter = DenyFilter::build(&names(&["fchmodat", "ptrace", "ptrace"]), None).unwrap();
        assert_eq!(filter.denied().len(), 2);

        let errno = SECCOMP_RET_ERRNO | libc::EPERM as u32;
        for nr in [libc::SYS_fchmodat, libc::SYS_ptrace] {
            let idx = filter
                .instructions()
                .iter()
                .position(|i| i.code == (BPF_JMP | BPF_JEQ | BPF_K) && i.k == nr as u32)
                .expect("comparison present");
            assert_eq!(filter.instructions()[idx].jf, 1);
            assert_eq!(filter.instructions()[idx + 1].k, errno);
        }
    }

    #[test]
    fn foreign_architecture_is_killed() {
        let filter = DenyFilter::build(&names(&["ptrace"]), None).unwrap();
        let program = filter.instructions();
        assert_eq!(program[0].k, OFFSET_ARCH);
        assert_eq!(program[1].k, AUDIT_ARCH_CURRENT);
        assert_eq!(program[2].k, SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn exec_gate_matches_both_pointer_halves() {
        let address = 0x1234_5678_9abc_def0u64;
        let filter = DenyFilter::build(&names(&["execve", "chmod"]), Some(address)).unwrap();
        assert_eq!(filter.exec_gate(), Some(address));

        let program = filter.instructions();
        let gate = program
            .iter()
            .position(|i| i.k == libc::SYS_execve as u32 && i.jf == 6)
            .expect("exec gate present");
        assert_eq!(program[gate + 2].k, 0x9abc_def0);
        assert_eq!(program[gate + 4].k, 0x1234_5678);
        assert_eq!(program[gate + 5].k, SECCOMP_RET_ALLOW);
        assert_eq!(program[gate + 7].k, SECCOMP_RET_ALLOW);
        assert_eq!(gate + 8, program.len());
    }

    #[test]
    fn exec_without_gate_is_plainly_denied() {
        let filter = DenyFilter::build(&names(&["execve"]), None).unwrap();
        assert_eq!(filter.exec_gate(), None);
        assert!(!filter.instructions().iter().any(|i| i.k == OFFSET_ARG0_HI));
    }

    #[test]
    fn pinned_path_is_readable_at_its_address() {
        let path = CString::new("/usr/bin/python3").unwrap();
        let pinned = PinnedExecPath::new(&path).unwrap();
        let read_back = unsafe { CStr::from_ptr(pinned.as_ptr()) };
        assert_eq!(read_back, path.as_c_str());
        assert_eq!(pinned.address() % 8, 0);
    }

    #[test]
    fn seccomp_support_probe_does_not_panic() {
        let _ = is_seccomp_supported();
    }
}
