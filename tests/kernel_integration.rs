//! Integration tests for the kernel primitives the payload chain relies on.
//!
//! Anything that needs namespaces is probed first; tests return early with a
//! note on hosts that cannot isolate.

use probebox::kernel::capabilities::{bounding_set, check_no_new_privs, set_no_new_privs};
use probebox::kernel::credentials::transition_to_unprivileged;
use probebox::kernel::host::HostCapabilities;
use probebox::kernel::signal::process_exists;
use std::path::Path;

#[test]
fn test_no_new_privs_is_sticky_and_idempotent() {
    let first = set_no_new_privs();
    let second = set_no_new_privs();
    assert_eq!(first.is_ok(), second.is_ok(), "set_no_new_privs should be idempotent");

    if first.is_ok() {
        assert!(check_no_new_privs().unwrap(), "no_new_privs should be set after success");
    } else {
        println!("set_no_new_privs unavailable here: {:?}", first);
    }
}

#[test]
fn test_credential_transition_refuses_root_before_any_syscall() {
    // Validation runs first, so these fail even for an unprivileged caller
    assert!(transition_to_unprivileged(0, 65534).is_err());
    assert!(transition_to_unprivileged(65534, 0).is_err());
}

#[test]
fn test_bounding_set_query_is_safe() {
    let caps = bounding_set();
    assert!(caps.len() <= 64);
}

#[test]
fn test_host_detection_is_consistent() {
    let host = HostCapabilities::detect(Path::new("/sys/fs/cgroup/probebox-test-missing"));
    assert!(!host.kernel_release.is_empty());
    assert!(!host.cgroup_delegated, "a missing cgroup root is never delegated");
    assert_eq!(host.can_isolate(), host.isolation_gap().is_none());

    if !host.can_isolate() {
        println!(
            "isolation unavailable on this host: {}",
            host.isolation_gap().unwrap_or_default()
        );
    }
}

#[test]
fn test_process_liveness_probe() {
    assert!(process_exists(std::process::id() as i32));

    let mut child = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg("exit 0")
        .spawn()
        .unwrap();
    let pid = child.id() as i32;
    child.wait().unwrap();
    assert!(!process_exists(pid), "a reaped child must not be reported alive");
}
