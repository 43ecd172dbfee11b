// Policy validation. Runs before any sandbox resource is created, so a bad
// policy is rejected as an invalid submission instead of half-building a run.

use crate::config::types::{ExecutionPolicy, NetworkMode, PathAccess, Result, SandboxError};
use std::path::{Component, Path};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into a `Result`, logging warnings along the way
    pub fn into_result(self) -> Result<Vec<String>> {
        for warning in &self.warnings {
            log::warn!("Policy warning: {}", warning);
        }
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(SandboxError::Config(format!(
                "policy validation failed:\n{}",
                self.errors.join("\n")
            )))
        }
    }
}

/// Validate every field of a policy
pub fn validate_policy(policy: &ExecutionPolicy) -> ValidationResult {
    let mut result = ValidationResult::new();
    validate_limits(policy, &mut result);
    validate_filesystem(policy, &mut result);
    validate_syscalls(policy, &mut result);
    validate_environment(policy, &mut result);
    result
}

fn validate_limits(policy: &ExecutionPolicy, result: &mut ValidationResult) {
    if policy.wall_time_limit_ms == 0 {
        result.add_error("wall_time_limit_ms cannot be zero".to_string());
    }

    if !(10..=250).contains(&policy.sample_interval_ms) {
        result.add_error(format!(
            "sample_interval_ms must be within 10..=250, got {}",
            policy.sample_interval_ms
        ));
    }

    if let Some(cpu) = policy.cpu_time_limit_ms {
        if cpu == 0 {
            result.add_error("cpu_time_limit_ms cannot be zero".to_string());
        }
        if cpu > policy.wall_time_limit_ms {
            result.add_warning(format!(
                "cpu_time_limit_ms ({}) exceeds wall_time_limit_ms ({}); the wall limit will fire first",
                cpu, policy.wall_time_limit_ms
            ));
        }
    }

    if let Some(memory) = policy.memory_limit_bytes {
        if memory == 0 {
            result.add_error("memory_limit_bytes cannot be zero".to_string());
        } else if memory < 4 * 1024 * 1024 {
            result.add_warning(format!(
                "memory_limit_bytes {} is below 4 MiB; most runtimes will not start",
                memory
            ));
        }
    }

    if policy.max_processes == Some(0) {
        result.add_error("max_processes cannot be zero".to_string());
    }

    if policy.output_limit_bytes == 0 {
        result.add_error("output_limit_bytes cannot be zero".to_string());
    }

    if policy.max_open_files == Some(0) {
        result.add_error("max_open_files cannot be zero".to_string());
    }
}

fn validate_filesystem(policy: &ExecutionPolicy, result: &mut ValidationResult) {
    for rule in &policy.filesystem.allow {
        if !rule.path.is_absolute() {
            result.add_error(format!(
                "allow-list path must be absolute: {}",
                rule.path.display()
            ));
            continue;
        }
        if rule
            .path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            result.add_error(format!(
                "allow-list path must not contain '..': {}",
                rule.path.display()
            ));
        }
        if rule.path == Path::new("/") {
            result.add_error("allow-list must not expose the host root".to_string());
        }
        if rule.path.starts_with("/box") || rule.path.starts_with("/dev") {
            result.add_error(format!(
                "allow-list path collides with a sandbox-managed mount: {}",
                rule.path.display()
            ));
        }
        if policy.filesystem.mount_proc && rule.path.starts_with("/proc") {
            result.add_error(format!(
                "allow-list path is hidden by the sandbox /proc mount: {}",
                rule.path.display()
            ));
        }
        if rule.access == PathAccess::ReadWrite {
            result.add_warning(format!(
                "host path {} is writable from inside the sandbox",
                rule.path.display()
            ));
        }
    }

    if policy.filesystem.mount_proc {
        result.add_warning(
            "mount_proc exposes /proc/version and friends to the sandboxed program".to_string(),
        );
    }

    if policy.network == NetworkMode::Unrestricted {
        result.add_warning("network is unrestricted for this policy".to_string());
    }
}

fn validate_syscalls(policy: &ExecutionPolicy, result: &mut ValidationResult) {
    for name in &policy.syscall_deny_list {
        if crate::kernel::seccomp::syscall_number(name).is_none() {
            result.add_error(format!(
                "unknown syscall '{}' in deny-list for {}",
                name,
                std::env::consts::ARCH
            ));
        }
    }
}

fn validate_environment(policy: &ExecutionPolicy, result: &mut ValidationResult) {
    for (key, value) in &policy.environment {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            result.add_error(format!("invalid environment key '{}'", key));
        }
        if value.contains('\0') {
            result.add_error(format!("environment value for '{}' contains NUL", key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::presets::preset;
    use crate::config::types::PathRule;

    #[test]
    fn presets_are_valid() {
        for name in crate::config::presets::get_presets().names() {
            let policy = preset(name).unwrap();
            let result = validate_policy(&policy);
            assert!(result.is_valid(), "{}: {:?}", name, result.errors);
        }
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut policy = preset("probe").unwrap();
        policy.wall_time_limit_ms = 0;
        policy.max_processes = Some(0);
        policy.memory_limit_bytes = Some(0);
        let result = validate_policy(&policy);
        assert_eq!(result.errors.len(), 3);
    }

    #[test]
    fn sample_interval_outside_range_is_rejected() {
        let mut policy = preset("probe").unwrap();
        policy.sample_interval_ms = 1000;
        assert!(!validate_policy(&policy).is_valid());
        policy.sample_interval_ms = 250;
        assert!(validate_policy(&policy).is_valid());
    }

    #[test]
    fn relative_and_traversing_paths_are_rejected() {
        let mut policy = preset("probe").unwrap();
        policy.filesystem.allow.push(PathRule::read_only("usr/lib"));
        policy
            .filesystem
            .allow
            .push(PathRule::read_only("/usr/../etc"));
        policy.filesystem.allow.push(PathRule::read_only("/"));
        let result = validate_policy(&policy);
        assert_eq!(result.errors.len(), 3, "{:?}", result.errors);
    }

    #[test]
    fn managed_mount_collisions_are_rejected() {
        let mut policy = preset("probe").unwrap();
        policy.filesystem.allow.push(PathRule::read_only("/box/input"));
        policy.filesystem.allow.push(PathRule::read_only("/dev/shm"));
        policy.filesystem.allow.push(PathRule::read_only("/proc/cpuinfo"));
        assert_eq!(validate_policy(&policy).errors.len(), 2);

        // /proc is only managed when the policy mounts it
        policy.filesystem.mount_proc = true;
        let result = validate_policy(&policy);
        assert_eq!(result.errors.len(), 3, "{:?}", result.errors);
        assert!(result.errors.iter().any(|e| e.contains("/proc/cpuinfo")));

        // The tmpfs goes in first, so rules beneath /tmp stay visible
        let mut policy = preset("probe").unwrap();
        policy.filesystem.allow.push(PathRule::read_only("/tmp/fixtures"));
        assert!(validate_policy(&policy).is_valid());
    }

    #[test]
    fn unknown_syscall_names_are_rejected() {
        let mut policy = preset("probe").unwrap();
        policy.syscall_deny_list.push("frobnicate".to_string());
        let result = validate_policy(&policy);
        assert!(result.errors.iter().any(|e| e.contains("frobnicate")));
    }

    #[test]
    fn into_result_surfaces_errors() {
        let mut policy = preset("probe").unwrap();
        policy.output_limit_bytes = 0;
        let err = validate_policy(&policy).into_result().unwrap_err();
        assert!(err.to_string().contains("output_limit_bytes"));
    }
}
