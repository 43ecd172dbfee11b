/// Payload environment
///
/// The payload never inherits the harness environment. It gets a fixed base
/// plus the policy's own entries, minus loader variables.
use crate::config::types::{Result, SandboxError};
use std::collections::BTreeMap;
use std::ffi::CString;

/// Loader knobs that would let a payload inject code into the interpreter or
/// compiler it is run under
pub const LOADER_VARIABLES: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "LD_DEBUG",
    "LD_PROFILE",
    "LD_BIND_NOW",
    "LD_USE_LOAD_BIAS",
    "LD_DYNAMIC_WEAK",
];

/// Umask applied in the payload before exec
pub const PAYLOAD_UMASK: libc::mode_t = 0o022;

fn base_environment() -> BTreeMap<String, String> {
    [
        ("PATH", "/usr/local/bin:/usr/bin:/bin"),
        ("HOME", "/box"),
        ("TMPDIR", "/tmp"),
        ("LANG", "C.UTF-8"),
        ("LC_ALL", "C.UTF-8"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Merge the base with `extra`, dropping loader variables
pub fn sandbox_environment(extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = base_environment();
    for (key, value) in extra {
        if LOADER_VARIABLES.contains(&key.as_str()) {
            continue;
        }
        env.insert(key.clone(), value.clone());
    }
    env
}

/// `KEY=VALUE` strings ready for execve
pub fn to_envp(env: &BTreeMap<String, String>) -> Result<Vec<CString>> {
    env.iter()
        .map(|(key, value)| {
            if key.is_empty() || key.contains('=') {
                return Err(SandboxError::Config(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
            CString::new(format!("{}={}", key, value)).map_err(|_| {
                SandboxError::Config(format!("environment entry {} contains NUL byte", key))
            })
        })
        .collect()
}
