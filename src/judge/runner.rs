use crate::config::types::{ExecutionPolicy, PathRule, RunError, Submission};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directories searched on the host for compilers and interpreters. All of
/// them are visible inside the sandbox through the default allow-list.
pub const TOOL_SEARCH_PATH: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin"];

/// What a language needs from a policy beyond the caller's limits
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunnerRequirements {
    pub extra_paths: Vec<PathRule>,
    pub mount_proc: bool,
    /// Raise `max_processes` to at least this many (threads count too)
    pub min_processes: Option<u32>,
    pub environment: BTreeMap<String, String>,
}

impl RunnerRequirements {
    /// Specialise `policy` for this language. Caller-set values win except
    /// where the runtime cannot start without more.
    pub fn apply(&self, policy: &ExecutionPolicy) -> ExecutionPolicy {
        let mut policy = policy.clone();
        for rule in &self.extra_paths {
            if !policy.filesystem.allow.iter().any(|r| r.path == rule.path) {
                policy.filesystem.allow.push(rule.clone());
            }
        }
        policy.filesystem.mount_proc |= self.mount_proc;
        if let (Some(min), Some(current)) = (self.min_processes, policy.max_processes) {
            policy.max_processes = Some(current.max(min));
        }
        for (key, value) in &self.environment {
            policy
                .environment
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        policy
    }
}

/// Per-language compile and launch rules.
///
/// Commands are argv vectors as seen inside the sandbox; `argv[0]` must be an
/// absolute path because the payload is started with a plain `execve`.
pub trait LanguageRunner: Send + Sync {
    fn language(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// File name the submission is copied to inside `/box`
    fn staged_name(&self, submission: &Submission) -> String;

    /// Mode of the staged file
    fn staged_mode(&self) -> u32 {
        0o644
    }

    /// Compiler invocation, for languages that have a build step
    fn compile_command(&self, _staged: &str) -> Result<Option<Vec<String>>, RunError> {
        Ok(None)
    }

    /// Program invocation, submission arguments included
    fn launch_command(&self, staged: &str, args: &[String]) -> Result<Vec<String>, RunError>;

    fn requirements(&self) -> RunnerRequirements {
        RunnerRequirements::default()
    }

    /// Applied on top of the compile preset
    fn compile_requirements(&self) -> RunnerRequirements {
        self.requirements()
    }
}

/// Locate `name` in [`TOOL_SEARCH_PATH`]. A missing tool is a spawn failure.
pub fn resolve_tool(name: &str) -> Result<PathBuf, RunError> {
    resolve_tool_in(name, TOOL_SEARCH_PATH.iter().map(Path::new))
}

pub fn resolve_tool_in<'a>(
    name: &str,
    dirs: impl IntoIterator<Item = &'a Path>,
) -> Result<PathBuf, RunError> {
    use std::os::unix::fs::PermissionsExt;

    for dir in dirs {
        let candidate = dir.join(name);
        if let Ok(meta) = std::fs::metadata(&candidate) {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return Ok(candidate);
            }
        }
    }
    Err(RunError::SpawnFailed(format!("{} not found on this host", name)))
}

pub(crate) fn tool(name: &str) -> Result<String, RunError> {
    Ok(resolve_tool(name)?.to_string_lossy().into_owned())
}

pub(crate) fn in_box(name: &str) -> String {
    format!("{}/{}", crate::kernel::mount::BOX_DIR, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::presets;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn requirements_extend_without_loosening_caller_choices() {
        let mut base = presets::preset("probe").unwrap();
        base.environment.insert("LANG".to_string(), "C".to_string());
        let requirements = RunnerRequirements {
            extra_paths: vec![PathRule::optional("/etc/alternatives"), PathRule::read_only("/usr")],
            mount_proc: true,
            min_processes: Some(64),
            environment: BTreeMap::from([
                ("LANG".to_string(), "C.UTF-8".to_string()),
                ("JAVA_TOOL_OPTIONS".to_string(), "-Xss1m".to_string()),
            ]),
        };

        let policy = requirements.apply(&base);
        assert!(policy.filesystem.mount_proc);
        assert_eq!(policy.max_processes, Some(64));
        assert_eq!(policy.environment["LANG"], "C");
        assert_eq!(policy.environment["JAVA_TOOL_OPTIONS"], "-Xss1m");
        let usr_rules = policy
            .filesystem
            .allow
            .iter()
            .filter(|r| r.path == Path::new("/usr"))
            .count();
        assert_eq!(usr_rules, 1);

        let mut unlimited = base.clone();
        unlimited.max_processes = None;
        assert_eq!(requirements.apply(&unlimited).max_processes, None);
    }

    #[test]
    fn tool_resolution_needs_an_executable_file() {
        let scratch = tempfile::tempdir().unwrap();
        let tool = scratch.path().join("fakecc");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(resolve_tool_in("fakecc", [scratch.path()]).is_err());

        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(resolve_tool_in("fakecc", [scratch.path()]).unwrap(), tool);

        let err = resolve_tool_in("missing-tool", [scratch.path()]).unwrap_err();
        assert!(matches!(err, RunError::SpawnFailed(_)));
    }
}
