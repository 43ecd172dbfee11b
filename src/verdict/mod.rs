//! Output evaluation: oracles and verdicts

pub mod oracle;
#[allow(clippy::module_inception)]
pub mod verdict;

pub use oracle::{Check, Oracle};
pub use verdict::{judge, Verdict, VerdictStatus};

#[cfg(test)]
pub(crate) mod tests {
    use crate::config::types::{
        EnforcementReport, ExecutionResult, OutputIntegrity, TerminationCause,
    };

    pub(crate) fn result_with(cause: TerminationCause, stdout: &str) -> ExecutionResult {
        ExecutionResult {
            run_id: "test-run".to_string(),
            exit_code: match cause {
                TerminationCause::Normal => Some(0),
                _ => None,
            },
            cause,
            stdout: stdout.to_string(),
            stderr: String::new(),
            stdout_integrity: OutputIntegrity::Complete,
            stderr_integrity: OutputIntegrity::Complete,
            wall_time_ms: 10,
            cpu_time_ms: 5,
            peak_memory_bytes: 1 << 20,
            policy_name: "probe".to_string(),
            policy_digest: String::new(),
            started_at: chrono::Utc::now(),
            enforcement: EnforcementReport::default(),
            compile: None,
        }
    }
}
