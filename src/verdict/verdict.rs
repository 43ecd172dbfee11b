use crate::config::types::{ErrorKind, ExecutionResult, RunError};
use crate::verdict::oracle::Oracle;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Fail,
    Error,
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictStatus::Pass => write!(f, "pass"),
            VerdictStatus::Fail => write!(f, "fail"),
            VerdictStatus::Error => write!(f, "error"),
        }
    }
}

/// Final judgement of one run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    /// Set exactly when `status` is `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub reason: String,
}

impl Verdict {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Pass,
            error_kind: None,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Fail,
            error_kind: None,
            reason: reason.into(),
        }
    }

    pub fn error(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Error,
            error_kind: Some(kind),
            reason: reason.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.status == VerdictStatus::Pass
    }

    /// Process exit status for the CLI: 0 pass, 1 fail, 2 error
    pub fn exit_code(&self) -> i32 {
        match self.status {
            VerdictStatus::Pass => 0,
            VerdictStatus::Fail => 1,
            VerdictStatus::Error => 2,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_kind {
            Some(kind) => write!(f, "{}({}): {}", self.status, kind, self.reason),
            None => write!(f, "{}: {}", self.status, self.reason),
        }
    }
}

/// Judge a finished run against its oracle.
///
/// Run-level errors are never downgraded to `fail`. A limit breach the
/// oracle did not ask for fails the run regardless of its output.
pub fn judge(outcome: &Result<ExecutionResult, RunError>, oracle: &Oracle) -> Verdict {
    let result = match outcome {
        Ok(result) => result,
        Err(err) => return Verdict::error(err.kind(), err.to_string()),
    };

    if result.cause.is_limit_breach() && !oracle.expects(&result.cause) {
        return Verdict::fail(format!("unexpected limit breach: {}", result.cause));
    }

    let check = oracle.check(result);
    if check.passed {
        Verdict::pass(check.reason)
    } else {
        Verdict::fail(check.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{CauseKind, CompileSummary, TerminationCause};
    use crate::verdict::tests::result_with;

    #[test]
    fn timeout_probe_passes_when_expected() {
        let outcome = Ok(result_with(TerminationCause::TimedOut, "Starting infinite loop\n"));
        let verdict = judge(&outcome, &Oracle::terminated(vec![CauseKind::TimedOut]));
        assert_eq!(verdict.status, VerdictStatus::Pass);
        assert_eq!(verdict.exit_code(), 0);
    }

    #[test]
    fn unexpected_breach_fails_even_with_matching_output() {
        let outcome = Ok(result_with(TerminationCause::CpuExceeded, "LIS length: 6\n"));
        let verdict = judge(&outcome, &Oracle::exact("LIS length: 6\n"));
        assert_eq!(verdict.status, VerdictStatus::Fail);
        assert!(verdict.reason.contains("CPU-time"));
    }

    #[test]
    fn run_errors_become_error_verdicts() {
        let outcome = Err(RunError::SpawnFailed("fork: EAGAIN".to_string()));
        let verdict = judge(&outcome, &Oracle::NoCrash);
        assert_eq!(verdict.status, VerdictStatus::Error);
        assert_eq!(verdict.error_kind, Some(ErrorKind::SpawnFailed));
        assert_eq!(verdict.exit_code(), 2);

        let outcome = Err(RunError::CompileFailed(Box::new(CompileSummary {
            exit_code: Some(1),
            cause: TerminationCause::Normal,
            wall_time_ms: 40,
            diagnostics: "main.c:1: error: expected ';'".to_string(),
        })));
        let verdict = judge(&outcome, &Oracle::NoCrash);
        assert_eq!(verdict.error_kind, Some(ErrorKind::CompileFailed));
        assert!(verdict.reason.contains("expected ';'"));
    }

    #[test]
    fn policy_violation_is_judged_not_errored() {
        let outcome = Ok(result_with(
            TerminationCause::PolicyViolation {
                detail: "denied syscall".to_string(),
            },
            "",
        ));
        let verdict = judge(&outcome, &Oracle::NoCrash);
        assert_eq!(verdict.status, VerdictStatus::Fail);
        assert_eq!(verdict.error_kind, None);
    }

    #[test]
    fn verdict_serializes_flat() {
        let json =
            serde_json::to_value(Verdict::error(ErrorKind::SetupFailed, "no userns")).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error_kind"], "setup_failed");
        let json = serde_json::to_value(Verdict::pass("ok")).unwrap();
        assert!(json.get("error_kind").is_none());
    }
}
