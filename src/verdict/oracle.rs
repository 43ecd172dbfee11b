//! Expected-behaviour descriptions attached to a submission.
//!
//! Output oracles only look at what the program printed or returned.
//! Behavioural oracles (`terminated`, `limit`) also declare which limit
//! breaches are the point of the probe; see [`Oracle::expects`].
use crate::config::types::{CauseKind, ExecutionResult, TerminationCause};
use serde::{Deserialize, Serialize};

fn default_terminated_causes() -> Vec<CauseKind> {
    vec![CauseKind::TimedOut]
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Oracle {
    /// Byte-for-byte stdout, optionally ignoring surrounding whitespace
    Exact {
        expected: String,
        #[serde(default)]
        trim: bool,
    },
    /// Every fragment appears in stdout
    Contains { fragments: Vec<String> },
    /// No fragment appears in stdout or stderr
    Excludes { fragments: Vec<String> },
    Regex { pattern: String },
    /// Same whitespace-separated tokens per non-blank line; spacing and
    /// blank lines are ignored
    Shape { expected: String },
    /// Normal exit with this status
    ExitCode { code: i32 },
    /// The run must have been stopped for one of `causes`
    Terminated {
        #[serde(default = "default_terminated_causes")]
        causes: Vec<CauseKind>,
    },
    /// The probe hits `cause`. It passes either when the harness kills it
    /// for that reason or when the program notices the failure itself and
    /// prints `graceful_marker` before exiting.
    Limit {
        cause: CauseKind,
        #[serde(default)]
        graceful_marker: Option<String>,
        #[serde(default = "default_true")]
        accept_graceful: bool,
        #[serde(default = "default_true")]
        accept_kill: bool,
    },
    #[default]
    NoCrash,
    All { oracles: Vec<Oracle> },
    Any { oracles: Vec<Oracle> },
}

/// Result of checking one oracle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Check {
    pub passed: bool,
    pub reason: String,
}

impl Check {
    fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }

    fn from_bool(passed: bool, ok: impl Into<String>, bad: impl Into<String>) -> Self {
        if passed {
            Self::pass(ok)
        } else {
            Self::fail(bad)
        }
    }
}

fn token_lines(text: &str) -> Vec<Vec<&str>> {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|tokens| !tokens.is_empty())
        .collect()
}

fn excerpt(text: &str) -> String {
    const MAX: usize = 80;
    let flat = text.replace('\n', "\\n");
    if flat.chars().count() <= MAX {
        flat
    } else {
        let cut: String = flat.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}

impl Oracle {
    pub fn exact(expected: impl Into<String>) -> Self {
        Oracle::Exact {
            expected: expected.into(),
            trim: false,
        }
    }

    pub fn terminated(causes: Vec<CauseKind>) -> Self {
        Oracle::Terminated { causes }
    }

    /// Whether this oracle anticipates the run ending with `cause`
    pub fn expects(&self, cause: &TerminationCause) -> bool {
        match self {
            Oracle::Terminated { causes } => causes.contains(&cause.kind()),
            Oracle::Limit {
                cause: expected,
                accept_kill,
                ..
            } => *accept_kill && *expected == cause.kind(),
            Oracle::All { oracles } | Oracle::Any { oracles } => {
                oracles.iter().any(|o| o.expects(cause))
            }
            _ => false,
        }
    }

    pub fn check(&self, result: &ExecutionResult) -> Check {
        let stdout = result.stdout.as_str();
        match self {
            Oracle::Exact { expected, trim } => {
                let matched = if *trim {
                    stdout.trim() == expected.trim()
                } else {
                    stdout == expected
                };
                Check::from_bool(
                    matched,
                    "output matches",
                    format!(
                        "expected '{}', got '{}'",
                        excerpt(expected),
                        excerpt(stdout)
                    ),
                )
            }
            Oracle::Contains { fragments } => {
                match fragments.iter().find(|f| !stdout.contains(f.as_str())) {
                    Some(missing) => Check::fail(format!("output lacks '{}'", excerpt(missing))),
                    None => Check::pass("all fragments present"),
                }
            }
            Oracle::Excludes { fragments } => {
                let found = fragments.iter().find(|f| {
                    stdout.contains(f.as_str()) || result.stderr.contains(f.as_str())
                });
                match found {
                    Some(found) => Check::fail(format!("output contains '{}'", excerpt(found))),
                    None => Check::pass("no forbidden fragment in output"),
                }
            }
            Oracle::Regex { pattern } => match regex::Regex::new(pattern) {
                Ok(re) => Check::from_bool(
                    re.is_match(stdout),
                    format!("output matches /{}/", pattern),
                    format!("output does not match /{}/", pattern),
                ),
                Err(e) => Check::fail(format!("invalid pattern /{}/: {}", pattern, e)),
            },
            Oracle::Shape { expected } => {
                let want = token_lines(expected);
                let got = token_lines(stdout);
                if want == got {
                    return Check::pass("output has the expected shape");
                }
                let line = want
                    .iter()
                    .zip(got.iter())
                    .position(|(a, b)| a != b)
                    .unwrap_or_else(|| want.len().min(got.len()));
                Check::fail(format!(
                    "shape differs at non-blank line {} ({} expected, {} produced)",
                    line + 1,
                    want.len(),
                    got.len()
                ))
            }
            Oracle::ExitCode { code } => Check::from_bool(
                result.cause == TerminationCause::Normal && result.exit_code == Some(*code),
                format!("exited with {}", code),
                match result.exit_code {
                    Some(actual) => format!("exited with {}, expected {}", actual, code),
                    None => format!("{}, expected exit {}", result.cause, code),
                },
            ),
            Oracle::Terminated { causes } => {
                let names: Vec<String> = causes.iter().map(|c| c.to_string()).collect();
                Check::from_bool(
                    causes.contains(&result.cause.kind()),
                    format!("terminated as expected: {}", result.cause),
                    format!(
                        "expected termination ({}), got {}",
                        names.join(" or "),
                        result.cause
                    ),
                )
            }
            Oracle::Limit {
                cause,
                graceful_marker,
                accept_graceful,
                accept_kill,
            } => {
                if *accept_kill && result.cause.kind() == *cause {
                    return Check::pass(format!("harness enforced the limit: {}", result.cause));
                }
                let graceful = *accept_graceful
                    && result.cause == TerminationCause::Normal
                    && graceful_marker.as_deref().is_some_and(|marker| {
                        stdout.contains(marker) || result.stderr.contains(marker)
                    });
                if graceful {
                    return Check::pass("program detected the limit and reported it");
                }
                Check::fail(format!(
                    "expected {} to be enforced, run ended with {}",
                    cause, result.cause
                ))
            }
            Oracle::NoCrash => Check::from_bool(
                result.cause == TerminationCause::Normal,
                "program exited on its own",
                format!("program did not exit normally: {}", result.cause),
            ),
            Oracle::All { oracles } => {
                for oracle in oracles {
                    let check = oracle.check(result);
                    if !check.passed {
                        return check;
                    }
                }
                Check::pass(format!("all {} checks passed", oracles.len()))
            }
            Oracle::Any { oracles } => {
                let mut reasons = Vec::with_capacity(oracles.len());
                for oracle in oracles {
                    let check = oracle.check(result);
                    if check.passed {
                        return check;
                    }
                    reasons.push(check.reason);
                }
                Check::fail(format!("no alternative matched: {}", reasons.join("; ")))
            }
        }
    }
}
