//! Structured audit trail of security-relevant run events.
//!
//! Every event goes to the `probebox::audit` log target as one JSON object.
//! When [`init_audit_log`] was given a path, the same line is appended there.
use crate::config::types::{EnforcementReport, TerminationCause};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const AUDIT_TARGET: &str = "probebox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RunStarted,
    ControlDegraded,
    LimitBreach,
    SignalEscalation,
    TeardownComplete,
    TeardownIncomplete,
    RunFinished,
}

impl AuditEventType {
    pub fn default_severity(self) -> AuditSeverity {
        match self {
            AuditEventType::RunStarted | AuditEventType::RunFinished => AuditSeverity::Low,
            AuditEventType::TeardownComplete => AuditSeverity::Low,
            AuditEventType::LimitBreach | AuditEventType::SignalEscalation => {
                AuditSeverity::Medium
            }
            AuditEventType::ControlDegraded => AuditSeverity::High,
            AuditEventType::TeardownIncomplete => AuditSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub run_id: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, run_id: &str, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            severity: event_type.default_severity(),
            run_id: run_id.to_string(),
            details: details.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Serialize) -> Self {
        self.fields.insert(
            key.to_string(),
            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        );
        self
    }
}

/// Append-only JSON-lines audit file
pub struct AuditLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) {
        match self.file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    error!("Failed to write audit log {}: {}", self.path.display(), e);
                }
            }
            Err(_) => error!("Audit log lock poisoned"),
        }
    }
}

static AUDIT_LOG: OnceLock<AuditLog> = OnceLock::new();

/// Mirror audit events into `path`. Without a call, events only reach the
/// logger.
pub fn init_audit_log(path: &Path) -> std::io::Result<()> {
    let log = AuditLog::open(path)?;
    if AUDIT_LOG.set(log).is_err() {
        warn!("Audit log already initialized; ignoring {}", path.display());
    }
    Ok(())
}

pub fn record(event: AuditEvent) {
    let line = serde_json::to_string(&event).unwrap_or_else(|_| event.details.clone());
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => {
            warn!(target: AUDIT_TARGET, "{}", line)
        }
        AuditSeverity::Medium | AuditSeverity::Low => info!(target: AUDIT_TARGET, "{}", line),
    }
    if let Some(log) = AUDIT_LOG.get() {
        log.append(&line);
    }
}

pub fn run_started(run_id: &str, language: &str, policy_name: &str, policy_digest: &str) {
    record(
        AuditEvent::new(
            AuditEventType::RunStarted,
            run_id,
            format!("{} submission under policy '{}'", language, policy_name),
        )
        .with_field("language", language)
        .with_field("policy", policy_name)
        .with_field("policy_digest", policy_digest),
    );
}

pub fn control_degraded(run_id: &str, control: &str, reason: &str) {
    record(
        AuditEvent::new(
            AuditEventType::ControlDegraded,
            run_id,
            format!("{} falls back: {}", control, reason),
        )
        .with_field("control", control),
    );
}

pub fn limit_breach(run_id: &str, cause: &TerminationCause, observed: String) {
    record(
        AuditEvent::new(AuditEventType::LimitBreach, run_id, cause.to_string())
            .with_field("cause", cause.kind())
            .with_field("observed", observed),
    );
}

pub fn signal_escalation(run_id: &str, signal: &str, pid: i32) {
    record(
        AuditEvent::new(
            AuditEventType::SignalEscalation,
            run_id,
            format!("{} sent to sandbox tree rooted at {}", signal, pid),
        )
        .with_field("signal", signal)
        .with_field("pid", pid),
    );
}

/// `leftovers` lists what could not be confirmed gone
pub fn teardown_result(run_id: &str, leftovers: &[String]) {
    let event = if leftovers.is_empty() {
        AuditEvent::new(
            AuditEventType::TeardownComplete,
            run_id,
            "process tree and run directory gone",
        )
    } else {
        AuditEvent::new(
            AuditEventType::TeardownIncomplete,
            run_id,
            leftovers.join("; "),
        )
    };
    record(event);
}

pub fn run_finished(
    run_id: &str,
    cause: &TerminationCause,
    wall_time_ms: u64,
    enforcement: &EnforcementReport,
) {
    record(
        AuditEvent::new(AuditEventType::RunFinished, run_id, cause.to_string())
            .with_field("cause", cause.kind())
            .with_field("wall_time_ms", wall_time_ms)
            .with_field("degraded", &enforcement.degraded),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_fields() {
        let event = AuditEvent::new(AuditEventType::LimitBreach, "run-1", "memory limit exceeded")
            .with_field("cause", crate::config::types::CauseKind::MemoryExceeded)
            .with_field("observed", "70000000 of 67108864 bytes");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "limit_breach");
        assert_eq!(json["severity"], "medium");
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["fields"]["cause"], "memory_exceeded");
    }

    #[test]
    fn empty_fields_are_omitted() {
        let event = AuditEvent::new(AuditEventType::TeardownComplete, "run-2", "ok");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("fields").is_none());
        assert_eq!(json["severity"], "low");
    }

    #[test]
    fn audit_file_appends_json_lines() {
        let scratch = tempfile::tempdir().unwrap();
        let log = AuditLog::open(&scratch.path().join("nested/audit.log")).unwrap();
        let event = AuditEvent::new(AuditEventType::ControlDegraded, "run-3", "cgroup missing");
        log.append(&serde_json::to_string(&event).unwrap());
        log.append(&serde_json::to_string(&event).unwrap());

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.event_type, AuditEventType::ControlDegraded);
        assert_eq!(parsed.severity, AuditSeverity::High);
    }
}
