//! Handler outcomes: task results and their findings.

use serde::{Deserialize, Serialize};

/// Status reported by one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Warning,
    Failure,
    Skipped,
}

/// Finding severity. `Blocking` failures block publication outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Blocking,
}

/// A structured issue record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    #[serde(default)]
    pub location: Option<String>,
    pub message: String,
}

impl Finding {
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            location: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Outcome of one handler invocation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub handler_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub duration_ms: u64,
}

impl TaskResult {
    #[must_use]
    pub fn success(handler_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            handler_id: handler_id.into(),
            status: TaskStatus::Success,
            findings: Vec::new(),
            duration_ms,
        }
    }

    #[must_use]
    pub fn warning(handler_id: impl Into<String>, duration_ms: u64, findings: Vec<Finding>) -> Self {
        Self {
            handler_id: handler_id.into(),
            status: TaskStatus::Warning,
            findings,
            duration_ms,
        }
    }

    #[must_use]
    pub fn failure(handler_id: impl Into<String>, duration_ms: u64, findings: Vec<Finding>) -> Self {
        Self {
            handler_id: handler_id.into(),
            status: TaskStatus::Failure,
            findings,
            duration_ms,
        }
    }

    /// A handler that never ran.
    #[must_use]
    pub fn skipped(handler_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            status: TaskStatus::Skipped,
            findings: vec![Finding::new(Severity::Info, reason)],
            duration_ms: 0,
        }
    }

    /// A handler that did not report within its budget.
    #[must_use]
    pub fn timed_out(handler_id: impl Into<String>, timeout_ms: u64, blocking: bool) -> Self {
        let severity = if blocking {
            Severity::Blocking
        } else {
            Severity::Error
        };
        Self::failure(
            handler_id,
            timeout_ms,
            vec![Finding::new(
                severity,
                format!("handler timed out after {timeout_ms}ms"),
            )],
        )
    }

    #[must_use]
    pub fn is_blocking_failure(&self) -> bool {
        self.status == TaskStatus::Failure
            && self.findings.iter().any(|f| f.severity == Severity::Blocking)
    }

    #[must_use]
    pub fn with_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_severity_follows_descriptor() {
        assert!(TaskResult::timed_out("lint", 50, true).is_blocking_failure());
        let soft = TaskResult::timed_out("lint", 50, false);
        assert_eq!(soft.status, TaskStatus::Failure);
        assert!(!soft.is_blocking_failure());
        assert!(soft.findings[0].message.contains("50ms"));
    }

    #[test]
    fn finding_parses_from_json_line() {
        let finding: Finding =
            serde_json::from_str(r#"{"severity":"blocking","location":"src/a.rs:3","message":"secret"}"#)
                .unwrap();
        assert_eq!(finding.severity, Severity::Blocking);
        assert_eq!(finding.location.as_deref(), Some("src/a.rs:3"));
    }
}
