//! Structured error types.
//!
//! Errors must be classifiable, attributable, and actionable.
//! Every error answers: What failed? Which work unit or publication? What next?

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error kind for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A live work unit already owns the branch.
    Conflict,
    /// Malformed rule or configuration.
    Configuration,
    /// A handler exceeded its time budget.
    HandlerTimeout,
    /// A handler reported a blocking outcome.
    HandlerFailure,
    /// A version-control or hosting call failed.
    ExternalCollaborator,
    /// An illegal lifecycle transition was requested.
    StateTransition,
    /// Requested record does not exist.
    NotFound,
    /// Bad user input.
    User,
    /// IO and other local failures.
    System,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict => write!(f, "conflict"),
            Self::Configuration => write!(f, "configuration"),
            Self::HandlerTimeout => write!(f, "handler_timeout"),
            Self::HandlerFailure => write!(f, "handler_failure"),
            Self::ExternalCollaborator => write!(f, "external_collaborator"),
            Self::StateTransition => write!(f, "state_transition"),
            Self::NotFound => write!(f, "not_found"),
            Self::User => write!(f, "user"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Structured error with full context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForemanError {
    /// Error kind for classification.
    pub kind: ErrorKind,
    /// Unique error code within kind.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Component that originated the error.
    pub origin: String,
    /// Whether retrying the same request can succeed.
    pub recoverable: bool,
    /// Hint for recovery action.
    pub recovery_hint: Option<String>,
    /// Offending identifiers and other key-value context.
    pub context: BTreeMap<String, String>,
}

impl ForemanError {
    /// Creates a new error with the given parameters.
    #[must_use]
    pub fn new(
        kind: ErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            origin: origin.into(),
            recoverable: false,
            recovery_hint: None,
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Sets the recovery hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    /// Adds context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attaches the offending work unit.
    #[must_use]
    pub fn for_work_unit(self, branch: &str) -> Self {
        self.with_context("work_unit", branch)
    }

    /// Attaches the offending publication record.
    #[must_use]
    pub fn for_publication(self, remote_id: &str) -> Self {
        self.with_context("publication", remote_id)
    }

    #[must_use]
    pub fn conflict(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Conflict, code, message, origin)
    }

    #[must_use]
    pub fn configuration(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Configuration, code, message, origin)
    }

    #[must_use]
    pub fn handler_timeout(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::HandlerTimeout, code, message, origin)
    }

    #[must_use]
    pub fn handler_failure(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::HandlerFailure, code, message, origin)
    }

    /// Creates a collaborator error. Recoverability depends on the call.
    #[must_use]
    pub fn external(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::ExternalCollaborator, code, message, origin)
    }

    #[must_use]
    pub fn state_transition(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::StateTransition, code, message, origin)
    }

    #[must_use]
    pub fn not_found(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::NotFound, code, message, origin)
    }

    /// Creates a user input error.
    #[must_use]
    pub fn user(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::User, code, message, origin).recoverable(true)
    }

    /// Creates a system error.
    #[must_use]
    pub fn system(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::System, code, message, origin)
    }

    /// Subject id (work unit or publication) this error is about, if known.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.context
            .get("publication")
            .or_else(|| self.context.get("work_unit"))
            .map(String::as_str)
    }
}

impl std::fmt::Display for ForemanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.kind, self.code, self.message)?;
        if let Some(subject) = self.subject() {
            write!(f, " ({subject})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ForemanError {}

/// Result type using `ForemanError`.
pub type Result<T> = std::result::Result<T, ForemanError>;

/// Exit codes for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Blocked = 1,
    Configuration = 2,
    External = 3,
    Rejected = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as Self
    }
}

impl From<&ForemanError> for ExitCode {
    fn from(err: &ForemanError) -> Self {
        match err.kind {
            ErrorKind::Configuration => Self::Configuration,
            ErrorKind::ExternalCollaborator => Self::External,
            ErrorKind::HandlerFailure => Self::Blocked,
            _ => Self::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_kind_and_subject() {
        let err = ForemanError::conflict("work_unit_exists", "Branch already live", "lifecycle:create")
            .for_work_unit("feat-x");
        let rendered = err.to_string();
        assert!(rendered.contains("conflict"));
        assert!(rendered.contains("work_unit_exists"));
        assert!(rendered.contains("feat-x"));
    }

    #[test]
    fn publication_subject_wins_over_work_unit() {
        let err = ForemanError::external("merge_failed", "boom", "watcher:merge")
            .for_work_unit("feat-x")
            .for_publication("42");
        assert_eq!(err.subject(), Some("42"));
    }

    #[test]
    fn exit_codes_follow_taxonomy() {
        let cfg = ForemanError::configuration("bad_rule", "bad", "rules");
        let ext = ForemanError::external("push_failed", "bad", "host");
        let st = ForemanError::state_transition("not_ready", "bad", "watcher");
        assert_eq!(ExitCode::from(&cfg), ExitCode::Configuration);
        assert_eq!(ExitCode::from(&ext), ExitCode::External);
        assert_eq!(ExitCode::from(&st), ExitCode::Rejected);
        assert_eq!(i32::from(ExitCode::Blocked), 1);
    }

    #[test]
    fn error_serialization() {
        let err = ForemanError::user("invalid_name", "Branch name cannot be empty", "cli:workunit")
            .with_hint("Provide a branch name");

        let json = serde_json::to_string(&err).expect("serialize");
        let restored: ForemanError = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.kind, ErrorKind::User);
        assert!(restored.recoverable);
        assert_eq!(restored.recovery_hint.as_deref(), Some("Provide a branch name"));
    }
}
