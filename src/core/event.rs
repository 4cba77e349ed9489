//! Development events fed to the rule dispatcher.
//!
//! Events are immutable: created by an external trigger, consumed once by
//! a dispatch round, never mutated.

use crate::core::error::{ForemanError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Payload key naming the work unit an event targets.
pub const WORK_UNIT_KEY: &str = "work_unit";

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FileChanged,
    UserRequest,
    ExternalStateChanged,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileChanged => write!(f, "file_changed"),
            Self::UserRequest => write!(f, "user_request"),
            Self::ExternalStateChanged => write!(f, "external_state_changed"),
        }
    }
}

/// An external trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    kind: EventKind,
    #[serde(default)]
    payload: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl Event {
    #[must_use]
    pub fn new(kind: EventKind, payload: BTreeMap<String, String>) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Builds an event from `(key, value)` pairs.
    #[must_use]
    pub fn with_pairs<K, V>(kind: EventKind, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            kind,
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Reads an event from a JSON or YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let origin = "event:from_file";
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ForemanError::user("event_read_failed", e.to_string(), origin)
                .with_context("path", path.display().to_string())
        })?;
        let parsed = if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            serde_yaml::from_str(&raw).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&raw).map_err(|e| e.to_string())
        };
        parsed.map_err(|e| {
            ForemanError::user("event_parse_failed", e, origin)
                .with_context("path", path.display().to_string())
                .with_hint("Events are {\"kind\": \"file_changed\", \"payload\": {..}}")
        })
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub fn payload(&self) -> &BTreeMap<String, String> {
        &self.payload
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The work unit named in the payload, if any.
    #[must_use]
    pub fn work_unit(&self) -> Option<&str> {
        self.get(WORK_UNIT_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_event_without_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(
            &path,
            r#"{"kind": "file_changed", "payload": {"path": "core/x", "work_unit": "feat-x"}}"#,
        )
        .unwrap();

        let event = Event::from_file(&path).unwrap();
        assert_eq!(event.kind(), EventKind::FileChanged);
        assert_eq!(event.get("path"), Some("core/x"));
        assert_eq!(event.work_unit(), Some("feat-x"));
    }

    #[test]
    fn parses_yaml_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.yaml");
        std::fs::write(&path, "kind: user_request\npayload:\n  action: review\n").unwrap();

        let event = Event::from_file(&path).unwrap();
        assert_eq!(event.kind(), EventKind::UserRequest);
        assert_eq!(event.get("action"), Some("review"));
    }

    #[test]
    fn rejects_unknown_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, r#"{"kind": "telepathy"}"#).unwrap();

        let err = Event::from_file(&path).unwrap_err();
        assert_eq!(err.code, "event_parse_failed");
    }
}
