//! Version-control and code-hosting boundary.
//!
//! The lifecycle manager and the watcher only talk to branches, workspaces
//! and publications through [`VcsHost`]. Implementations own the wire
//! format of whatever product sits behind them.

use crate::core::error::ForemanError;
use crate::core::publication::ReviewDecision;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Errors reported by a host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("{op} failed: {message}")]
    Command { op: &'static str, message: String },
    #[error("merge conflict on {remote_id}: {message}")]
    MergeConflict { remote_id: String, message: String },
    #[error("publication {0} not found")]
    UnknownPublication(String),
    #[error("IO error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl HostError {
    #[must_use]
    pub fn command(op: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            op,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }

    #[must_use]
    pub const fn is_merge_conflict(&self) -> bool {
        matches!(self, Self::MergeConflict { .. })
    }
}

impl From<HostError> for ForemanError {
    fn from(err: HostError) -> Self {
        let code = match &err {
            HostError::Command { op, .. } | HostError::Io { op, .. } => format!("{op}_failed"),
            HostError::MergeConflict { .. } => "merge_conflict".to_string(),
            HostError::UnknownPublication(_) => "unknown_publication".to_string(),
        };
        let subject = match &err {
            HostError::MergeConflict { remote_id, .. } | HostError::UnknownPublication(remote_id) => {
                Some(remote_id.clone())
            }
            _ => None,
        };
        let error = Self::external(code, err.to_string(), "host");
        match subject {
            Some(id) => error.for_publication(&id),
            None => error,
        }
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Remote state of a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Open,
    Merged,
    /// Closed without merging.
    Closed,
}

/// A review as seen on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReview {
    pub reviewer_id: String,
    pub decision: ReviewDecision,
    #[serde(default)]
    pub comments: String,
}

/// Snapshot returned by a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationStatus {
    pub state: RemoteState,
    #[serde(default)]
    pub reviews: Vec<RemoteReview>,
}

impl PublicationStatus {
    #[must_use]
    pub fn open() -> Self {
        Self {
            state: RemoteState::Open,
            reviews: Vec::new(),
        }
    }
}

/// Abstract VCS/hosting collaborator.
///
/// Only [`VcsHost::get_publication_status`], [`VcsHost::diff_summary`] and
/// [`VcsHost::has_unpublished_work`] are queries; callers may retry those.
/// Every other call mutates and is issued at most once per attempt.
pub trait VcsHost: Send + Sync {
    /// Short name for logs, e.g. `github`.
    fn name(&self) -> &'static str;

    fn create_branch(&self, branch: &str, base_ref: &str) -> HostResult<()>;

    /// Allocates an isolated workspace checked out on `branch`.
    fn create_workspace(&self, branch: &str) -> HostResult<PathBuf>;

    /// Deletes a workspace. Succeeds if it is already gone.
    fn remove_workspace(&self, workspace: &Path) -> HostResult<()>;

    /// Deletes the local branch. Succeeds if already gone.
    fn delete_branch(&self, branch: &str) -> HostResult<()>;

    /// Deletes the pushed branch from the remote. Succeeds if already gone.
    fn delete_remote_branch(&self, branch: &str) -> HostResult<()>;

    /// Commits all changes; returns the new head, or `None` if nothing changed.
    fn commit(&self, workspace: &Path, message: &str) -> HostResult<Option<String>>;

    fn push(&self, workspace: &Path, branch: &str) -> HostResult<()>;

    /// Opens a publication for `branch` and returns its remote id.
    fn open_publication(&self, branch: &str, base_ref: &str, title: &str) -> HostResult<String>;

    fn get_publication_status(&self, remote_id: &str) -> HostResult<PublicationStatus>;

    fn merge(&self, remote_id: &str) -> HostResult<()>;

    fn close_publication(&self, remote_id: &str, reason: &str) -> HostResult<()>;

    /// Uncommitted changes or commits that exist nowhere but this workspace.
    fn has_unpublished_work(&self, workspace: &Path, branch: &str) -> HostResult<bool>;

    /// Human-readable change summary of `branch` against `base_ref`.
    fn diff_summary(&self, branch: &str, base_ref: &str) -> HostResult<String>;
}

pub type SharedHost = Arc<dyn VcsHost>;
