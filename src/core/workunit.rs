//! `WorkUnit` - an isolated branch + workspace pair and its lifecycle state.
//!
//! Only the lifecycle manager and the watcher move a work unit between
//! states, and only through [`WorkUnit::transition`].

use crate::core::aggregator::Verdict;
use crate::core::error::{ForemanError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Work unit lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitState {
    /// Branch and workspace allocated.
    Created,
    /// Work is happening; dispatch rounds run here.
    InProgress,
    /// Commit, push and publication opening in progress.
    Publishing,
    /// Waiting on reviewer verdicts.
    UnderReview,
    Merged,
    Rejected,
    /// Given up: stale review, forced teardown or orphan reclamation.
    Abandoned,
    /// Workspace deleted. Terminal.
    TornDown,
}

impl WorkUnitState {
    /// Whether the workspace exists on disk in this state.
    #[must_use]
    pub const fn has_workspace(self) -> bool {
        matches!(
            self,
            Self::Created | Self::InProgress | Self::Publishing | Self::UnderReview
        )
    }

    /// Outcome recorded; only teardown remains.
    #[must_use]
    pub const fn is_outcome(self) -> bool {
        matches!(self, Self::Merged | Self::Rejected | Self::Abandoned)
    }

    /// Whether the branch is owned by a live (not torn down) unit.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::TornDown)
    }
}

impl std::fmt::Display for WorkUnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Publishing => "publishing",
            Self::UnderReview => "under_review",
            Self::Merged => "merged",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
            Self::TornDown => "torn_down",
        };
        f.write_str(s)
    }
}

/// Explicit failure or attention marker left on a work unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub at: DateTime<Utc>,
    pub origin: String,
    pub message: String,
}

/// An isolated unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub branch_name: String,
    pub workspace_path: PathBuf,
    pub state: WorkUnitState,
    /// Stable base the branch diverged from.
    pub parent_ref: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Verdict of the most recent completed dispatch round.
    #[serde(default)]
    pub last_verdict: Option<Verdict>,
    /// Remote id of the current publication, once published.
    #[serde(default)]
    pub publication: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub torn_down_at: Option<DateTime<Utc>>,
}

impl WorkUnit {
    /// Creates a work unit in `Created`.
    #[must_use]
    pub fn new(
        branch_name: impl Into<String>,
        workspace_path: PathBuf,
        parent_ref: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            branch_name: branch_name.into(),
            workspace_path,
            state: WorkUnitState::Created,
            parent_ref: parent_ref.into(),
            created_at: now,
            last_activity_at: now,
            last_verdict: None,
            publication: None,
            annotations: Vec::new(),
            torn_down_at: None,
        }
    }

    /// Checks if a transition is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: WorkUnitState) -> bool {
        use WorkUnitState::{
            Abandoned, Created, InProgress, Merged, Publishing, Rejected, TornDown, UnderReview,
        };
        matches!(
            (self.state, next),
            (Created, InProgress | Abandoned)
                | (InProgress, Publishing | Abandoned)
                | (Publishing, UnderReview | Abandoned)
                | (UnderReview, InProgress | Merged | Rejected | Abandoned)
                | (Merged | Rejected | Abandoned, TornDown)
        )
    }

    /// Moves to `next` or fails with a state transition error.
    pub fn transition(&mut self, next: WorkUnitState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(ForemanError::state_transition(
                "invalid_transition",
                format!("Cannot move work unit from {} to {next}", self.state),
                "workunit:transition",
            )
            .for_work_unit(&self.branch_name)
            .with_context("from", self.state.to_string())
            .with_context("to", next.to_string()));
        }
        self.state = next;
        let now = Utc::now();
        self.last_activity_at = now;
        if next == WorkUnitState::TornDown {
            self.torn_down_at = Some(now);
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn annotate(&mut self, origin: impl Into<String>, message: impl Into<String>) {
        self.annotations.push(Annotation {
            at: Utc::now(),
            origin: origin.into(),
            message: message.into(),
        });
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity_at
    }
}
