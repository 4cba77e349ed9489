//! Publication records and the merge decision.
//!
//! A [`PublicationRecord`] tracks one external review/merge thread. Its
//! merge outcome leaves `Pending` exactly once. [`decide`] is the pure
//! function the watcher uses to turn reviewer verdicts into an action.

use crate::core::error::{ForemanError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Pending,
    Merged,
    Rejected,
    Abandoned,
}

impl MergeOutcome {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Merged => write!(f, "merged"),
            Self::Rejected => write!(f, "rejected"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    RequestChanges,
    Block,
}

impl std::fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::RequestChanges => write!(f, "request_changes"),
            Self::Block => write!(f, "block"),
        }
    }
}

impl std::str::FromStr for ReviewDecision {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "approve" => Ok(Self::Approve),
            "request_changes" => Ok(Self::RequestChanges),
            "block" => Ok(Self::Block),
            other => Err(ForemanError::user(
                "invalid_decision",
                format!("Unknown review decision '{other}'"),
                "publication:decision",
            )
            .with_hint("Use approve, request-changes or block")),
        }
    }
}

/// One reviewer role's judgment within a publish cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    /// Reviewer role id, e.g. `security`.
    pub reviewer_id: String,
    pub decision: ReviewDecision,
    #[serde(default)]
    pub comments: String,
    /// Publish cycle the verdict was given in.
    #[serde(default)]
    pub cycle: u32,
    pub recorded_at: DateTime<Utc>,
}

impl ReviewVerdict {
    #[must_use]
    pub fn new(reviewer_id: impl Into<String>, decision: ReviewDecision, cycle: u32) -> Self {
        Self {
            reviewer_id: reviewer_id.into(),
            decision,
            comments: String::new(),
            cycle,
            recorded_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = comments.into();
        self
    }
}

/// A merge that was requested but whose result is not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeIntent {
    pub requested_at: DateTime<Utc>,
    pub cycle: u32,
}

/// One external review/merge thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub work_unit: String,
    pub remote_id: String,
    /// Incremented on every re-publish after requested changes.
    pub cycle: u32,
    #[serde(default)]
    pub review_verdicts: Vec<ReviewVerdict>,
    pub merge_outcome: MergeOutcome,
    #[serde(default)]
    pub merge_intent: Option<MergeIntent>,
    /// Number of host-side reviews already consumed.
    #[serde(default)]
    pub remote_reviews_seen: usize,
    /// Set when a mutating collaborator call failed. The watcher skips the
    /// record until an operator resolves it.
    #[serde(default)]
    pub failure: Option<String>,
    /// The current cycle ended without a merge; the next publish opens a new one.
    #[serde(default)]
    pub awaiting_republish: bool,
    #[serde(default)]
    pub archived: bool,
    pub opened_at: DateTime<Utc>,
    /// Start of the current review cycle; staleness is measured from here.
    pub cycle_started_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl PublicationRecord {
    #[must_use]
    pub fn new(work_unit: impl Into<String>, remote_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            work_unit: work_unit.into(),
            remote_id: remote_id.into(),
            cycle: 1,
            review_verdicts: Vec::new(),
            merge_outcome: MergeOutcome::Pending,
            merge_intent: None,
            remote_reviews_seen: 0,
            failure: None,
            awaiting_republish: false,
            archived: false,
            opened_at: now,
            cycle_started_at: now,
            closed_at: None,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.merge_outcome == MergeOutcome::Pending
    }

    /// Starts a new review cycle after the author pushed changes.
    pub fn begin_cycle(&mut self) -> Result<()> {
        self.ensure_pending("publication:begin_cycle")?;
        self.cycle += 1;
        self.cycle_started_at = Utc::now();
        self.merge_intent = None;
        self.awaiting_republish = false;
        Ok(())
    }

    /// Appends a verdict. Verdicts are never edited or removed.
    pub fn record_verdict(&mut self, verdict: ReviewVerdict) -> Result<()> {
        self.ensure_pending("publication:record_verdict")?;
        self.review_verdicts.push(verdict);
        Ok(())
    }

    /// Whether an equivalent verdict is already recorded for this cycle.
    #[must_use]
    pub fn has_verdict(&self, reviewer_id: &str, decision: ReviewDecision, cycle: u32) -> bool {
        self.review_verdicts
            .iter()
            .any(|v| v.reviewer_id == reviewer_id && v.decision == decision && v.cycle == cycle)
    }

    /// Sets the terminal outcome. Fails if one is already recorded.
    pub fn close(&mut self, outcome: MergeOutcome) -> Result<()> {
        if !outcome.is_terminal() {
            return Err(ForemanError::state_transition(
                "not_terminal",
                "A publication can only be closed with a terminal outcome",
                "publication:close",
            )
            .for_publication(&self.remote_id));
        }
        self.ensure_pending("publication:close")?;
        self.merge_outcome = outcome;
        self.merge_intent = None;
        self.closed_at = Some(Utc::now());
        Ok(())
    }

    pub fn annotate_failure(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    fn ensure_pending(&self, origin: &str) -> Result<()> {
        if self.merge_outcome.is_terminal() {
            return Err(ForemanError::state_transition(
                "publication_closed",
                format!(
                    "Publication already closed as {}",
                    self.merge_outcome
                ),
                origin,
            )
            .for_publication(&self.remote_id)
            .for_work_unit(&self.work_unit));
        }
        Ok(())
    }
}

/// What the watcher should do with a pending publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    /// Every required role approved this cycle.
    Merge,
    /// A role blocked. Terminal.
    Reject { by: String },
    /// A role asked for changes; work resumes and the record stays pending.
    ChangesRequested { by: String },
    /// Some required roles have not reported yet.
    Waiting { missing: Vec<String> },
}

/// Computes the merge decision from the full verdict list.
///
/// Only verdicts from `cycle` count, and per role only the latest one.
/// Any `Block` rejects and any `RequestChanges` sends the work back, even
/// before every role has reported. Merging needs every required role to
/// approve; with no required roles configured nothing merges automatically.
#[must_use]
pub fn decide(required_roles: &[String], verdicts: &[ReviewVerdict], cycle: u32) -> MergeDecision {
    let mut latest: BTreeMap<&str, &ReviewVerdict> = BTreeMap::new();
    for verdict in verdicts.iter().filter(|v| v.cycle == cycle) {
        latest.insert(verdict.reviewer_id.as_str(), verdict);
    }

    if let Some(v) = latest.values().find(|v| v.decision == ReviewDecision::Block) {
        return MergeDecision::Reject {
            by: v.reviewer_id.clone(),
        };
    }
    if let Some(v) = latest
        .values()
        .find(|v| v.decision == ReviewDecision::RequestChanges)
    {
        return MergeDecision::ChangesRequested {
            by: v.reviewer_id.clone(),
        };
    }

    let missing: Vec<String> = required_roles
        .iter()
        .filter(|role| {
            !latest
                .get(role.as_str())
                .is_some_and(|v| v.decision == ReviewDecision::Approve)
        })
        .cloned()
        .collect();
    if missing.is_empty() && !required_roles.is_empty() {
        MergeDecision::Merge
    } else {
        MergeDecision::Waiting { missing }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> Vec<String> {
        vec!["security".to_string(), "docs".to_string()]
    }

    fn v(role: &str, decision: ReviewDecision) -> ReviewVerdict {
        ReviewVerdict::new(role, decision, 1)
    }

    #[test]
    fn all_required_approvals_merge() {
        let verdicts = vec![v("security", ReviewDecision::Approve), v("docs", ReviewDecision::Approve)];
        assert_eq!(decide(&roles(), &verdicts, 1), MergeDecision::Merge);
    }

    #[test]
    fn missing_roles_wait() {
        let verdicts = vec![v("security", ReviewDecision::Approve)];
        assert_eq!(
            decide(&roles(), &verdicts, 1),
            MergeDecision::Waiting {
                missing: vec!["docs".to_string()]
            }
        );
    }

    #[test]
    fn single_block_rejects_immediately() {
        let verdicts = vec![v("security", ReviewDecision::Block)];
        assert_eq!(
            decide(&roles(), &verdicts, 1),
            MergeDecision::Reject {
                by: "security".to_string()
            }
        );
    }

    #[test]
    fn request_changes_wins_over_approve() {
        let verdicts = vec![
            v("security", ReviewDecision::Approve),
            v("docs", ReviewDecision::RequestChanges),
        ];
        assert!(matches!(
            decide(&roles(), &verdicts, 1),
            MergeDecision::ChangesRequested { by } if by == "docs"
        ));
    }

    #[test]
    fn only_current_cycle_and_latest_verdict_count() {
        let verdicts = vec![
            v("docs", ReviewDecision::RequestChanges),
            ReviewVerdict::new("security", ReviewDecision::Approve, 2),
            ReviewVerdict::new("docs", ReviewDecision::RequestChanges, 2),
            ReviewVerdict::new("docs", ReviewDecision::Approve, 2),
        ];
        assert_eq!(decide(&roles(), &verdicts, 2), MergeDecision::Merge);
    }

    #[test]
    fn no_required_roles_never_auto_merges() {
        let verdicts = vec![v("anyone", ReviewDecision::Approve)];
        assert!(matches!(decide(&[], &verdicts, 1), MergeDecision::Waiting { .. }));
    }

    #[test]
    fn terminal_outcome_is_set_once() {
        let mut record = PublicationRecord::new("feat-x", "7");
        record.close(MergeOutcome::Merged).unwrap();
        let err = record.close(MergeOutcome::Rejected).unwrap_err();
        assert_eq!(err.code, "publication_closed");
        assert_eq!(record.merge_outcome, MergeOutcome::Merged);
        assert!(record.record_verdict(v("docs", ReviewDecision::Approve)).is_err());
        assert!(record.close(MergeOutcome::Pending).is_err());
    }

    #[test]
    fn new_cycle_clears_merge_intent() {
        let mut record = PublicationRecord::new("feat-y", "8");
        record.merge_intent = Some(MergeIntent {
            requested_at: Utc::now(),
            cycle: 1,
        });
        record.awaiting_republish = true;
        record.begin_cycle().unwrap();
        assert_eq!(record.cycle, 2);
        assert!(record.merge_intent.is_none());
        assert!(!record.awaiting_republish);
    }

    #[test]
    fn decision_parses_cli_spellings() {
        assert_eq!("request-changes".parse::<ReviewDecision>().unwrap(), ReviewDecision::RequestChanges);
        assert_eq!("APPROVE".parse::<ReviewDecision>().unwrap(), ReviewDecision::Approve);
        assert!("maybe".parse::<ReviewDecision>().is_err());
    }
}
