//! Publication and review state machine.
//!
//! The watcher publishes ready work units and drives each pending
//! [`PublicationRecord`] to merge, rejection or abandonment. Every step is
//! derived from persisted records and a fresh status query, so a restarted
//! watcher picks up where the previous one stopped.

use crate::adapters::host::{HostError, PublicationStatus, RemoteState, SharedHost};
use crate::core::aggregator::Verdict;
use crate::core::config::WatcherSettings;
use crate::core::error::{ErrorKind, ForemanError, Result};
use crate::core::lifecycle::LifecycleManager;
use crate::core::publication::{
    decide, MergeDecision, MergeIntent, MergeOutcome, PublicationRecord, ReviewDecision,
    ReviewVerdict,
};
use crate::core::retry::RetryPolicy;
use crate::core::workunit::{WorkUnit, WorkUnitState};
use crate::storage::journal::{JournalEntry, SharedJournal};
use crate::storage::state_store::SharedStateStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

/// An externally reported change to a publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalUpdate {
    Verdict {
        reviewer_id: String,
        decision: ReviewDecision,
        comments: String,
    },
    RemoteMerged,
    RemoteClosed,
}

/// What one watcher step did with a publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "step")]
pub enum StepOutcome {
    /// Required roles have not all reported.
    Waiting { missing: Vec<String> },
    /// Changes were requested earlier; waiting for the next publish.
    AwaitingRepublish,
    ChangesRequested { by: String },
    /// The host refused the merge as conflicting; work resumes.
    MergeConflict,
    Finalized { outcome: MergeOutcome },
    /// Another operation holds the work unit; retried next pass.
    Busy,
    Skipped { reason: String },
    /// A failure annotation blocks progress until an operator resolves it.
    NeedsOperator { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub remote_id: String,
    pub work_unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ForemanError>,
}

/// Result of one watcher pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    /// Work units torn down because their outcome was already recorded.
    pub reconciled: Vec<String>,
    pub steps: Vec<StepReport>,
}

impl PollReport {
    #[must_use]
    pub fn errors(&self) -> usize {
        self.steps.iter().filter(|s| s.error.is_some()).count()
    }
}

pub struct Watcher {
    store: SharedStateStore,
    journal: SharedJournal,
    host: SharedHost,
    lifecycle: Arc<LifecycleManager>,
    settings: WatcherSettings,
    retry: RetryPolicy,
}

const fn target_state(outcome: MergeOutcome) -> WorkUnitState {
    match outcome {
        MergeOutcome::Merged => WorkUnitState::Merged,
        MergeOutcome::Rejected => WorkUnitState::Rejected,
        MergeOutcome::Abandoned | MergeOutcome::Pending => WorkUnitState::Abandoned,
    }
}

impl Watcher {
    #[must_use]
    pub fn new(
        store: SharedStateStore,
        journal: SharedJournal,
        host: SharedHost,
        lifecycle: Arc<LifecycleManager>,
        settings: WatcherSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            journal,
            host,
            lifecycle,
            settings,
            retry,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &WatcherSettings {
        &self.settings
    }

    fn journal(&self, entry: JournalEntry) -> Result<()> {
        self.journal.append(entry)?;
        Ok(())
    }

    fn save(&self, record: &PublicationRecord) -> Result<()> {
        self.store.save_publication(record)?;
        Ok(())
    }

    pub fn publication(&self, remote_id: &str) -> Result<PublicationRecord> {
        self.store.load_publication(remote_id)?.ok_or_else(|| {
            ForemanError::not_found(
                "publication_not_found",
                format!("No publication record '{remote_id}'"),
                "watcher:publication",
            )
            .for_publication(remote_id)
        })
    }

    pub fn publications(&self) -> Result<Vec<PublicationRecord>> {
        Ok(self.store.list_publications()?)
    }

    /// Marks the record with a failed mutating call and converts the error.
    fn record_failure(
        &self,
        record: &mut PublicationRecord,
        op: &'static str,
        error: HostError,
    ) -> ForemanError {
        tracing::error!(remote_id = %record.remote_id, branch = %record.work_unit, op, error = %error, "collaborator call failed");
        record.annotate_failure(format!("{op}: {error}"));
        if let Err(e) = self.save(record) {
            tracing::error!(remote_id = %record.remote_id, error = %e, "could not persist failure annotation");
        }
        if let Err(e) = self.journal(
            JournalEntry::new(&record.remote_id, "collaborator_failure")
                .with("operation", op)
                .with("error", &error),
        ) {
            tracing::error!(remote_id = %record.remote_id, error = %e, "could not journal failure");
        }
        ForemanError::from(error)
            .for_publication(&record.remote_id)
            .for_work_unit(&record.work_unit)
    }

    /// Publishes a work unit whose last verdict is `Ready`.
    ///
    /// A unit left in `Publishing` by an interrupted publish is resumed. A
    /// record awaiting re-publish after requested changes starts a new cycle.
    pub fn publish(&self, branch: &str) -> Result<PublicationRecord> {
        let origin = "watcher:publish";
        let _lock = self.lifecycle.lock(branch, origin)?;
        let mut unit = self.lifecycle.status(branch)?;

        match unit.state {
            WorkUnitState::Publishing => {
                tracing::info!(branch, "resuming interrupted publish");
            }
            WorkUnitState::InProgress => {
                if unit.last_verdict != Some(Verdict::Ready) {
                    let verdict = unit
                        .last_verdict
                        .map_or_else(|| "none".to_string(), |v| v.to_string());
                    return Err(ForemanError::state_transition(
                        "verdict_not_ready",
                        format!("Cannot publish '{branch}': last verdict is {verdict}"),
                        origin,
                    )
                    .for_work_unit(branch)
                    .with_context("verdict", verdict)
                    .with_hint("Dispatch until the verdict is ready"));
                }
                self.lifecycle
                    .transition(&mut unit, WorkUnitState::Publishing, origin)?;
            }
            other => {
                return Err(ForemanError::state_transition(
                    "not_publishable",
                    format!("Cannot publish '{branch}' while it is {other}"),
                    origin,
                )
                .for_work_unit(branch));
            }
        }

        let pushed = self
            .host
            .commit(&unit.workspace_path, &format!("foreman: publish {branch}"))
            .and_then(|_| self.host.push(&unit.workspace_path, branch));
        if let Err(e) = pushed {
            return Err(self.annotate_unit_failure(&mut unit, "push", e));
        }

        let remote_id = match self.host.open_publication(branch, &unit.parent_ref, branch) {
            Ok(id) => id,
            Err(e) => return Err(self.annotate_unit_failure(&mut unit, "open_publication", e)),
        };

        if let Some(previous) = unit.publication.clone().filter(|id| *id != remote_id) {
            self.supersede(&previous)?;
        }

        let mut record = match self.store.load_publication(&remote_id)? {
            Some(record) if record.is_pending() && record.work_unit == branch => record,
            Some(record) => {
                return Err(ForemanError::conflict(
                    "publication_closed",
                    format!(
                        "Host returned publication {remote_id}, already closed as {}",
                        record.merge_outcome
                    ),
                    origin,
                )
                .for_work_unit(branch)
                .for_publication(&remote_id));
            }
            None => {
                let record = PublicationRecord::new(branch, &remote_id);
                self.journal(JournalEntry::new(&remote_id, "opened").with("work_unit", branch))?;
                record
            }
        };
        if record.awaiting_republish {
            record.begin_cycle()?;
            self.journal(JournalEntry::new(&remote_id, "cycle_started").with("cycle", record.cycle))?;
        }
        self.save(&record)?;

        unit.publication = Some(remote_id.clone());
        self.lifecycle
            .transition(&mut unit, WorkUnitState::UnderReview, origin)?;
        tracing::info!(branch, remote_id = %remote_id, cycle = record.cycle, "published");
        Ok(record)
    }

    fn annotate_unit_failure(
        &self,
        unit: &mut WorkUnit,
        op: &'static str,
        error: HostError,
    ) -> ForemanError {
        tracing::error!(branch = %unit.branch_name, op, error = %error, "publish step failed");
        unit.annotate("watcher:publish", format!("{op} failed: {error}"));
        if let Err(e) = self.lifecycle.save(unit) {
            tracing::error!(branch = %unit.branch_name, error = %e, "could not persist failure annotation");
        }
        if let Err(e) = self.journal(
            JournalEntry::new(&unit.branch_name, "collaborator_failure")
                .with("operation", op)
                .with("error", &error),
        ) {
            tracing::error!(branch = %unit.branch_name, error = %e, "could not journal failure");
        }
        ForemanError::from(error).for_work_unit(&unit.branch_name)
    }

    /// Closes a pending record replaced by a new host publication.
    fn supersede(&self, remote_id: &str) -> Result<()> {
        let Some(mut record) = self.store.load_publication(remote_id)? else {
            return Ok(());
        };
        if !record.is_pending() {
            return Ok(());
        }
        record.close(MergeOutcome::Abandoned)?;
        self.save(&record)?;
        self.journal(
            JournalEntry::new(remote_id, "closed")
                .with("outcome", MergeOutcome::Abandoned)
                .with("reason", "superseded"),
        )
    }

    /// One pass: reconcile recorded outcomes, then step every pending record.
    pub fn poll(&self) -> Result<PollReport> {
        let mut report = PollReport {
            reconciled: self.reconcile()?,
            steps: Vec::new(),
        };

        let pending: Vec<PublicationRecord> = self
            .store
            .list_publications()?
            .into_iter()
            .filter(|r| r.is_pending() && !r.archived)
            .collect();

        for chunk in pending.chunks(self.settings.max_parallel_publications.max(1)) {
            let steps: Vec<StepReport> = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|record| (record, scope.spawn(move || self.step(&record.remote_id))))
                    .collect();
                handles
                    .into_iter()
                    .map(|(record, handle)| {
                        let result = handle.join().unwrap_or_else(|_| {
                            Err(ForemanError::system(
                                "watcher_step_panicked",
                                "Watcher step panicked",
                                "watcher:poll",
                            )
                            .for_publication(&record.remote_id))
                        });
                        let (outcome, error) = match result {
                            Ok(outcome) => (Some(outcome), None),
                            Err(e) => (None, Some(e)),
                        };
                        StepReport {
                            remote_id: record.remote_id.clone(),
                            work_unit: record.work_unit.clone(),
                            outcome,
                            error,
                        }
                    })
                    .collect()
            });
            report.steps.extend(steps);
        }
        Ok(report)
    }

    /// Finishes work units whose outcome is recorded but whose teardown
    /// did not complete.
    fn reconcile(&self) -> Result<Vec<String>> {
        let origin = "watcher:reconcile";
        let mut done = Vec::new();
        for unit in self.lifecycle.list()? {
            let closed_record = match unit.publication.as_deref() {
                Some(id) if unit.state.is_live() => self
                    .store
                    .load_publication(id)?
                    .filter(|r| r.merge_outcome.is_terminal()),
                _ => None,
            };
            if !unit.state.is_outcome() && closed_record.is_none() {
                continue;
            }

            let _lock = match self.lifecycle.lock(&unit.branch_name, origin) {
                Ok(lock) => lock,
                Err(e) if e.kind == ErrorKind::Conflict => continue,
                Err(e) => return Err(e),
            };
            let mut unit = self.lifecycle.status(&unit.branch_name)?;
            if let Some(record) = closed_record {
                if unit.state.is_live() {
                    let next = target_state(record.merge_outcome);
                    let next = if unit.can_transition_to(next) {
                        next
                    } else {
                        WorkUnitState::Abandoned
                    };
                    self.lifecycle.transition(&mut unit, next, origin)?;
                }
            }
            if unit.state.is_outcome() {
                let merged = unit.state == WorkUnitState::Merged;
                match self.lifecycle.finish_teardown(&mut unit) {
                    Ok(()) => {
                        if merged {
                            self.delete_merged_branch(&unit.branch_name);
                        }
                        done.push(unit.branch_name.clone());
                    }
                    Err(e) => {
                        tracing::warn!(branch = %unit.branch_name, error = %e, "teardown still failing");
                    }
                }
            }
        }
        Ok(done)
    }

    /// Advances one publication from a fresh host status.
    pub fn step(&self, remote_id: &str) -> Result<StepOutcome> {
        let origin = "watcher:step";
        let record = self.publication(remote_id)?;
        if !record.is_pending() {
            return Ok(StepOutcome::Skipped {
                reason: format!("closed as {}", record.merge_outcome),
            });
        }
        if let Some(reason) = record.failure {
            return Ok(StepOutcome::NeedsOperator { reason });
        }

        let _lock = match self.lifecycle.lock(&record.work_unit, origin) {
            Ok(lock) => lock,
            Err(e) if e.kind == ErrorKind::Conflict => return Ok(StepOutcome::Busy),
            Err(e) => return Err(e),
        };
        let mut record = self.publication(remote_id)?;
        if !record.is_pending() {
            return Ok(StepOutcome::Skipped {
                reason: format!("closed as {}", record.merge_outcome),
            });
        }

        let status = self.remote_status(&record)?;
        let mut unit = self.lifecycle.status(&record.work_unit)?;
        self.import_reviews(&mut record, &unit, &status)?;
        self.advance(&mut record, &mut unit, Some(status.state))
    }

    /// Queries the host with retries. Failures are logged, never annotated.
    fn remote_status(&self, record: &PublicationRecord) -> Result<PublicationStatus> {
        let remote_id = record.remote_id.as_str();
        self.retry
            .run("get_publication_status", || self.host.get_publication_status(remote_id))
            .map_err(|(e, attempts)| {
                self.log_unresolved(record, &e, attempts);
                ForemanError::from(e)
                    .recoverable(true)
                    .for_publication(remote_id)
                    .for_work_unit(&record.work_unit)
            })
    }

    /// Logs a failed status query; severity grows with the record's age
    /// relative to the staleness window.
    fn log_unresolved(&self, record: &PublicationRecord, error: &HostError, attempts: u32) {
        let age = Utc::now() - record.cycle_started_at;
        let window = self.settings.staleness_window();
        let age_secs = age.num_seconds();
        if age <= window {
            tracing::info!(remote_id = %record.remote_id, attempts, age_secs, error = %error, "publication status unavailable");
        } else if age <= window * 2 {
            tracing::warn!(remote_id = %record.remote_id, attempts, age_secs, error = %error, "publication status unavailable past staleness window");
        } else {
            tracing::error!(remote_id = %record.remote_id, attempts, age_secs, error = %error, "publication status unavailable for over twice the staleness window");
        }
    }

    /// Copies reviews the host reports since the last step into the current
    /// cycle. Reviews posted while the unit is not under review are dropped.
    fn import_reviews(
        &self,
        record: &mut PublicationRecord,
        unit: &WorkUnit,
        status: &PublicationStatus,
    ) -> Result<()> {
        if status.reviews.len() <= record.remote_reviews_seen {
            return Ok(());
        }
        let accept = unit.state == WorkUnitState::UnderReview
            && unit.publication.as_deref() == Some(record.remote_id.as_str());
        for review in &status.reviews[record.remote_reviews_seen..] {
            if !accept {
                tracing::debug!(remote_id = %record.remote_id, reviewer = %review.reviewer_id, "ignoring review posted outside a review cycle");
                continue;
            }
            record.record_verdict(
                ReviewVerdict::new(&review.reviewer_id, review.decision, record.cycle)
                    .with_comments(&review.comments),
            )?;
            self.journal(
                JournalEntry::new(&record.remote_id, "verdict")
                    .with("reviewer", &review.reviewer_id)
                    .with("decision", review.decision)
                    .with("cycle", record.cycle)
                    .with("source", "host"),
            )?;
        }
        record.remote_reviews_seen = status.reviews.len();
        self.save(record)
    }

    /// Applies an externally reported update and advances the record.
    pub fn on_external_event(&self, remote_id: &str, update: ExternalUpdate) -> Result<StepOutcome> {
        let origin = "watcher:external_event";
        let record = self.publication(remote_id)?;
        let _lock = self.lifecycle.lock(&record.work_unit, origin)?;
        let mut record = self.publication(remote_id)?;
        if !record.is_pending() {
            return Err(ForemanError::state_transition(
                "publication_closed",
                format!("Publication {remote_id} is already closed as {}", record.merge_outcome),
                origin,
            )
            .for_publication(remote_id)
            .for_work_unit(&record.work_unit));
        }
        if let Some(reason) = record.failure {
            return Ok(StepOutcome::NeedsOperator { reason });
        }
        let mut unit = self.lifecycle.status(&record.work_unit)?;

        let remote = match update {
            ExternalUpdate::Verdict {
                reviewer_id,
                decision,
                comments,
            } => {
                if unit.state != WorkUnitState::UnderReview
                    || unit.publication.as_deref() != Some(remote_id)
                {
                    return Err(ForemanError::state_transition(
                        "not_under_review",
                        format!(
                            "Work unit '{}' is {}; verdicts are only accepted under review",
                            unit.branch_name, unit.state
                        ),
                        origin,
                    )
                    .for_work_unit(&unit.branch_name)
                    .for_publication(remote_id));
                }
                if record.has_verdict(&reviewer_id, decision, record.cycle) {
                    tracing::debug!(remote_id, reviewer = %reviewer_id, %decision, "verdict already recorded for this cycle");
                } else {
                    record.record_verdict(
                        ReviewVerdict::new(&reviewer_id, decision, record.cycle)
                            .with_comments(comments),
                    )?;
                    self.save(&record)?;
                    self.journal(
                        JournalEntry::new(remote_id, "verdict")
                            .with("reviewer", &reviewer_id)
                            .with("decision", decision)
                            .with("cycle", record.cycle),
                    )?;
                    tracing::info!(remote_id, reviewer = %reviewer_id, %decision, "verdict recorded");
                }
                None
            }
            ExternalUpdate::RemoteMerged => Some(RemoteState::Merged),
            ExternalUpdate::RemoteClosed => Some(RemoteState::Closed),
        };
        self.advance(&mut record, &mut unit, remote)
    }

    /// Decides the next action for a pending record. The caller holds the
    /// work unit's operation lock.
    fn advance(
        &self,
        record: &mut PublicationRecord,
        unit: &mut WorkUnit,
        remote: Option<RemoteState>,
    ) -> Result<StepOutcome> {
        if record.merge_intent.is_some() {
            // the outcome of an earlier merge request is only known to the host
            let remote = match remote {
                Some(state) => state,
                None => self.remote_status(record)?.state,
            };
            return match remote {
                RemoteState::Merged => self.finalize(record, unit, MergeOutcome::Merged, "merged"),
                RemoteState::Closed => {
                    self.finalize(record, unit, MergeOutcome::Abandoned, "closed on host after merge request")
                }
                RemoteState::Open => {
                    let reason = "merge was requested but the host still reports the publication open";
                    record.annotate_failure(reason);
                    self.save(record)?;
                    self.journal(
                        JournalEntry::new(&record.remote_id, "merge_unconfirmed").with("cycle", record.cycle),
                    )?;
                    tracing::error!(remote_id = %record.remote_id, "merge outcome unknown; operator action required");
                    Ok(StepOutcome::NeedsOperator {
                        reason: reason.to_string(),
                    })
                }
            };
        }

        match remote {
            Some(RemoteState::Merged) => {
                return self.finalize(record, unit, MergeOutcome::Merged, "merged on host");
            }
            Some(RemoteState::Closed) => {
                return self.finalize(record, unit, MergeOutcome::Abandoned, "closed on host");
            }
            Some(RemoteState::Open) | None => {}
        }

        if unit.state != WorkUnitState::UnderReview {
            return Ok(StepOutcome::AwaitingRepublish);
        }

        match decide(&self.settings.required_roles, &record.review_verdicts, record.cycle) {
            MergeDecision::Reject { by } => {
                let reason = format!("blocked by {by}");
                if let Err(e) = self.host.close_publication(&record.remote_id, &reason) {
                    return Err(self.record_failure(record, "close_publication", e));
                }
                self.finalize(record, unit, MergeOutcome::Rejected, &reason)
            }
            MergeDecision::ChangesRequested { by } => {
                record.awaiting_republish = true;
                self.save(record)?;
                self.journal(
                    JournalEntry::new(&record.remote_id, "changes_requested")
                        .with("by", &by)
                        .with("cycle", record.cycle),
                )?;
                self.resume_work(unit, format!("changes requested by {by}"))?;
                Ok(StepOutcome::ChangesRequested { by })
            }
            MergeDecision::Merge => self.merge(record, unit),
            MergeDecision::Waiting { missing } => {
                if Utc::now() - record.cycle_started_at <= self.settings.staleness_window() {
                    return Ok(StepOutcome::Waiting { missing });
                }
                let reason = "no review outcome within the staleness window";
                if let Err(e) = self.host.close_publication(&record.remote_id, reason) {
                    return Err(self.record_failure(record, "close_publication", e));
                }
                self.finalize(record, unit, MergeOutcome::Abandoned, reason)
            }
        }
    }

    /// Sends a unit under review back to work, keeping its workspace.
    fn resume_work(&self, unit: &mut WorkUnit, reason: String) -> Result<()> {
        unit.last_verdict = None;
        unit.annotate("watcher", reason);
        self.lifecycle
            .transition(unit, WorkUnitState::InProgress, "watcher:advance")
    }

    fn merge(&self, record: &mut PublicationRecord, unit: &mut WorkUnit) -> Result<StepOutcome> {
        let origin = "watcher:merge";
        match self
            .retry
            .run("diff_summary", || self.host.diff_summary(&unit.branch_name, &unit.parent_ref))
        {
            Ok(summary) => {
                tracing::info!(remote_id = %record.remote_id, branch = %unit.branch_name, diff = %summary, "merging");
            }
            Err((e, _)) => {
                tracing::warn!(remote_id = %record.remote_id, error = %e, "diff summary unavailable");
            }
        }

        let merge_lock = self.lifecycle.locks().merge(origin)?;
        record.merge_intent = Some(MergeIntent {
            requested_at: Utc::now(),
            cycle: record.cycle,
        });
        self.save(record)?;
        self.journal(JournalEntry::new(&record.remote_id, "merge_requested").with("cycle", record.cycle))?;

        let merged = self.host.merge(&record.remote_id);
        drop(merge_lock);
        match merged {
            Ok(()) => self.finalize(record, unit, MergeOutcome::Merged, "all required roles approved"),
            Err(e) if e.is_merge_conflict() => {
                tracing::warn!(remote_id = %record.remote_id, error = %e, "merge conflict");
                record.merge_intent = None;
                record.awaiting_republish = true;
                self.save(record)?;
                self.journal(
                    JournalEntry::new(&record.remote_id, "merge_conflict")
                        .with("cycle", record.cycle)
                        .with("error", &e),
                )?;
                self.resume_work(unit, format!("merge conflict: {e}"))?;
                Ok(StepOutcome::MergeConflict)
            }
            Err(e) => Err(self.record_failure(record, "merge", e)),
        }
    }

    /// Records the terminal outcome, then moves the unit to the matching
    /// state and tears it down.
    fn finalize(
        &self,
        record: &mut PublicationRecord,
        unit: &mut WorkUnit,
        outcome: MergeOutcome,
        reason: &str,
    ) -> Result<StepOutcome> {
        let origin = "watcher:finalize";
        record.close(outcome)?;
        self.save(record)?;
        self.journal(
            JournalEntry::new(&record.remote_id, "closed")
                .with("outcome", outcome)
                .with("reason", reason)
                .with("cycle", record.cycle),
        )?;
        tracing::info!(remote_id = %record.remote_id, branch = %unit.branch_name, %outcome, reason, "publication closed");

        if unit.publication.as_deref() != Some(record.remote_id.as_str()) {
            return Ok(StepOutcome::Finalized { outcome });
        }
        if unit.state.is_live() {
            let target = target_state(outcome);
            let next = if unit.can_transition_to(target) {
                target
            } else {
                WorkUnitState::Abandoned
            };
            unit.annotate(origin, reason);
            self.lifecycle.transition(unit, next, origin)?;
        }
        if unit.state.is_outcome() {
            self.lifecycle.finish_teardown(unit)?;
        }
        if outcome == MergeOutcome::Merged {
            self.delete_merged_branch(&unit.branch_name);
        }
        Ok(StepOutcome::Finalized { outcome })
    }

    /// Removes the pushed branch of a merged unit. Rejected and abandoned
    /// branches stay on the remote for inspection.
    fn delete_merged_branch(&self, branch: &str) {
        if !self.settings.delete_branch_on_merge {
            return;
        }
        if let Err(e) = self.host.delete_remote_branch(branch) {
            tracing::warn!(branch, error = %e, "remote branch cleanup failed");
        }
    }

    /// Clears a failure annotation and any unconfirmed merge intent.
    pub fn resolve(&self, remote_id: &str) -> Result<PublicationRecord> {
        let origin = "watcher:resolve";
        let record = self.publication(remote_id)?;
        let _lock = self.lifecycle.lock(&record.work_unit, origin)?;
        let mut record = self.publication(remote_id)?;
        let cleared = record.failure.take();
        let had_intent = record.merge_intent.take().is_some();
        self.save(&record)?;
        self.journal(
            JournalEntry::new(remote_id, "resolved")
                .with("failure", cleared.unwrap_or_default())
                .with("merge_intent_cleared", had_intent),
        )?;
        Ok(record)
    }

    /// Marks a closed record archived so its branch name can be reused.
    pub fn archive(&self, remote_id: &str) -> Result<PublicationRecord> {
        let mut record = self.publication(remote_id)?;
        if !record.merge_outcome.is_terminal() {
            return Err(ForemanError::state_transition(
                "not_terminal",
                format!("Publication {remote_id} is still pending"),
                "watcher:archive",
            )
            .for_publication(remote_id)
            .for_work_unit(&record.work_unit));
        }
        if record.archived {
            return Ok(record);
        }
        record.archived = true;
        self.save(&record)?;
        self.journal(JournalEntry::new(remote_id, "archived"))?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::host::{RemoteReview, VcsHost};
    use crate::adapters::local::LocalHost;
    use crate::core::lock::LockDir;
    use crate::storage::journal::{InMemoryJournal, Journal, JournalFilter};
    use crate::storage::state_store::{InMemoryStateStore, StateStore};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<InMemoryStateStore>,
        journal: Arc<InMemoryJournal>,
        host: Arc<LocalHost>,
        lifecycle: Arc<LifecycleManager>,
        watcher: Watcher,
    }

    fn fixture_with(settings: WatcherSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStateStore::new());
        let journal = Arc::new(InMemoryJournal::new());
        let host = Arc::new(LocalHost::in_memory(dir.path().join("ws")));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            journal.clone(),
            host.clone(),
            LockDir::new(dir.path()),
            RetryPolicy::immediate(2),
        ));
        let watcher = Watcher::new(
            store.clone(),
            journal.clone(),
            host.clone(),
            lifecycle.clone(),
            settings,
            RetryPolicy::immediate(2),
        );
        Fixture {
            _dir: dir,
            store,
            journal,
            host,
            lifecycle,
            watcher,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(WatcherSettings {
            required_roles: vec!["security".to_string(), "docs".to_string()],
            ..WatcherSettings::default()
        })
    }

    impl Fixture {
        fn ready_unit(&self, branch: &str, verdict: Verdict) -> WorkUnit {
            let mut unit = self.lifecycle.create(branch, "main").unwrap();
            std::fs::write(unit.workspace_path.join("change.txt"), branch).unwrap();
            unit.last_verdict = Some(verdict);
            self.store.save_work_unit(&unit).unwrap();
            unit
        }

        fn verdict(&self, id: &str, role: &str, decision: ReviewDecision) -> StepOutcome {
            self.watcher
                .on_external_event(
                    id,
                    ExternalUpdate::Verdict {
                        reviewer_id: role.to_string(),
                        decision,
                        comments: String::new(),
                    },
                )
                .unwrap()
        }

        fn unit(&self, branch: &str) -> WorkUnit {
            self.store.load_work_unit(branch).unwrap().unwrap()
        }
    }

    #[test]
    fn publish_requires_ready_verdict() {
        let fx = fixture();
        fx.ready_unit("feat-b", Verdict::Blocked);
        let err = fx.watcher.publish("feat-b").unwrap_err();
        assert_eq!(err.kind, ErrorKind::StateTransition);
        assert_eq!(err.code, "verdict_not_ready");
        assert_eq!(err.subject(), Some("feat-b"));
        assert_eq!(fx.unit("feat-b").state, WorkUnitState::InProgress);
        assert!(fx.store.list_publications().unwrap().is_empty());
    }

    #[test]
    fn unanimous_approval_merges_and_tears_down_once() {
        let fx = fixture();
        let unit = fx.ready_unit("feat-x", Verdict::Ready);
        let record = fx.watcher.publish("feat-x").unwrap();
        assert_eq!(fx.unit("feat-x").state, WorkUnitState::UnderReview);

        assert_eq!(
            fx.verdict(&record.remote_id, "security", ReviewDecision::Approve),
            StepOutcome::Waiting {
                missing: vec!["docs".to_string()]
            }
        );
        assert_eq!(
            fx.verdict(&record.remote_id, "docs", ReviewDecision::Approve),
            StepOutcome::Finalized {
                outcome: MergeOutcome::Merged
            }
        );

        let unit_after = fx.unit("feat-x");
        assert_eq!(unit_after.state, WorkUnitState::TornDown);
        assert!(!unit.workspace_path.exists());
        let removals = fx
            .host
            .calls()
            .iter()
            .filter(|c| c.starts_with("remove_workspace:"))
            .count();
        assert_eq!(removals, 1);

        let report = fx.watcher.poll().unwrap();
        assert!(report.steps.is_empty());
        assert!(report.reconciled.is_empty());
        let stored = fx.watcher.publication(&record.remote_id).unwrap();
        assert_eq!(stored.merge_outcome, MergeOutcome::Merged);
        assert!(stored.merge_intent.is_none());
    }

    #[test]
    fn request_changes_returns_to_work_and_keeps_workspace() {
        let fx = fixture();
        let unit = fx.ready_unit("feat-y", Verdict::Ready);
        let record = fx.watcher.publish("feat-y").unwrap();
        fx.verdict(&record.remote_id, "security", ReviewDecision::Approve);
        assert_eq!(
            fx.verdict(&record.remote_id, "docs", ReviewDecision::RequestChanges),
            StepOutcome::ChangesRequested {
                by: "docs".to_string()
            }
        );

        let unit_after = fx.unit("feat-y");
        assert_eq!(unit_after.state, WorkUnitState::InProgress);
        assert_eq!(unit_after.last_verdict, None);
        assert!(unit.workspace_path.exists());
        let stored = fx.watcher.publication(&record.remote_id).unwrap();
        assert_eq!(stored.merge_outcome, MergeOutcome::Pending);
        assert_eq!(fx.watcher.step(&record.remote_id).unwrap(), StepOutcome::AwaitingRepublish);
    }

    #[test]
    fn republish_starts_a_new_cycle_with_fresh_verdicts() {
        let fx = fixture();
        fx.ready_unit("feat-y", Verdict::Ready);
        let first = fx.watcher.publish("feat-y").unwrap();
        fx.verdict(&first.remote_id, "security", ReviewDecision::Approve);
        fx.verdict(&first.remote_id, "docs", ReviewDecision::RequestChanges);

        let mut unit = fx.unit("feat-y");
        std::fs::write(unit.workspace_path.join("fix.txt"), "fixed").unwrap();
        unit.last_verdict = Some(Verdict::Ready);
        fx.store.save_work_unit(&unit).unwrap();

        let second = fx.watcher.publish("feat-y").unwrap();
        assert_eq!(second.remote_id, first.remote_id);
        assert_eq!(second.cycle, 2);
        assert!(!second.awaiting_republish);

        // the cycle 1 approval from security no longer counts
        assert_eq!(
            fx.verdict(&second.remote_id, "docs", ReviewDecision::Approve),
            StepOutcome::Waiting {
                missing: vec!["security".to_string()]
            }
        );
    }

    #[test]
    fn block_rejects_and_closes_on_host() {
        let fx = fixture();
        fx.ready_unit("feat-z", Verdict::Ready);
        let record = fx.watcher.publish("feat-z").unwrap();
        assert_eq!(
            fx.verdict(&record.remote_id, "security", ReviewDecision::Block),
            StepOutcome::Finalized {
                outcome: MergeOutcome::Rejected
            }
        );
        assert_eq!(fx.unit("feat-z").state, WorkUnitState::TornDown);
        assert_eq!(
            fx.host.get_publication_status(&record.remote_id).unwrap().state,
            RemoteState::Closed
        );
        let err = fx
            .watcher
            .on_external_event(&record.remote_id, ExternalUpdate::RemoteMerged)
            .unwrap_err();
        assert_eq!(err.code, "publication_closed");
    }

    #[test]
    fn poll_imports_host_reviews_and_merges() {
        let fx = fixture();
        fx.ready_unit("feat-x", Verdict::Ready);
        let record = fx.watcher.publish("feat-x").unwrap();
        for role in ["security", "docs"] {
            fx.host
                .add_review(
                    &record.remote_id,
                    RemoteReview {
                        reviewer_id: role.to_string(),
                        decision: ReviewDecision::Approve,
                        comments: "lgtm".to_string(),
                    },
                )
                .unwrap();
        }

        let report = fx.watcher.poll().unwrap();
        assert_eq!(report.steps.len(), 1);
        assert_eq!(
            report.steps[0].outcome,
            Some(StepOutcome::Finalized {
                outcome: MergeOutcome::Merged
            })
        );
        let stored = fx.watcher.publication(&record.remote_id).unwrap();
        assert_eq!(stored.review_verdicts.len(), 2);
        assert_eq!(stored.remote_reviews_seen, 2);
    }

    #[test]
    fn merge_conflict_sends_work_back() {
        let fx = fixture();
        fx.ready_unit("feat-c", Verdict::Ready);
        let record = fx.watcher.publish("feat-c").unwrap();
        fx.verdict(&record.remote_id, "security", ReviewDecision::Approve);
        fx.host.fail_next("merge", "merge conflict in src/lib.rs");
        assert_eq!(
            fx.verdict(&record.remote_id, "docs", ReviewDecision::Approve),
            StepOutcome::MergeConflict
        );
        let stored = fx.watcher.publication(&record.remote_id).unwrap();
        assert!(stored.is_pending());
        assert!(stored.merge_intent.is_none());
        assert!(stored.awaiting_republish);
        assert_eq!(fx.unit("feat-c").state, WorkUnitState::InProgress);
    }

    #[test]
    fn failed_merge_is_annotated_and_never_retried() {
        let fx = fixture();
        fx.ready_unit("feat-m", Verdict::Ready);
        let record = fx.watcher.publish("feat-m").unwrap();
        fx.verdict(&record.remote_id, "security", ReviewDecision::Approve);
        fx.host.fail_next("merge", "gateway timeout");
        let err = fx
            .watcher
            .on_external_event(
                &record.remote_id,
                ExternalUpdate::Verdict {
                    reviewer_id: "docs".to_string(),
                    decision: ReviewDecision::Approve,
                    comments: String::new(),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExternalCollaborator);

        let stored = fx.watcher.publication(&record.remote_id).unwrap();
        assert!(stored.failure.is_some());
        assert!(stored.merge_intent.is_some());
        assert!(matches!(
            fx.watcher.step(&record.remote_id).unwrap(),
            StepOutcome::NeedsOperator { .. }
        ));
        let merges = fx.host.calls().iter().filter(|c| c.starts_with("merge:")).count();
        assert_eq!(merges, 1);
    }

    #[test]
    fn restart_with_merge_intent_resolves_from_host_status() {
        let fx = fixture();
        fx.ready_unit("feat-r", Verdict::Ready);
        let record = fx.watcher.publish("feat-r").unwrap();

        // crash after the merge went through but before the outcome was saved
        let mut stored = fx.watcher.publication(&record.remote_id).unwrap();
        stored.merge_intent = Some(MergeIntent {
            requested_at: Utc::now(),
            cycle: 1,
        });
        fx.store.save_publication(&stored).unwrap();
        fx.host
            .set_remote_state(&record.remote_id, RemoteState::Merged)
            .unwrap();

        assert_eq!(
            fx.watcher.step(&record.remote_id).unwrap(),
            StepOutcome::Finalized {
                outcome: MergeOutcome::Merged
            }
        );
        assert!(!fx.host.calls().iter().any(|c| c.starts_with("merge:")));
        assert_eq!(fx.unit("feat-r").state, WorkUnitState::TornDown);
    }

    #[test]
    fn stale_publication_is_abandoned() {
        let fx = fixture_with(WatcherSettings {
            required_roles: vec!["security".to_string()],
            staleness_window_secs: 60,
            ..WatcherSettings::default()
        });
        fx.ready_unit("feat-s", Verdict::Ready);
        let record = fx.watcher.publish("feat-s").unwrap();
        let mut stored = fx.watcher.publication(&record.remote_id).unwrap();
        stored.cycle_started_at = Utc::now() - chrono::Duration::hours(2);
        fx.store.save_publication(&stored).unwrap();

        assert_eq!(
            fx.watcher.step(&record.remote_id).unwrap(),
            StepOutcome::Finalized {
                outcome: MergeOutcome::Abandoned
            }
        );
        assert_eq!(fx.unit("feat-s").state, WorkUnitState::TornDown);
    }

    #[test]
    fn remote_close_abandons() {
        let fx = fixture();
        fx.ready_unit("feat-q", Verdict::Ready);
        let record = fx.watcher.publish("feat-q").unwrap();
        fx.host
            .set_remote_state(&record.remote_id, RemoteState::Closed)
            .unwrap();
        assert_eq!(
            fx.watcher.step(&record.remote_id).unwrap(),
            StepOutcome::Finalized {
                outcome: MergeOutcome::Abandoned
            }
        );
    }

    #[test]
    fn status_failures_are_retried_then_reported() {
        let fx = fixture();
        fx.ready_unit("feat-t", Verdict::Ready);
        let record = fx.watcher.publish("feat-t").unwrap();

        fx.host.fail_next("get_publication_status", "timeout");
        assert!(matches!(
            fx.watcher.step(&record.remote_id).unwrap(),
            StepOutcome::Waiting { .. }
        ));
        assert!(fx.watcher.publication(&record.remote_id).unwrap().failure.is_none());
    }

    #[test]
    fn busy_work_unit_is_skipped() {
        let fx = fixture();
        fx.ready_unit("feat-l", Verdict::Ready);
        let record = fx.watcher.publish("feat-l").unwrap();
        let _held = fx.lifecycle.lock("feat-l", "test").unwrap();
        assert_eq!(fx.watcher.step(&record.remote_id).unwrap(), StepOutcome::Busy);
    }

    #[test]
    fn archive_requires_terminal_record() {
        let fx = fixture();
        fx.ready_unit("feat-a", Verdict::Ready);
        let record = fx.watcher.publish("feat-a").unwrap();
        assert_eq!(
            fx.watcher.archive(&record.remote_id).unwrap_err().code,
            "not_terminal"
        );
        fx.verdict(&record.remote_id, "security", ReviewDecision::Block);
        assert!(fx.watcher.archive(&record.remote_id).unwrap().archived);

        let actions: Vec<_> = fx
            .journal
            .read(&JournalFilter::for_subject(record.remote_id.clone()))
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, ["opened", "verdict", "closed", "archived"]);
    }

    #[test]
    fn reconcile_finishes_interrupted_teardown() {
        let fx = fixture();
        fx.ready_unit("feat-i", Verdict::Ready);
        let record = fx.watcher.publish("feat-i").unwrap();
        let mut stored = fx.watcher.publication(&record.remote_id).unwrap();
        stored.close(MergeOutcome::Merged).unwrap();
        fx.store.save_publication(&stored).unwrap();

        let report = fx.watcher.poll().unwrap();
        assert_eq!(report.reconciled, ["feat-i"]);
        let unit = fx.unit("feat-i");
        assert_eq!(unit.state, WorkUnitState::TornDown);
        assert!(!unit.workspace_path.exists());
    }

    fn remote_deletes(fx: &Fixture) -> Vec<String> {
        fx.host
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("delete_remote_branch:"))
            .collect()
    }

    #[test]
    fn merge_removes_the_pushed_branch() {
        let fx = fixture();
        fx.ready_unit("feat-x", Verdict::Ready);
        let record = fx.watcher.publish("feat-x").unwrap();
        assert!(fx.host.is_pushed("feat-x"));
        fx.verdict(&record.remote_id, "security", ReviewDecision::Approve);
        fx.verdict(&record.remote_id, "docs", ReviewDecision::Approve);

        assert_eq!(remote_deletes(&fx), ["delete_remote_branch:feat-x"]);
        assert!(!fx.host.is_pushed("feat-x"));
    }

    #[test]
    fn rejected_and_abandoned_keep_the_pushed_branch() {
        let fx = fixture();
        fx.ready_unit("feat-z", Verdict::Ready);
        let rejected = fx.watcher.publish("feat-z").unwrap();
        fx.verdict(&rejected.remote_id, "security", ReviewDecision::Block);

        fx.ready_unit("feat-q", Verdict::Ready);
        let closed = fx.watcher.publish("feat-q").unwrap();
        fx.host
            .set_remote_state(&closed.remote_id, RemoteState::Closed)
            .unwrap();
        fx.watcher.step(&closed.remote_id).unwrap();

        assert_eq!(fx.unit("feat-z").state, WorkUnitState::TornDown);
        assert_eq!(fx.unit("feat-q").state, WorkUnitState::TornDown);
        assert!(remote_deletes(&fx).is_empty());
        assert!(fx.host.is_pushed("feat-z"));
        assert!(fx.host.is_pushed("feat-q"));
    }

    #[test]
    fn merged_branch_is_kept_when_cleanup_is_disabled() {
        let fx = fixture_with(WatcherSettings {
            required_roles: vec!["security".to_string()],
            delete_branch_on_merge: false,
            ..WatcherSettings::default()
        });
        fx.ready_unit("feat-k", Verdict::Ready);
        let record = fx.watcher.publish("feat-k").unwrap();
        assert_eq!(
            fx.verdict(&record.remote_id, "security", ReviewDecision::Approve),
            StepOutcome::Finalized {
                outcome: MergeOutcome::Merged
            }
        );
        assert!(remote_deletes(&fx).is_empty());
    }

    #[test]
    fn merge_intent_on_an_external_verdict_checks_the_host_first() {
        let fx = fixture();
        fx.ready_unit("feat-e", Verdict::Ready);
        let record = fx.watcher.publish("feat-e").unwrap();

        let mut stored = fx.watcher.publication(&record.remote_id).unwrap();
        stored.merge_intent = Some(MergeIntent {
            requested_at: Utc::now(),
            cycle: 1,
        });
        fx.store.save_publication(&stored).unwrap();
        fx.host
            .set_remote_state(&record.remote_id, RemoteState::Merged)
            .unwrap();

        assert_eq!(
            fx.verdict(&record.remote_id, "security", ReviewDecision::Approve),
            StepOutcome::Finalized {
                outcome: MergeOutcome::Merged
            }
        );
        let stored = fx.watcher.publication(&record.remote_id).unwrap();
        assert!(stored.failure.is_none());
        assert_eq!(fx.unit("feat-e").state, WorkUnitState::TornDown);
    }

    #[test]
    fn merge_intent_with_open_host_needs_an_operator() {
        let fx = fixture();
        fx.ready_unit("feat-o", Verdict::Ready);
        let record = fx.watcher.publish("feat-o").unwrap();
        let mut stored = fx.watcher.publication(&record.remote_id).unwrap();
        stored.merge_intent = Some(MergeIntent {
            requested_at: Utc::now(),
            cycle: 1,
        });
        fx.store.save_publication(&stored).unwrap();

        assert!(matches!(
            fx.verdict(&record.remote_id, "security", ReviewDecision::Approve),
            StepOutcome::NeedsOperator { .. }
        ));
        assert!(fx.watcher.publication(&record.remote_id).unwrap().failure.is_some());
    }

    #[test]
    fn repeated_verdict_is_recorded_once() {
        let fx = fixture();
        fx.ready_unit("feat-d", Verdict::Ready);
        let record = fx.watcher.publish("feat-d").unwrap();
        for _ in 0..2 {
            assert_eq!(
                fx.verdict(&record.remote_id, "security", ReviewDecision::Approve),
                StepOutcome::Waiting {
                    missing: vec!["docs".to_string()]
                }
            );
        }
        let stored = fx.watcher.publication(&record.remote_id).unwrap();
        assert_eq!(stored.review_verdicts.len(), 1);
        let verdicts = fx
            .journal
            .read(&JournalFilter::for_subject(record.remote_id.clone()))
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "verdict")
            .count();
        assert_eq!(verdicts, 1);
    }
}
