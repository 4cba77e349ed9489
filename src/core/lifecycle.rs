//! Workspace lifecycle manager.
//!
//! Sole owner of work unit records: creation, state transitions, orphan
//! reclamation and teardown. Every transition is persisted and journaled
//! before the call returns.

use crate::adapters::host::SharedHost;
use crate::core::error::{ForemanError, Result};
use crate::core::lock::{LockDir, LockGuard};
use crate::core::publication::MergeOutcome;
use crate::core::retry::RetryPolicy;
use crate::core::workunit::{WorkUnit, WorkUnitState};
use crate::storage::journal::{JournalEntry, SharedJournal};
use crate::storage::state_store::SharedStateStore;
use chrono::Utc;
use serde::Serialize;

/// Result of a teardown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownOutcome {
    TornDown,
    /// The unit was already torn down; nothing happened.
    AlreadyTornDown,
}

/// A work unit reclaimed by [`LifecycleManager::reclaim_orphan`].
#[derive(Debug, Clone, Serialize)]
pub struct Reclaimed {
    pub work_unit: WorkUnit,
    /// Whether the workspace held work that existed nowhere else.
    pub had_unpublished_work: bool,
}

pub struct LifecycleManager {
    store: SharedStateStore,
    journal: SharedJournal,
    host: SharedHost,
    locks: LockDir,
    retry: RetryPolicy,
}

fn validate_branch_name(branch: &str) -> Result<()> {
    let origin = "lifecycle:create";
    let invalid = branch.trim().is_empty()
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.contains("..")
        || branch.chars().any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if invalid {
        return Err(ForemanError::user(
            "invalid_branch_name",
            format!("'{branch}' is not a usable branch name"),
            origin,
        )
        .with_hint("Use letters, digits, '-', '_', '.' and '/' separators"));
    }
    Ok(())
}

impl LifecycleManager {
    #[must_use]
    pub fn new(
        store: SharedStateStore,
        journal: SharedJournal,
        host: SharedHost,
        locks: LockDir,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            journal,
            host,
            locks,
            retry,
        }
    }

    #[must_use]
    pub fn locks(&self) -> &LockDir {
        &self.locks
    }

    /// Claims the single-writer slot of a work unit.
    pub fn lock(&self, branch: &str, origin: &'static str) -> Result<LockGuard> {
        self.locks.operation(branch, origin)
    }

    pub(crate) fn journal(&self, entry: JournalEntry) -> Result<()> {
        self.journal.append(entry)?;
        Ok(())
    }

    /// Creates a branch and workspace and moves the new unit to `InProgress`.
    pub fn create(&self, branch: &str, base_ref: &str) -> Result<WorkUnit> {
        let origin = "lifecycle:create";
        validate_branch_name(branch)?;
        let _lock = self.lock(branch, origin)?;

        if let Some(existing) = self.store.load_work_unit(branch)? {
            if existing.state.is_live() {
                return Err(ForemanError::conflict(
                    "work_unit_exists",
                    format!("Branch '{branch}' already has a live work unit ({})", existing.state),
                    origin,
                )
                .for_work_unit(branch));
            }
            if let Some(remote_id) = &existing.publication {
                let archived = self
                    .store
                    .load_publication(remote_id)?
                    .map_or(true, |record| record.archived);
                if !archived {
                    return Err(ForemanError::conflict(
                        "publication_not_archived",
                        format!("Branch '{branch}' can be reused once publication {remote_id} is archived"),
                        origin,
                    )
                    .for_work_unit(branch)
                    .for_publication(remote_id)
                    .with_hint(format!("Run: foreman publication archive {remote_id}")));
                }
            }
        }

        self.host.create_branch(branch, base_ref).map_err(|e| {
            ForemanError::from(e).for_work_unit(branch)
        })?;
        let workspace = match self.host.create_workspace(branch) {
            Ok(path) => path,
            Err(e) => {
                if let Err(cleanup) = self.host.delete_branch(branch) {
                    tracing::warn!(branch, error = %cleanup, "could not remove branch after failed workspace creation");
                }
                return Err(ForemanError::from(e).for_work_unit(branch));
            }
        };

        let mut unit = WorkUnit::new(branch, workspace, base_ref);
        self.store.save_work_unit(&unit)?;
        self.journal(
            JournalEntry::new(branch, "created")
                .with("base_ref", base_ref)
                .with("workspace", unit.workspace_path.display()),
        )?;
        self.transition(&mut unit, WorkUnitState::InProgress, origin)?;
        tracing::info!(branch, workspace = %unit.workspace_path.display(), "work unit created");
        Ok(unit)
    }

    pub fn status(&self, branch: &str) -> Result<WorkUnit> {
        self.store.load_work_unit(branch)?.ok_or_else(|| {
            ForemanError::not_found(
                "work_unit_not_found",
                format!("No work unit for branch '{branch}'"),
                "lifecycle:status",
            )
            .for_work_unit(branch)
        })
    }

    pub fn list(&self) -> Result<Vec<WorkUnit>> {
        Ok(self.store.list_work_units()?)
    }

    /// Persists a unit without changing its state.
    pub fn save(&self, unit: &WorkUnit) -> Result<()> {
        self.store.save_work_unit(unit)?;
        Ok(())
    }

    /// Applies, persists and journals a state transition.
    pub fn transition(
        &self,
        unit: &mut WorkUnit,
        next: WorkUnitState,
        origin: &'static str,
    ) -> Result<()> {
        let from = unit.state;
        unit.transition(next)?;
        self.store.save_work_unit(unit)?;
        self.journal(
            JournalEntry::new(&unit.branch_name, "transition")
                .with("from", from)
                .with("to", next)
                .with("origin", origin),
        )?;
        tracing::info!(branch = %unit.branch_name, %from, to = %next, "work unit transition");
        Ok(())
    }

    /// Tears down a work unit. Idempotent.
    ///
    /// Without `force` only units with a recorded outcome can be torn down.
    /// With `force` a live unit is first marked `Abandoned` and its pending
    /// publication closed.
    pub fn teardown(&self, branch: &str, force: bool) -> Result<TeardownOutcome> {
        let origin = "lifecycle:teardown";
        let mut unit = self.status(branch)?;
        if unit.state == WorkUnitState::TornDown {
            return Ok(TeardownOutcome::AlreadyTornDown);
        }

        let _lock = self.lock(branch, origin)?;
        unit = self.status(branch)?;
        if unit.state == WorkUnitState::TornDown {
            return Ok(TeardownOutcome::AlreadyTornDown);
        }

        if unit.state.has_workspace() {
            if !force {
                return Err(ForemanError::state_transition(
                    "teardown_not_allowed",
                    format!("Work unit is {}; no outcome has been recorded", unit.state),
                    origin,
                )
                .for_work_unit(branch)
                .with_hint("Wait for the watcher to record an outcome, or pass --force"));
            }
            self.abandon(&mut unit, "forced teardown", origin)?;
        }

        self.finish_teardown(&mut unit)?;
        Ok(TeardownOutcome::TornDown)
    }

    /// Marks a live unit `Abandoned`, closing its pending publication first.
    /// The caller holds the operation lock.
    pub(crate) fn abandon(
        &self,
        unit: &mut WorkUnit,
        reason: &str,
        origin: &'static str,
    ) -> Result<()> {
        if let Some(remote_id) = unit.publication.clone() {
            if let Some(mut record) = self.store.load_publication(&remote_id)? {
                if record.is_pending() {
                    if let Err(e) = self.host.close_publication(&remote_id, reason) {
                        record.annotate_failure(format!("close_publication: {e}"));
                        self.store.save_publication(&record)?;
                        self.journal(
                            JournalEntry::new(&remote_id, "collaborator_failure")
                                .with("operation", "close_publication")
                                .with("error", &e),
                        )?;
                        return Err(ForemanError::from(e)
                            .for_work_unit(&unit.branch_name)
                            .for_publication(&remote_id));
                    }
                    record.close(MergeOutcome::Abandoned)?;
                    self.store.save_publication(&record)?;
                    self.journal(
                        JournalEntry::new(&remote_id, "closed")
                            .with("outcome", MergeOutcome::Abandoned)
                            .with("reason", reason),
                    )?;
                }
            }
        }
        unit.annotate(origin, reason);
        self.transition(unit, WorkUnitState::Abandoned, origin)
    }

    /// Deletes the workspace and branch of a unit with a recorded outcome and
    /// moves it to `TornDown`. The caller holds the operation lock.
    pub(crate) fn finish_teardown(&self, unit: &mut WorkUnit) -> Result<()> {
        let origin = "lifecycle:teardown";
        if unit.state == WorkUnitState::TornDown {
            return Ok(());
        }
        if !unit.state.is_outcome() {
            return Err(ForemanError::state_transition(
                "teardown_not_allowed",
                format!("Work unit is {}; no outcome has been recorded", unit.state),
                origin,
            )
            .for_work_unit(&unit.branch_name));
        }

        if let Err(e) = self.host.remove_workspace(&unit.workspace_path) {
            unit.annotate(origin, format!("remove_workspace failed: {e}"));
            self.store.save_work_unit(unit)?;
            self.journal(
                JournalEntry::new(&unit.branch_name, "collaborator_failure")
                    .with("operation", "remove_workspace")
                    .with("error", &e),
            )?;
            return Err(ForemanError::from(e).for_work_unit(&unit.branch_name));
        }
        if let Err(e) = self.host.delete_branch(&unit.branch_name) {
            tracing::warn!(branch = %unit.branch_name, error = %e, "branch cleanup failed");
        }

        self.transition(unit, WorkUnitState::TornDown, origin)?;
        Ok(())
    }

    /// Units whose workspace still exists but which have been idle longer
    /// than `max_age`.
    pub fn list_orphans(&self, max_age: chrono::Duration) -> Result<Vec<WorkUnit>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_work_units()?
            .into_iter()
            .filter(|u| u.state.has_workspace() && u.idle_for(now) > max_age)
            .collect())
    }

    /// Abandons and tears down an orphan.
    ///
    /// The unit is marked `Abandoned` and the abandonment journaled, with a
    /// note when the workspace held unpublished work, before anything is
    /// deleted.
    pub fn reclaim_orphan(&self, branch: &str, max_age: chrono::Duration) -> Result<Reclaimed> {
        let origin = "lifecycle:reclaim";
        let _lock = self.lock(branch, origin)?;
        let mut unit = self.status(branch)?;
        if !unit.state.has_workspace() || unit.idle_for(Utc::now()) <= max_age {
            return Err(ForemanError::state_transition(
                "not_orphaned",
                format!("Work unit '{branch}' is not an orphan"),
                origin,
            )
            .for_work_unit(branch));
        }

        let had_unpublished_work = self
            .retry
            .run("has_unpublished_work", || {
                self.host
                    .has_unpublished_work(&unit.workspace_path, &unit.branch_name)
            })
            .map_err(|(e, _)| ForemanError::from(e).for_work_unit(branch))?;

        let reason = if had_unpublished_work {
            "reclaimed orphan with unpublished work"
        } else {
            "reclaimed orphan"
        };
        self.journal(
            JournalEntry::new(branch, "orphan_reclaimed")
                .with("idle_since", unit.last_activity_at.to_rfc3339())
                .with("unpublished_work", had_unpublished_work)
                .with("workspace", unit.workspace_path.display()),
        )?;
        if had_unpublished_work {
            tracing::warn!(branch, workspace = %unit.workspace_path.display(), "reclaiming orphan with unpublished work");
        }
        self.abandon(&mut unit, reason, origin)?;
        self.finish_teardown(&mut unit)?;
        Ok(Reclaimed {
            work_unit: unit,
            had_unpublished_work,
        })
    }
}
