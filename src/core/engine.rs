//! Wires configuration, storage, the host and the components together.
//!
//! The CLI talks to an [`Engine`]; nothing below it reads global state.

use crate::adapters::github::{GitHubHost, GitHubSettings};
use crate::adapters::host::SharedHost;
use crate::adapters::local::LocalHost;
use crate::core::aggregator::{summarize, ResultSummary, Verdict};
use crate::core::config::{ForemanConfig, HostKind};
use crate::core::dispatcher::Dispatcher;
use crate::core::error::{ForemanError, Result};
use crate::core::event::{Event, EventKind};
use crate::core::handler::{HandlerContext, HandlerRegistry};
use crate::core::lifecycle::LifecycleManager;
use crate::core::lock::LockDir;
use crate::core::rules::RuleSet;
use crate::core::runner::{CancelToken, TaskRunner};
use crate::core::verification::TaskResult;
use crate::core::watcher::Watcher;
use crate::core::workunit::WorkUnitState;
use crate::storage::journal::{FileJournal, JournalEntry, JournalFilter, SharedJournal};
use crate::storage::state_store::{FileStateStore, SharedStateStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of one dispatch round.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub work_unit: String,
    pub event_kind: EventKind,
    pub matched_rules: Vec<String>,
    pub groups: Vec<Vec<String>>,
    pub results: Vec<TaskResult>,
    pub summary: ResultSummary,
    pub verdict: Verdict,
    pub cancelled: bool,
}

/// Where the active rule set came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RulesInfo {
    pub source: Option<PathBuf>,
    pub rules: RuleSet,
}

pub struct Engine {
    config: ForemanConfig,
    journal: SharedJournal,
    host: SharedHost,
    dispatcher: Dispatcher,
    runner: TaskRunner,
    lifecycle: Arc<LifecycleManager>,
    watcher: Watcher,
    rules_source: Option<PathBuf>,
}

fn build_host(config: &ForemanConfig) -> Result<SharedHost> {
    let workspace_root = config.workspace_root();
    let host: SharedHost = match config.host.kind {
        HostKind::Github => Arc::new(GitHubHost::new(
            config.repo_path.clone(),
            workspace_root,
            GitHubSettings {
                git_bin: config.host.git_bin.clone(),
                gh_bin: config.host.gh_bin.clone(),
                remote: config.host.remote.clone(),
                repo: config.host.repo.clone(),
            },
        )?),
        HostKind::Local => Arc::new(LocalHost::open(workspace_root, config.local_host_path())?),
    };
    tracing::debug!(host = host.name(), "host ready");
    Ok(host)
}

/// Active snapshot if installed, else the editable source, else nothing.
fn load_rules(config: &ForemanConfig) -> Result<(RuleSet, Option<PathBuf>)> {
    for path in [config.active_rules_path(), config.rules_path()] {
        if path.exists() {
            return Ok((RuleSet::load(&path)?, Some(path)));
        }
    }
    tracing::info!("no rule file found; every event matches nothing");
    Ok((RuleSet::default(), None))
}

impl Engine {
    /// Opens persistent state and the configured host.
    pub fn open(config: ForemanConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            ForemanError::system("create_dir_failed", e.to_string(), "engine:open")
                .with_context("path", config.data_dir.display().to_string())
        })?;
        let host = build_host(&config)?;
        let store: SharedStateStore = Arc::new(FileStateStore::open(config.state_dir())?);
        let journal: SharedJournal = Arc::new(FileJournal::open(config.journal_path())?);
        let handlers = HandlerRegistry::from_configs(&config.handlers)?;
        let (rules, source) = load_rules(&config)?;
        let mut engine = Self::from_parts(config, store, journal, host, handlers, rules)?;
        engine.rules_source = source;
        Ok(engine)
    }

    /// Assembles an engine from explicit parts.
    pub fn from_parts(
        config: ForemanConfig,
        store: SharedStateStore,
        journal: SharedJournal,
        host: SharedHost,
        handlers: HandlerRegistry,
        rules: RuleSet,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::new(rules, handlers.clone())?;
        let runner = TaskRunner::new(handlers, config.runner_config());
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&store),
            Arc::clone(&journal),
            Arc::clone(&host),
            LockDir::new(&config.data_dir),
            config.retry,
        ));
        let watcher = Watcher::new(
            store,
            Arc::clone(&journal),
            Arc::clone(&host),
            Arc::clone(&lifecycle),
            config.watcher.clone(),
            config.retry,
        );
        Ok(Self {
            config,
            journal,
            host,
            dispatcher,
            runner,
            lifecycle,
            watcher,
            rules_source: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    #[must_use]
    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    #[must_use]
    pub fn host_name(&self) -> &'static str {
        self.host.name()
    }

    /// Runs the handlers an event selects against a work unit.
    ///
    /// The work unit comes from `work_unit` or the event's `work_unit`
    /// payload key, and must be `InProgress`. The round holds the unit's
    /// operation lock, so it never overlaps a publish or another round.
    pub fn dispatch(
        &self,
        event: &Event,
        work_unit: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<DispatchReport> {
        let origin = "engine:dispatch";
        let branch = work_unit
            .or_else(|| event.work_unit())
            .ok_or_else(|| {
                ForemanError::user(
                    "missing_work_unit",
                    "No work unit given and the event payload has no work_unit key",
                    origin,
                )
                .with_hint("Pass --work-unit <name>")
            })?
            .to_string();

        let _lock = self.lifecycle.lock(&branch, origin)?;
        let mut unit = self.lifecycle.status(&branch)?;
        if unit.state != WorkUnitState::InProgress {
            return Err(ForemanError::state_transition(
                "not_in_progress",
                format!("Cannot dispatch against '{branch}' while it is {}", unit.state),
                origin,
            )
            .for_work_unit(&branch));
        }

        let plan = self.dispatcher.match_event(event)?;
        if plan.is_empty() {
            tracing::info!(branch = %branch, kind = %event.kind(), "event matched no handlers");
        } else {
            tracing::debug!(branch = %branch, rules = ?plan.matched_rules, groups = ?plan.group_ids(), "dispatch plan");
        }

        let context = HandlerContext::new(
            branch.clone(),
            unit.workspace_path.clone(),
            event.payload().clone(),
        );
        let round = self.runner.run(&plan.groups, &context, cancel)?;
        let verdict = round.verdict();
        let summary = summarize(&round.results);

        unit.last_verdict = Some(verdict);
        unit.touch();
        self.lifecycle.save(&unit)?;
        self.journal.append(
            JournalEntry::new(&branch, "dispatched")
                .with("event", event.kind())
                .with("verdict", verdict)
                .with("handlers", plan.handler_count())
                .with("failures", summary.failure)
                .with("cancelled", round.cancelled),
        )?;
        tracing::info!(branch = %branch, %verdict, handlers = plan.handler_count(), "dispatch round finished");

        Ok(DispatchReport {
            work_unit: branch,
            event_kind: event.kind(),
            matched_rules: plan.matched_rules.clone(),
            groups: plan.group_ids(),
            results: round.results,
            summary,
            verdict,
            cancelled: round.cancelled,
        })
    }

    /// Validates a rule file against the registered handlers.
    pub fn check_rules(&self, path: &Path) -> Result<RuleSet> {
        let rules = RuleSet::load(path)?;
        rules.check_known_handlers(&self.dispatcher.handlers().ids())?;
        Ok(rules)
    }

    /// Validates the rule source and installs it as the active snapshot.
    ///
    /// Rounds already running keep the snapshot they started with.
    pub fn reload_rules(&mut self) -> Result<RulesInfo> {
        let origin = "engine:reload_rules";
        let source = self.config.rules_path();
        let raw = std::fs::read_to_string(&source).map_err(|e| {
            ForemanError::configuration("rules_read_failed", e.to_string(), origin)
                .with_context("path", source.display().to_string())
        })?;
        let rules = RuleSet::parse(&raw)
            .map_err(|e| e.with_context("path", source.display().to_string()))?;
        self.dispatcher.reload(rules.clone())?;

        let active = self.config.active_rules_path();
        let tmp = active.with_extension("yaml.tmp");
        std::fs::write(&tmp, &raw)
            .and_then(|()| std::fs::rename(&tmp, &active))
            .map_err(|e| {
                ForemanError::system("rules_install_failed", e.to_string(), origin)
                    .with_context("path", active.display().to_string())
            })?;
        self.journal.append(
            JournalEntry::new("rules", "reloaded")
                .with("source", source.display())
                .with("rules", rules.rules().len()),
        )?;
        self.rules_source = Some(active);
        Ok(self.rules())
    }

    #[must_use]
    pub fn rules(&self) -> RulesInfo {
        RulesInfo {
            source: self.rules_source.clone(),
            rules: (*self.dispatcher.snapshot()).clone(),
        }
    }

    pub fn journal_entries(&self, filter: &JournalFilter) -> Result<Vec<JournalEntry>> {
        Ok(self.journal.read(filter)?)
    }
}
