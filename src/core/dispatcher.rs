//! Rule dispatcher - maps an event to ordered groups of handlers.
//!
//! Handlers selected by every matching rule are unioned (first occurrence in
//! priority order wins), then layered by their `must_follow` dependencies:
//! group *i + 1* only contains handlers whose dependencies all sit in earlier
//! groups.

use crate::core::error::{ForemanError, Result};
use crate::core::event::Event;
use crate::core::handler::{Handler, HandlerRegistry, TaskHandler};
use crate::core::rules::{ConcurrencyClass, RuleSet};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Mutually independent handlers that may run together.
pub type HandlerGroup = Vec<TaskHandler>;

/// Result of matching one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchPlan {
    /// Names (or positional labels) of the rules that matched.
    pub matched_rules: Vec<String>,
    pub groups: Vec<HandlerGroup>,
}

impl DispatchPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(Vec::is_empty)
    }

    /// Handler ids per group, for display and comparison.
    #[must_use]
    pub fn group_ids(&self) -> Vec<Vec<String>> {
        self.groups
            .iter()
            .map(|g| g.iter().map(|h| h.id.clone()).collect())
            .collect()
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

/// Dispatcher over a read-only, swappable rule snapshot.
pub struct Dispatcher {
    rules: Mutex<Arc<RuleSet>>,
    handlers: HandlerRegistry,
}

impl Dispatcher {
    /// Creates a dispatcher; every referenced handler must be registered.
    pub fn new(rules: RuleSet, handlers: HandlerRegistry) -> Result<Self> {
        rules.check_known_handlers(&handlers.ids())?;
        Ok(Self {
            rules: Mutex::new(Arc::new(rules)),
            handlers,
        })
    }

    /// Current rule snapshot. A round holds on to the snapshot it started with.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuleSet> {
        match self.rules.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Installs a new rule set for subsequent rounds.
    pub fn reload(&self, rules: RuleSet) -> Result<()> {
        rules.check_known_handlers(&self.handlers.ids())?;
        let mut guard = match self.rules.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(rules);
        tracing::info!(rules = guard.rules().len(), "rule set reloaded");
        Ok(())
    }

    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Matches an event against the current snapshot.
    pub fn match_event(&self, event: &Event) -> Result<DispatchPlan> {
        let rules = self.snapshot();
        plan(&rules, &self.handlers, event)
    }
}

/// Pure planning function: same rules + same event give the same plan.
pub fn plan(rules: &RuleSet, handlers: &HandlerRegistry, event: &Event) -> Result<DispatchPlan> {
    let origin = "dispatcher:match";
    let mut matched_rules = Vec::new();
    let mut selected: Vec<&str> = Vec::new();
    let mut deps: HashMap<&str, BTreeSet<&str>> = HashMap::new();

    for (label, rule) in rules.by_priority() {
        if !rule.predicate.matches(event) {
            continue;
        }
        matched_rules.push(label);

        for handler in &rule.handlers {
            if !selected.contains(&handler.as_str()) {
                selected.push(handler.as_str());
            }
            if let ConcurrencyClass::MustFollow(dep) = &rule.concurrency {
                deps.entry(handler.as_str()).or_default().insert(dep.as_str());
            }
        }
    }

    if selected.is_empty() {
        tracing::info!(kind = %event.kind(), "event matched no rules; nothing to dispatch");
        return Ok(DispatchPlan::default());
    }

    // A must_follow target outside this round imposes no ordering.
    for (handler, targets) in &mut deps {
        targets.retain(|t| {
            let present = selected.contains(t);
            if !present {
                tracing::debug!(handler = *handler, follows = *t, "must_follow target not selected; ignoring");
            }
            present
        });
    }

    let mut levels: HashMap<&str, usize> = HashMap::new();
    for handler in &selected {
        level_of(handler, &deps, &mut levels, &mut Vec::new())?;
    }

    let depth = levels.values().copied().max().unwrap_or(0);
    let mut groups: Vec<HandlerGroup> = vec![Vec::new(); depth + 1];
    for handler in &selected {
        let descriptor = handlers.get(handler).ok_or_else(|| {
            ForemanError::configuration(
                "unknown_handler",
                format!("Rule references unknown handler '{handler}'"),
                origin,
            )
            .with_context("handler", *handler)
        })?;
        groups[levels[handler]].push(descriptor.descriptor().clone());
    }

    let plan = DispatchPlan {
        matched_rules,
        groups,
    };
    tracing::debug!(
        kind = %event.kind(),
        rules = ?plan.matched_rules,
        groups = ?plan.group_ids(),
        "event dispatched"
    );
    Ok(plan)
}

fn level_of<'a>(
    handler: &'a str,
    deps: &HashMap<&'a str, BTreeSet<&'a str>>,
    levels: &mut HashMap<&'a str, usize>,
    path: &mut Vec<&'a str>,
) -> Result<usize> {
    if let Some(level) = levels.get(handler) {
        return Ok(*level);
    }
    if path.contains(&handler) {
        return Err(ForemanError::configuration(
            "dependency_cycle",
            format!("must_follow relationships form a cycle through '{handler}'"),
            "dispatcher:match",
        )
        .with_context("handler", handler));
    }
    path.push(handler);
    let mut level = 0;
    if let Some(targets) = deps.get(handler) {
        for target in targets {
            level = level.max(level_of(target, deps, levels, path)? + 1);
        }
    }
    path.pop();
    levels.insert(handler, level);
    Ok(level)
}
