//! Declarative dispatch rules.
//!
//! A rule maps an event pattern to an ordered set of handlers plus their
//! concurrency relationship. Predicates are data evaluated by a fixed
//! interpreter ([`Predicate::matches`]); nothing in a rule set is executable.

use crate::core::error::{ForemanError, Result};
use crate::core::event::{Event, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Pattern over event kind and payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every event.
    Always,
    /// Matches events of one kind.
    Kind(EventKind),
    /// Payload value equals exactly.
    PayloadEquals { key: String, value: String },
    /// Payload value matches a path glob (`*`, `**`, `prefix/*`, `*/suffix`).
    PayloadGlob { key: String, pattern: String },
    /// Payload key is present.
    PayloadPresent { key: String },
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Evaluates the predicate against an event.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Always => true,
            Self::Kind(kind) => event.kind() == *kind,
            Self::PayloadEquals { key, value } => event.get(key) == Some(value.as_str()),
            Self::PayloadGlob { key, pattern } => {
                event.get(key).is_some_and(|v| glob_match(pattern, v))
            }
            Self::PayloadPresent { key } => event.get(key).is_some(),
            Self::All(preds) => preds.iter().all(|p| p.matches(event)),
            Self::Any(preds) => preds.iter().any(|p| p.matches(event)),
            Self::Not(pred) => !pred.matches(event),
        }
    }
}

/// Path glob matching over `/`-separated values.
///
/// `**` spans any number of segments, `*` stays within one segment.
fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let value: Vec<&str> = value.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern, &value)
}

fn match_segments(pattern: &[&str], value: &[&str]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some((&"**", rest)) => (0..=value.len()).any(|skip| match_segments(rest, &value[skip..])),
        Some((seg, rest)) => value
            .split_first()
            .is_some_and(|(v, vrest)| segment_match(seg, v) && match_segments(rest, vrest)),
    }
}

fn segment_match(pattern: &str, value: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == value,
        Some((prefix, rest)) => value.strip_prefix(prefix).is_some_and(|tail| {
            (0..=tail.len())
                .filter(|i| tail.is_char_boundary(*i))
                .any(|i| segment_match(rest, &tail[i..]))
        }),
    }
}

/// How a rule's handlers relate to the rest of the round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyClass {
    /// May run alongside any other selected handler.
    #[default]
    Independent,
    /// Must start only after the named handler has reported.
    MustFollow(String),
}

/// A declarative dispatch rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub predicate: Predicate,
    pub handlers: Vec<String>,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub concurrency: ConcurrencyClass,
    #[serde(default)]
    pub priority: i32,
}

impl Rule {
    #[must_use]
    pub fn new(predicate: Predicate, handlers: &[&str]) -> Self {
        Self {
            name: None,
            predicate,
            handlers: handlers.iter().map(|h| (*h).to_string()).collect(),
            concurrency: ConcurrencyClass::Independent,
            priority: 0,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn must_follow(mut self, handler: impl Into<String>) -> Self {
        self.concurrency = ConcurrencyClass::MustFollow(handler.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("rule-{index}"))
    }
}

/// Validated, read-only rule configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Validates and wraps a list of rules in declaration order.
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let set = Self { rules };
        set.validate()?;
        Ok(set)
    }

    /// Loads rules from a YAML (or JSON) list.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ForemanError::configuration("rules_read_failed", e.to_string(), "rules:load")
                .with_context("path", path.display().to_string())
        })?;
        Self::parse(&raw).map_err(|e| e.with_context("path", path.display().to_string()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let rules: Vec<Rule> = serde_yaml::from_str(raw).map_err(|e| {
            ForemanError::configuration("rules_parse_failed", e.to_string(), "rules:parse")
                .with_hint("Rules are a YAML list of {predicate, handlers, concurrency, priority}")
        })?;
        Self::new(rules)
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules with their display label, by descending priority; equal
    /// priorities keep declaration order.
    #[must_use]
    pub fn by_priority(&self) -> Vec<(String, &Rule)> {
        let mut ordered: Vec<(String, &Rule)> = self
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| (rule.label(index), rule))
            .collect();
        ordered.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));
        ordered
    }

    /// Every handler id referenced by any rule.
    #[must_use]
    pub fn referenced_handlers(&self) -> BTreeSet<&str> {
        let mut ids = BTreeSet::new();
        for rule in &self.rules {
            ids.extend(rule.handlers.iter().map(String::as_str));
            if let ConcurrencyClass::MustFollow(dep) = &rule.concurrency {
                ids.insert(dep.as_str());
            }
        }
        ids
    }

    /// Fails if a rule references a handler that is not registered.
    pub fn check_known_handlers(&self, known: &HashSet<String>) -> Result<()> {
        for id in self.referenced_handlers() {
            if !known.contains(id) {
                return Err(ForemanError::configuration(
                    "unknown_handler",
                    format!("Rule references unknown handler '{id}'"),
                    "rules:validate",
                )
                .with_context("handler", id)
                .with_hint("Declare the handler under `handlers:` in config.yaml"));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let origin = "rules:validate";
        for (index, rule) in self.rules.iter().enumerate() {
            let label = rule.label(index);
            if rule.handlers.is_empty() {
                return Err(ForemanError::configuration(
                    "rule_without_handlers",
                    format!("Rule '{label}' selects no handlers"),
                    origin,
                )
                .with_context("rule", label));
            }
            let mut seen = HashSet::new();
            for handler in &rule.handlers {
                if handler.trim().is_empty() {
                    return Err(ForemanError::configuration(
                        "empty_handler_id",
                        format!("Rule '{label}' contains an empty handler id"),
                        origin,
                    )
                    .with_context("rule", label));
                }
                if !seen.insert(handler.as_str()) {
                    return Err(ForemanError::configuration(
                        "duplicate_handler",
                        format!("Rule '{label}' lists handler '{handler}' twice"),
                        origin,
                    )
                    .with_context("rule", label));
                }
            }
            if let ConcurrencyClass::MustFollow(dep) = &rule.concurrency {
                if rule.handlers.contains(dep) {
                    return Err(ForemanError::configuration(
                        "self_dependency",
                        format!("Rule '{label}' makes '{dep}' follow itself"),
                        origin,
                    )
                    .with_context("rule", label));
                }
            }
        }

        if let Some(handler) = self.find_cycle() {
            return Err(ForemanError::configuration(
                "dependency_cycle",
                format!("must_follow relationships form a cycle through '{handler}'"),
                origin,
            )
            .with_context("handler", handler));
        }
        Ok(())
    }

    /// Dependency edges `handler -> handlers it must follow`.
    #[must_use]
    pub fn dependency_edges(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for rule in &self.rules {
            if let ConcurrencyClass::MustFollow(dep) = &rule.concurrency {
                for handler in &rule.handlers {
                    edges.entry(handler.as_str()).or_default().insert(dep.as_str());
                }
            }
        }
        edges
    }

    fn find_cycle(&self) -> Option<String> {
        let edges = self.dependency_edges();
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();

        fn visit<'a>(
            node: &'a str,
            edges: &BTreeMap<&'a str, BTreeSet<&'a str>>,
            visited: &mut HashSet<&'a str>,
            stack: &mut HashSet<&'a str>,
        ) -> Option<&'a str> {
            if stack.contains(node) {
                return Some(node);
            }
            if !visited.insert(node) {
                return None;
            }
            stack.insert(node);
            if let Some(deps) = edges.get(node) {
                for dep in deps {
                    if let Some(found) = visit(dep, edges, visited, stack) {
                        return Some(found);
                    }
                }
            }
            stack.remove(node);
            None
        }

        edges
            .keys()
            .find_map(|node| visit(node, &edges, &mut visited, &mut stack))
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_changed(path: &str) -> Event {
        Event::with_pairs(EventKind::FileChanged, [("path", path)])
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("core/**", "core/x"));
        assert!(glob_match("core/**", "core/a/b.rs"));
        assert!(glob_match("**/*.rs", "src/core/lib.rs"));
        assert!(glob_match("src/*", "src/main.rs"));
        assert!(!glob_match("src/*", "src/core/lib.rs"));
        assert!(glob_match("*.md", "README.md"));
        assert!(!glob_match("docs/**", "core/x"));
        assert!(glob_match("**", "anything/at/all"));
    }

    #[test]
    fn predicate_interpreter() {
        let event = file_changed("core/x");
        assert!(Predicate::Always.matches(&event));
        assert!(Predicate::Kind(EventKind::FileChanged).matches(&event));
        assert!(!Predicate::Kind(EventKind::UserRequest).matches(&event));
        assert!(Predicate::PayloadPresent { key: "path".into() }.matches(&event));

        let combined = Predicate::All(vec![
            Predicate::Kind(EventKind::FileChanged),
            Predicate::PayloadGlob {
                key: "path".into(),
                pattern: "core/**".into(),
            },
            Predicate::Not(Box::new(Predicate::PayloadEquals {
                key: "path".into(),
                value: "core/generated".into(),
            })),
        ]);
        assert!(combined.matches(&event));
        assert!(!combined.matches(&file_changed("core/generated")));
        assert!(!Predicate::Any(vec![]).matches(&event));
    }

    #[test]
    fn parses_yaml_rule_list() {
        let raw = r#"
- name: R1
  predicate:
    kind: file_changed
  handlers: [lint, typecheck]
- name: R2
  predicate:
    payload_glob: { key: path, pattern: "core/**" }
  handlers: [security_review]
  concurrency:
    must_follow: typecheck
  priority: 5
"#;
        let set = RuleSet::parse(raw).unwrap();
        assert_eq!(set.rules().len(), 2);
        assert_eq!(
            set.rules()[1].concurrency,
            ConcurrencyClass::MustFollow("typecheck".into())
        );
        assert_eq!(set.by_priority()[0].0, "R2");
    }

    #[test]
    fn priority_ties_keep_declaration_order() {
        let set = RuleSet::new(vec![
            Rule::new(Predicate::Always, &["a"]).named("first"),
            Rule::new(Predicate::Always, &["b"]).named("second").with_priority(1),
            Rule::new(Predicate::Always, &["c"]).named("third"),
        ])
        .unwrap();
        let names: Vec<_> = set.by_priority().into_iter().map(|(label, _)| label).collect();
        assert_eq!(names, ["second", "first", "third"]);
    }

    #[test]
    fn rejects_malformed_rules() {
        let empty = RuleSet::new(vec![Rule::new(Predicate::Always, &[])]);
        assert_eq!(empty.unwrap_err().code, "rule_without_handlers");

        let dup = RuleSet::new(vec![Rule::new(Predicate::Always, &["a", "a"])]);
        assert_eq!(dup.unwrap_err().code, "duplicate_handler");

        let selfdep = RuleSet::new(vec![Rule::new(Predicate::Always, &["a"]).must_follow("a")]);
        assert_eq!(selfdep.unwrap_err().code, "self_dependency");

        let bad_yaml = RuleSet::parse("- predicate: {kind: nope}\n  handlers: [a]\n");
        assert_eq!(bad_yaml.unwrap_err().kind, crate::core::error::ErrorKind::Configuration);
    }

    #[test]
    fn rejects_cycles_across_rules() {
        let result = RuleSet::new(vec![
            Rule::new(Predicate::Always, &["a"]).must_follow("b"),
            Rule::new(Predicate::Always, &["b"]).must_follow("a"),
        ]);
        assert_eq!(result.unwrap_err().code, "dependency_cycle");
    }

    #[test]
    fn unknown_handlers_are_configuration_errors() {
        let set = RuleSet::new(vec![Rule::new(Predicate::Always, &["lint"]).must_follow("fmt")]).unwrap();
        let known: HashSet<String> = ["lint".to_string()].into_iter().collect();
        let err = set.check_known_handlers(&known).unwrap_err();
        assert_eq!(err.code, "unknown_handler");
        assert_eq!(err.context.get("handler").map(String::as_str), Some("fmt"));
    }
}
