//! Configuration: data directory resolution and `config.yaml`.

use crate::core::error::{ForemanError, Result};
use crate::core::handler::CommandHandlerConfig;
use crate::core::retry::RetryPolicy;
use crate::core::runner::RunnerConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FOREMAN_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub default_timeout_ms: u64,
    pub max_parallel: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 600_000,
            max_parallel: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    pub poll_interval_secs: u64,
    /// Pending publications without an outcome for this long are abandoned.
    pub staleness_window_secs: u64,
    /// Reviewer roles that must all approve before an automatic merge.
    pub required_roles: Vec<String>,
    pub max_parallel_publications: usize,
    pub delete_branch_on_merge: bool,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            staleness_window_secs: 86_400,
            required_roles: Vec::new(),
            max_parallel_publications: 3,
            delete_branch_on_merge: true,
        }
    }
}

impl WatcherSettings {
    #[must_use]
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.staleness_window_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    #[default]
    Github,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub kind: HostKind,
    pub git_bin: String,
    pub gh_bin: String,
    pub remote: String,
    pub repo: Option<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            kind: HostKind::Github,
            git_bin: "git".to_string(),
            gh_bin: "gh".to_string(),
            remote: "origin".to_string(),
            repo: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    /// Where state, locks and the journal live. Not read from the file.
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub repo_path: PathBuf,
    pub base_ref: String,
    pub workspace_root: Option<PathBuf>,
    pub runner: RunnerSettings,
    pub watcher: WatcherSettings,
    pub retry: RetryPolicy,
    pub host: HostSettings,
    pub handlers: Vec<CommandHandlerConfig>,
    pub rules_path: Option<PathBuf>,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            repo_path: PathBuf::from("."),
            base_ref: "main".to_string(),
            workspace_root: None,
            runner: RunnerSettings::default(),
            watcher: WatcherSettings::default(),
            retry: RetryPolicy::default(),
            host: HostSettings::default(),
            handlers: Vec::new(),
            rules_path: None,
        }
    }
}

/// `FOREMAN_DATA_DIR`, else `~/.foreman`.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    if let Ok(data_dir) = env::var(DATA_DIR_ENV) {
        return PathBuf::from(data_dir);
    }
    dirs::home_dir().map_or_else(|| PathBuf::from(".foreman"), |h| h.join(".foreman"))
}

impl ForemanConfig {
    /// Loads configuration.
    ///
    /// An explicit path must exist. Without one, `<data_dir>/config.yaml` is
    /// read if present and defaults are used otherwise.
    pub fn load(data_dir: PathBuf, explicit: Option<&Path>) -> Result<Self> {
        let origin = "config:load";
        let path = explicit.map_or_else(|| data_dir.join("config.yaml"), Path::to_path_buf);

        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => Self::parse(&raw).map_err(|e| e.with_context("path", path.display().to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => Self::default(),
            Err(e) => {
                return Err(ForemanError::configuration("config_unreadable", e.to_string(), origin)
                    .with_context("path", path.display().to_string()))
            }
        };
        config.data_dir = data_dir;
        config.validate()?;
        Ok(config)
    }

    /// Parses YAML without touching the filesystem.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| {
            ForemanError::configuration("config_invalid", e.to_string(), "config:parse")
                .with_hint("Check config.yaml against the documented sections")
        })
    }

    pub fn validate(&self) -> Result<()> {
        let origin = "config:validate";
        if self.runner.max_parallel == 0 {
            return Err(ForemanError::configuration(
                "invalid_max_parallel",
                "runner.max_parallel must be at least 1",
                origin,
            ));
        }
        if self.watcher.max_parallel_publications == 0 {
            return Err(ForemanError::configuration(
                "invalid_max_parallel",
                "watcher.max_parallel_publications must be at least 1",
                origin,
            ));
        }
        if self.base_ref.trim().is_empty() {
            return Err(ForemanError::configuration(
                "empty_base_ref",
                "base_ref cannot be empty",
                origin,
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| self.repo_path.join(".foreman").join("workspaces"))
    }

    /// Editable rule source.
    #[must_use]
    pub fn rules_path(&self) -> PathBuf {
        self.rules_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("rules.yaml"))
    }

    /// Snapshot installed by `rules reload`; preferred over the source file.
    #[must_use]
    pub fn active_rules_path(&self) -> PathBuf {
        self.data_dir.join("rules.active.yaml")
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.jsonl")
    }

    #[must_use]
    pub fn local_host_path(&self) -> PathBuf {
        self.data_dir.join("local_host.json")
    }

    #[must_use]
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            default_timeout: Duration::from_millis(self.runner.default_timeout_ms),
            max_parallel: self.runner.max_parallel,
            ..RunnerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ForemanConfig::parse("").unwrap();
        assert_eq!(config.base_ref, "main");
        assert_eq!(config.watcher.poll_interval_secs, 30);
        assert_eq!(config.watcher.max_parallel_publications, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.host.kind, HostKind::Github);
    }

    #[test]
    fn parses_sections_and_handlers() {
        let raw = r"
repo_path: /srv/repo
base_ref: develop
runner:
  max_parallel: 2
watcher:
  required_roles: [security, docs]
  staleness_window_secs: 3600
host:
  kind: local
handlers:
  - id: lint
    command: cargo clippy
    blocking: true
    timeout_ms: 120000
  - id: docs
    command: ./check-docs.sh
    warn_exit_codes: [3]
";
        let config = ForemanConfig::parse(raw).unwrap();
        assert_eq!(config.base_ref, "develop");
        assert_eq!(config.runner.max_parallel, 2);
        assert_eq!(config.runner.default_timeout_ms, 600_000);
        assert_eq!(config.watcher.required_roles, ["security", "docs"]);
        assert_eq!(config.watcher.staleness_window(), chrono::Duration::hours(1));
        assert_eq!(config.host.kind, HostKind::Local);
        assert_eq!(config.handlers.len(), 2);
        assert!(config.handlers[0].descriptor.blocking);
        assert_eq!(config.handlers[0].descriptor.timeout_ms, Some(120_000));
        assert_eq!(config.handlers[1].warn_exit_codes, [3]);
        assert_eq!(
            config.workspace_root(),
            PathBuf::from("/srv/repo/.foreman/workspaces")
        );
    }

    #[test]
    fn load_missing_default_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ForemanConfig::load(dir.path().to_path_buf(), None).unwrap();
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.rules_path(), dir.path().join("rules.yaml"));
    }

    #[test]
    fn load_rejects_missing_explicit_file_and_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let err = ForemanConfig::load(dir.path().to_path_buf(), Some(&missing)).unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Configuration);

        std::fs::write(dir.path().join("config.yaml"), "runner:\n  max_parallel: 0\n").unwrap();
        let err = ForemanConfig::load(dir.path().to_path_buf(), None).unwrap_err();
        assert_eq!(err.code, "invalid_max_parallel");

        std::fs::write(dir.path().join("config.yaml"), "runner: [oops").unwrap();
        let err = ForemanConfig::load(dir.path().to_path_buf(), None).unwrap_err();
        assert_eq!(err.code, "config_invalid");
    }
}
