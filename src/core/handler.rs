//! Task handler descriptors and the invocation contract.
//!
//! The runner only knows a handler's descriptor and that it can be invoked
//! with a read-only context. What a handler checks is its own business;
//! [`CommandHandler`] is the bundled body that shells out to a command.
//!
//! A command runs in its own process group. Past the deadline in its
//! context the whole group is killed and reaped before `invoke` returns, so
//! nothing it started keeps writing to the workspace.

use crate::core::error::{ForemanError, Result};
use crate::core::verification::{Finding, Severity, TaskResult};
use command_group::{CommandGroup, GroupChild};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

const fn default_cost() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

/// Capability descriptor of a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandler {
    pub id: String,
    /// Relative cost; costlier handlers start first within a group.
    #[serde(default = "default_cost")]
    pub estimated_cost: u32,
    #[serde(default = "default_true")]
    pub idempotent: bool,
    /// Overrides the runner's default timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Failures (and timeouts) of this handler block publication.
    #[serde(default)]
    pub blocking: bool,
}

impl TaskHandler {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            estimated_cost: 1,
            idempotent: true,
            timeout_ms: None,
            blocking: false,
        }
    }

    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    #[must_use]
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.estimated_cost = cost;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Read-only snapshot handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerContext {
    pub work_unit: String,
    pub workspace_path: PathBuf,
    pub payload: BTreeMap<String, String>,
    /// Set by the runner; work still running at this instant must stop.
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl HandlerContext {
    #[must_use]
    pub fn new(
        work_unit: impl Into<String>,
        workspace_path: PathBuf,
        payload: BTreeMap<String, String>,
    ) -> Self {
        Self {
            work_unit: work_unit.into(),
            workspace_path,
            payload,
            deadline: None,
        }
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// The uniform invocation contract.
///
/// Implementations report every outcome, including their own errors, as a
/// [`TaskResult`]; nothing is thrown past the runner.
pub trait Handler: Send + Sync {
    fn descriptor(&self) -> &TaskHandler;

    fn invoke(&self, work_unit: &str, context: &HandlerContext) -> TaskResult;
}

/// Handler body declared in `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHandlerConfig {
    #[serde(flatten)]
    pub descriptor: TaskHandler,
    pub command: String,
    /// Exit codes reported as `Warning` instead of `Failure`.
    #[serde(default)]
    pub warn_exit_codes: Vec<i32>,
}

/// Runs a shell command inside the workspace.
///
/// Exit 0 is success, a listed warn code is a warning, anything else is a
/// failure. Stdout lines that parse as a JSON [`Finding`] are collected.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    config: CommandHandlerConfig,
}

impl CommandHandler {
    #[must_use]
    pub fn new(config: CommandHandlerConfig) -> Self {
        Self { config }
    }

    fn failure_severity(&self) -> Severity {
        if self.config.descriptor.blocking {
            Severity::Blocking
        } else {
            Severity::Error
        }
    }

    fn parse_findings(stdout: &str) -> Vec<Finding> {
        stdout
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with('{'))
            .filter_map(|l| serde_json::from_str::<Finding>(l).ok())
            .collect()
    }

    fn tail(output: &str, lines: usize) -> String {
        let all: Vec<&str> = output.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    fn command(&self, work_unit: &str, context: &HandlerContext) -> Command {
        let mut cmd = Command::new("sh");
        cmd.current_dir(&context.workspace_path)
            .args(["-c", &self.config.command])
            .env("FOREMAN_BRANCH", work_unit)
            .env("FOREMAN_WORKSPACE", &context.workspace_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &context.payload {
            let key: String = key
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            cmd.env(format!("FOREMAN_PAYLOAD_{key}"), value);
        }
        cmd
    }

    /// Waits for the shell, killing its group once `context` expires.
    /// Returns `None` on timeout.
    fn wait(child: &mut GroupChild, context: &HandlerContext) -> std::io::Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = child.inner().try_wait()? {
                // background jobs may not outlive the handler
                let _ = child.kill();
                return Ok(Some(status));
            }
            if context.expired() {
                child.kill()?;
                child.wait()?;
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn error(&self, duration_ms: u64, message: String) -> TaskResult {
        TaskResult::failure(
            self.config.descriptor.id.clone(),
            duration_ms,
            vec![Finding::new(self.failure_severity(), message)],
        )
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

impl Handler for CommandHandler {
    fn descriptor(&self) -> &TaskHandler {
        &self.config.descriptor
    }

    fn invoke(&self, work_unit: &str, context: &HandlerContext) -> TaskResult {
        let id = &self.config.descriptor.id;
        let started = Instant::now();

        let mut child = match self.command(work_unit, context).group_spawn() {
            Ok(child) => child,
            Err(e) => {
                return self.error(
                    elapsed_ms(started),
                    format!("failed to spawn handler command: {e}"),
                );
            }
        };
        let stdout = drain(child.inner().stdout.take());
        let stderr = drain(child.inner().stderr.take());

        let status = match Self::wait(&mut child, context) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let duration_ms = elapsed_ms(started);
                let err = ForemanError::handler_timeout(
                    "handler_timed_out",
                    format!("Handler '{id}' was killed after {duration_ms}ms"),
                    "handler:command",
                )
                .for_work_unit(work_unit);
                tracing::warn!(handler = %id, error = %err, "handler process group killed");
                return TaskResult::timed_out(id.clone(), duration_ms, self.config.descriptor.blocking);
            }
            Err(e) => {
                let _ = child.kill();
                return self.error(
                    elapsed_ms(started),
                    format!("failed to wait for handler command: {e}"),
                );
            }
        };
        let duration_ms = elapsed_ms(started);
        let stdout = collect(stdout);
        let stderr = collect(stderr);
        let exit_code = status.code().unwrap_or(-1);

        let mut findings = Self::parse_findings(&stdout);

        if exit_code == 0 {
            let mut result = TaskResult::success(id.clone(), duration_ms);
            result.findings = findings;
            return result;
        }

        if self.config.warn_exit_codes.contains(&exit_code) {
            if findings.is_empty() {
                findings.push(Finding::new(
                    Severity::Warning,
                    format!("exit code {exit_code}: {}", Self::tail(&stdout, 20)),
                ));
            }
            return TaskResult::warning(id.clone(), duration_ms, findings);
        }

        let severity = self.failure_severity();
        if findings.is_empty() {
            let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
            findings.push(Finding::new(
                severity,
                format!("exit code {exit_code}: {}", Self::tail(detail, 20)),
            ));
        }
        let result = TaskResult::failure(id.clone(), duration_ms, findings);
        if severity == Severity::Blocking && !result.is_blocking_failure() {
            return result.with_finding(Finding::new(
                Severity::Blocking,
                format!("blocking handler exited with {exit_code}"),
            ));
        }
        result
    }
}

/// Registered handlers keyed by id.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds command handlers from configuration.
    pub fn from_configs(configs: &[CommandHandlerConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(Arc::new(CommandHandler::new(config.clone())))?;
        }
        Ok(registry)
    }

    /// Registers a handler; ids must be unique.
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<()> {
        let id = handler.descriptor().id.clone();
        if id.trim().is_empty() {
            return Err(ForemanError::configuration(
                "empty_handler_id",
                "Handler id cannot be empty",
                "handler:register",
            ));
        }
        if self.handlers.contains_key(&id) {
            return Err(ForemanError::configuration(
                "duplicate_handler",
                format!("Handler '{id}' is declared twice"),
                "handler:register",
            )
            .with_context("handler", id));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(id).cloned()
    }

    #[must_use]
    pub fn ids(&self) -> HashSet<String> {
        self.handlers.keys().cloned().collect()
    }

    #[must_use]
    pub fn descriptors(&self) -> Vec<TaskHandler> {
        self.handlers.values().map(|h| h.descriptor().clone()).collect()
    }
}
