//! Concurrent task runner.
//!
//! Runs a dispatch plan group by group. Handlers within a group run on their
//! own threads (bounded by `max_parallel`); the next group starts only after
//! every handler of the current one has reported or timed out. Each handler
//! gets its deadline in its context and must stop its work once it passes.
//! A timed-out handler is recorded as a failure and never retried. The round
//! returns only after timed-out handlers have stopped, or after `kill_grace`
//! if one ignores its deadline.

use crate::core::aggregator::{reduce, Verdict};
use crate::core::dispatcher::HandlerGroup;
use crate::core::error::{ForemanError, Result};
use crate::core::handler::{HandlerContext, HandlerRegistry, TaskHandler};
use crate::core::verification::{Finding, Severity, TaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Runner limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub default_timeout: Duration,
    /// Handlers running at once within one group.
    pub max_parallel: usize,
    /// How long a timed-out handler gets to stop before the round gives up on it.
    pub kill_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(600),
            max_parallel: 4,
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Cooperative cancellation for an in-flight round.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Shares the underlying flag, e.g. with a signal handler.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Everything one round produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub work_unit: String,
    /// One result per selected handler, in plan order.
    pub results: Vec<TaskResult>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RoundReport {
    /// A cancelled round is blocked regardless of partial results.
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        if self.cancelled {
            Verdict::Blocked
        } else {
            reduce(&self.results)
        }
    }
}

/// Removes the work unit from the in-flight set when the round ends.
struct RoundGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    work_unit: String,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.remove(&self.work_unit);
    }
}

/// Executes handler groups for work units.
pub struct TaskRunner {
    handlers: HandlerRegistry,
    config: RunnerConfig,
    active: Mutex<HashSet<String>>,
}

impl TaskRunner {
    #[must_use]
    pub fn new(handlers: HandlerRegistry, config: RunnerConfig) -> Self {
        Self {
            handlers,
            config,
            active: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> RunnerConfig {
        self.config
    }

    /// Whether a round is currently running for this work unit.
    #[must_use]
    pub fn is_running(&self, work_unit: &str) -> bool {
        match self.active.lock() {
            Ok(active) => active.contains(work_unit),
            Err(poisoned) => poisoned.into_inner().contains(work_unit),
        }
    }

    fn begin(&self, work_unit: &str) -> Result<RoundGuard<'_>> {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !active.insert(work_unit.to_string()) {
            return Err(ForemanError::conflict(
                "round_in_progress",
                "A dispatch round is already running for this work unit",
                "runner:run",
            )
            .for_work_unit(work_unit)
            .recoverable(true));
        }
        Ok(RoundGuard {
            active: &self.active,
            work_unit: work_unit.to_string(),
        })
    }

    /// Runs every group in order and returns one result per handler.
    pub fn run(
        &self,
        groups: &[HandlerGroup],
        context: &HandlerContext,
        cancel: &CancelToken,
    ) -> Result<RoundReport> {
        let work_unit = context.work_unit.clone();
        let _guard = self.begin(&work_unit)?;
        let started_at = Utc::now();
        let context = Arc::new(context.clone());

        let mut results = Vec::new();
        let mut cancelled = false;
        for (index, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                tracing::warn!(branch = %work_unit, group = index, "round cancelled; skipping remaining groups");
                results.extend(
                    group
                        .iter()
                        .map(|h| TaskResult::skipped(h.id.clone(), "round cancelled before group started")),
                );
                continue;
            }

            tracing::debug!(
                branch = %work_unit,
                group = index,
                handlers = ?group.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(),
                "starting handler group"
            );
            let (group_results, interrupted) = self.run_group(group, &context, cancel);
            cancelled |= interrupted;
            results.extend(group_results);
        }

        for result in &results {
            if result.status == TaskStatus::Failure {
                tracing::info!(branch = %work_unit, handler = %result.handler_id, "handler failed");
            }
        }

        Ok(RoundReport {
            work_unit,
            results,
            cancelled: cancelled || cancel.is_cancelled(),
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Runs one group. Returns results in group order and whether
    /// cancellation prevented some handler from starting.
    fn run_group(
        &self,
        group: &[TaskHandler],
        context: &Arc<HandlerContext>,
        cancel: &CancelToken,
    ) -> (Vec<TaskResult>, bool) {
        let mut slots: Vec<Option<TaskResult>> = vec![None; group.len()];
        let mut order: Vec<usize> = (0..group.len()).collect();
        order.sort_by(|a, b| group[*b].estimated_cost.cmp(&group[*a].estimated_cost));
        let mut queue: VecDeque<usize> = order.into();

        let (tx, rx) = mpsc::channel::<(usize, TaskResult)>();
        let mut in_flight: HashMap<usize, Instant> = HashMap::new();
        // timed-out handlers still stopping, with the end of their grace period
        let mut stopping: HashMap<usize, Instant> = HashMap::new();
        let max_parallel = self.config.max_parallel.max(1);
        let mut interrupted = false;

        loop {
            while in_flight.len() < max_parallel {
                let Some(index) = queue.pop_front() else {
                    break;
                };
                if cancel.is_cancelled() {
                    interrupted = true;
                    slots[index] = Some(TaskResult::skipped(
                        group[index].id.clone(),
                        "round cancelled before handler started",
                    ));
                    continue;
                }
                match self.spawn(index, &group[index], context, tx.clone()) {
                    Ok(deadline) => {
                        in_flight.insert(index, deadline);
                    }
                    Err(result) => slots[index] = Some(result),
                }
            }

            if in_flight.is_empty() {
                if queue.is_empty() {
                    break;
                }
                continue;
            }

            let now = Instant::now();
            let next_deadline = in_flight.values().copied().min().unwrap_or(now);
            match rx.recv_timeout(next_deadline.saturating_duration_since(now)) {
                Ok((index, result)) => {
                    // A report after the deadline was already recorded as a timeout.
                    if in_flight.remove(&index).is_some() {
                        slots[index] = Some(result);
                    } else {
                        stopping.remove(&index);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let expired: Vec<usize> = in_flight
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(index, _)| *index)
                        .collect();
                    for index in expired {
                        in_flight.remove(&index);
                        stopping.insert(index, now + self.config.kill_grace);
                        let handler = &group[index];
                        let timeout_ms = self.timeout_for(handler).as_millis();
                        tracing::warn!(
                            branch = %context.work_unit,
                            handler = %handler.id,
                            timeout_ms = %timeout_ms,
                            "handler timed out"
                        );
                        slots[index] = Some(TaskResult::timed_out(
                            handler.id.clone(),
                            u64::try_from(timeout_ms).unwrap_or(u64::MAX),
                            handler.blocking,
                        ));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Self::await_stopped(group, context, &rx, stopping);

        let results = slots
            .into_iter()
            .zip(group)
            .map(|(slot, handler)| {
                slot.unwrap_or_else(|| {
                    TaskResult::failure(
                        handler.id.clone(),
                        0,
                        vec![Finding::new(Severity::Error, "handler never reported")],
                    )
                })
            })
            .collect();
        (results, interrupted)
    }

    /// Waits for timed-out handlers to report that their work has stopped.
    fn await_stopped(
        group: &[TaskHandler],
        context: &HandlerContext,
        rx: &mpsc::Receiver<(usize, TaskResult)>,
        mut stopping: HashMap<usize, Instant>,
    ) {
        while let Some(until) = stopping.values().copied().min() {
            match rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
                Ok((index, _)) => {
                    stopping.remove(&index);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    stopping.retain(|index, until| {
                        if *until > now {
                            return true;
                        }
                        tracing::error!(
                            branch = %context.work_unit,
                            handler = %group[*index].id,
                            "handler still running after its timeout and grace period"
                        );
                        false
                    });
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn timeout_for(&self, handler: &TaskHandler) -> Duration {
        handler
            .timeout_ms
            .map_or(self.config.default_timeout, Duration::from_millis)
    }

    /// Starts one handler thread. Returns its deadline, or a ready result if
    /// it could not be started.
    fn spawn(
        &self,
        index: usize,
        descriptor: &TaskHandler,
        context: &Arc<HandlerContext>,
        tx: mpsc::Sender<(usize, TaskResult)>,
    ) -> std::result::Result<Instant, TaskResult> {
        let severity = if descriptor.blocking {
            Severity::Blocking
        } else {
            Severity::Error
        };
        let failed = move |code: &str, message: String| {
            let err = ForemanError::handler_failure(code, message, "runner:spawn")
                .for_work_unit(&context.work_unit)
                .with_context("handler", &descriptor.id);
            tracing::error!(error = %err, "handler did not run to completion");
            TaskResult::failure(descriptor.id.clone(), 0, vec![Finding::new(severity, err.message)])
        };
        let Some(handler) = self.handlers.get(&descriptor.id) else {
            return Err(failed("handler_not_registered", "handler is not registered".to_string()));
        };

        let id = descriptor.id.clone();
        let work_unit = context.work_unit.clone();
        let deadline = Instant::now() + self.timeout_for(descriptor);
        let mut scoped = HandlerContext::clone(context);
        scoped.deadline = Some(deadline);
        let spawned = std::thread::Builder::new()
            .name(format!("handler-{id}"))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    handler.invoke(&scoped.work_unit, &scoped)
                }))
                .unwrap_or_else(|_| {
                    let err = ForemanError::handler_failure(
                        "handler_panicked",
                        "handler panicked",
                        "runner:handler",
                    )
                    .for_work_unit(&work_unit)
                    .with_context("handler", &id);
                    tracing::error!(error = %err, "handler panicked");
                    TaskResult::failure(id.clone(), 0, vec![Finding::new(severity, err.message)])
                });
                // The receiver is gone once the round has moved on.
                let _ = tx.send((index, result));
            });

        match spawned {
            Ok(_) => Ok(deadline),
            Err(e) => Err(failed(
                "handler_spawn_failed",
                format!("failed to start handler: {e}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handler::{CommandHandler, CommandHandlerConfig, Handler};
    use std::sync::atomic::AtomicUsize;

    /// Test handler with a scripted outcome and an optional delay.
    struct Scripted {
        descriptor: TaskHandler,
        status: TaskStatus,
        blocking_finding: bool,
        delay: Duration,
        calls: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Handler for Scripted {
        fn descriptor(&self) -> &TaskHandler {
            &self.descriptor
        }

        fn invoke(&self, _work_unit: &str, _context: &HandlerContext) -> TaskResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log
                .lock()
                .unwrap()
                .push(format!("start:{}", self.descriptor.id));
            std::thread::sleep(self.delay);
            self.log
                .lock()
                .unwrap()
                .push(format!("end:{}", self.descriptor.id));
            match self.status {
                TaskStatus::Failure => TaskResult::failure(
                    self.descriptor.id.clone(),
                    0,
                    vec![Finding::new(
                        if self.blocking_finding {
                            Severity::Blocking
                        } else {
                            Severity::Error
                        },
                        "scripted failure",
                    )],
                ),
                TaskStatus::Warning => TaskResult::warning(self.descriptor.id.clone(), 0, Vec::new()),
                _ => TaskResult::success(self.descriptor.id.clone(), 0),
            }
        }
    }

    struct Fixture {
        registry: HandlerRegistry,
        log: Arc<Mutex<Vec<String>>>,
        calls: HashMap<String, Arc<AtomicUsize>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: HandlerRegistry::new(),
                log: Arc::new(Mutex::new(Vec::new())),
                calls: HashMap::new(),
            }
        }

        fn add(&mut self, descriptor: TaskHandler, status: TaskStatus, delay_ms: u64) -> TaskHandler {
            let calls = Arc::new(AtomicUsize::new(0));
            self.calls.insert(descriptor.id.clone(), Arc::clone(&calls));
            self.registry
                .register(Arc::new(Scripted {
                    descriptor: descriptor.clone(),
                    status,
                    blocking_finding: descriptor.blocking,
                    delay: Duration::from_millis(delay_ms),
                    calls,
                    log: Arc::clone(&self.log),
                }))
                .unwrap();
            descriptor
        }

        fn runner(&self, timeout_ms: u64) -> TaskRunner {
            TaskRunner::new(
                self.registry.clone(),
                RunnerConfig {
                    default_timeout: Duration::from_millis(timeout_ms),
                    max_parallel: 4,
                    kill_grace: Duration::from_millis(100),
                },
            )
        }
    }

    fn context() -> HandlerContext {
        HandlerContext::new("feat-x", std::env::temp_dir(), Default::default())
    }

    #[test]
    fn groups_run_in_order_and_every_handler_reports() {
        let mut fx = Fixture::new();
        let lint = fx.add(TaskHandler::new("lint"), TaskStatus::Success, 30);
        let typecheck = fx.add(TaskHandler::new("typecheck"), TaskStatus::Success, 60);
        let security = fx.add(TaskHandler::new("security"), TaskStatus::Success, 0);

        let report = fx
            .runner(5_000)
            .run(&[vec![lint, typecheck], vec![security]], &context(), &CancelToken::new())
            .unwrap();

        let ids: Vec<_> = report.results.iter().map(|r| r.handler_id.as_str()).collect();
        assert_eq!(ids, ["lint", "typecheck", "security"]);
        assert_eq!(report.verdict(), Verdict::Ready);

        let log = fx.log.lock().unwrap().clone();
        let security_start = log.iter().position(|l| l == "start:security").unwrap();
        let typecheck_end = log.iter().position(|l| l == "end:typecheck").unwrap();
        let lint_end = log.iter().position(|l| l == "end:lint").unwrap();
        assert!(security_start > typecheck_end);
        assert!(security_start > lint_end);
    }

    #[test]
    fn handlers_in_a_group_overlap() {
        let mut fx = Fixture::new();
        let a = fx.add(TaskHandler::new("a"), TaskStatus::Success, 150);
        let b = fx.add(TaskHandler::new("b"), TaskStatus::Success, 150);

        let started = Instant::now();
        fx.runner(5_000)
            .run(&[vec![a, b]], &context(), &CancelToken::new())
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(290));

        let log = fx.log.lock().unwrap().clone();
        assert!(log[0].starts_with("start:") && log[1].starts_with("start:"));
    }

    #[test]
    fn timeout_is_a_failure_and_does_not_block_siblings() {
        let mut fx = Fixture::new();
        let slow = fx.add(TaskHandler::new("slow").with_timeout_ms(50), TaskStatus::Success, 1_000);
        let fast = fx.add(TaskHandler::new("fast"), TaskStatus::Success, 10);

        let started = Instant::now();
        let report = fx
            .runner(5_000)
            .run(&[vec![slow, fast]], &context(), &CancelToken::new())
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(900));

        assert_eq!(report.results[0].status, TaskStatus::Failure);
        assert!(report.results[0].findings[0].message.contains("timed out"));
        assert_eq!(report.results[1].status, TaskStatus::Success);
        assert_eq!(report.verdict(), Verdict::NeedsAttention);
    }

    #[test]
    fn failed_non_idempotent_handler_runs_once() {
        let mut fx = Fixture::new();
        let deploy = fx.add(
            TaskHandler::new("deploy_preview").non_idempotent().blocking(),
            TaskStatus::Failure,
            0,
        );
        let report = fx
            .runner(5_000)
            .run(&[vec![deploy]], &context(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.verdict(), Verdict::Blocked);
        assert_eq!(fx.calls["deploy_preview"].load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_skips_later_groups_and_blocks() {
        let mut fx = Fixture::new();
        let first = fx.add(TaskHandler::new("first"), TaskStatus::Success, 100);
        let second = fx.add(TaskHandler::new("second"), TaskStatus::Success, 0);

        let runner = Arc::new(fx.runner(5_000));
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        let report = runner
            .run(&[vec![first], vec![second]], &context(), &cancel)
            .unwrap();
        handle.join().unwrap();

        assert!(report.cancelled);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].status, TaskStatus::Success);
        assert_eq!(report.results[1].status, TaskStatus::Skipped);
        assert_eq!(report.verdict(), Verdict::Blocked);
        assert_eq!(fx.calls["second"].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_rounds_for_one_work_unit_are_refused() {
        let mut fx = Fixture::new();
        let slow = fx.add(TaskHandler::new("slow"), TaskStatus::Success, 200);
        let runner = Arc::new(fx.runner(5_000));

        let background = Arc::clone(&runner);
        let group = vec![slow.clone()];
        let handle = std::thread::spawn(move || {
            background.run(&[group], &context(), &CancelToken::new())
        });
        std::thread::sleep(Duration::from_millis(50));

        assert!(runner.is_running("feat-x"));
        let err = runner
            .run(&[vec![slow]], &context(), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.code, "round_in_progress");

        assert!(handle.join().unwrap().is_ok());
        assert!(!runner.is_running("feat-x"));
    }

    #[test]
    fn costlier_handlers_start_first_under_parallel_limit() {
        let mut fx = Fixture::new();
        let cheap = fx.add(TaskHandler::new("cheap").with_cost(1), TaskStatus::Success, 10);
        let costly = fx.add(TaskHandler::new("costly").with_cost(9), TaskStatus::Success, 10);
        let runner = TaskRunner::new(
            fx.registry.clone(),
            RunnerConfig {
                default_timeout: Duration::from_secs(5),
                max_parallel: 1,
                kill_grace: Duration::from_millis(100),
            },
        );
        let report = runner
            .run(&[vec![cheap, costly]], &context(), &CancelToken::new())
            .unwrap();

        assert_eq!(fx.log.lock().unwrap()[0], "start:costly");
        let ids: Vec<_> = report.results.iter().map(|r| r.handler_id.as_str()).collect();
        assert_eq!(ids, ["cheap", "costly"]);
    }

    #[test]
    fn unregistered_handler_reports_failure() {
        let fx = Fixture::new();
        let report = fx
            .runner(1_000)
            .run(&[vec![TaskHandler::new("ghost").blocking()]], &context(), &CancelToken::new())
            .unwrap();
        assert!(report.results[0].is_blocking_failure());
        assert_eq!(report.verdict(), Verdict::Blocked);
    }

    #[test]
    fn timed_out_command_is_stopped_before_the_round_returns() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = HandlerRegistry::new();
        let descriptor = TaskHandler::new("slow").with_timeout_ms(50);
        registry
            .register(Arc::new(CommandHandler::new(CommandHandlerConfig {
                descriptor: descriptor.clone(),
                command: "sleep 1; touch leaked_marker".to_string(),
                warn_exit_codes: Vec::new(),
            })))
            .unwrap();
        let runner = TaskRunner::new(registry, RunnerConfig::default());
        let ctx = HandlerContext::new("feat-x", dir.path().to_path_buf(), Default::default());

        let started = Instant::now();
        let report = runner.run(&[vec![descriptor]], &ctx, &CancelToken::new()).unwrap();
        assert!(started.elapsed() < Duration::from_millis(800));
        assert_eq!(report.results[0].status, TaskStatus::Failure);
        assert!(report.results[0].findings[0].message.contains("timed out"));

        std::thread::sleep(Duration::from_millis(1_500));
        assert!(!dir.path().join("leaked_marker").exists());
    }

    #[test]
    fn round_waits_for_a_timed_out_handler_within_grace() {
        let mut fx = Fixture::new();
        let slow = fx.add(TaskHandler::new("slow").with_timeout_ms(20), TaskStatus::Success, 60);
        let report = fx
            .runner(5_000)
            .run(&[vec![slow]], &context(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.results[0].status, TaskStatus::Failure);
        assert!(fx.log.lock().unwrap().contains(&"end:slow".to_string()));
    }
}
