//! Result aggregation - reduces one round's results to a verdict.
//!
//! `reduce` is a pure function of the result set, so a verdict can be
//! recomputed at any time from stored results without re-running handlers.

use crate::core::verification::{TaskResult, TaskStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Ready,
    NeedsAttention,
    Blocked,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::NeedsAttention => write!(f, "needs_attention"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Reduces results: a blocking failure blocks, any other failure or warning
/// needs attention, otherwise ready.
#[must_use]
pub fn reduce(results: &[TaskResult]) -> Verdict {
    if results.iter().any(TaskResult::is_blocking_failure) {
        return Verdict::Blocked;
    }
    if results
        .iter()
        .any(|r| matches!(r.status, TaskStatus::Failure | TaskStatus::Warning))
    {
        return Verdict::NeedsAttention;
    }
    Verdict::Ready
}

/// Per-status counts, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub success: usize,
    pub warning: usize,
    pub failure: usize,
    pub skipped: usize,
    pub blocking: usize,
}

#[must_use]
pub fn summarize(results: &[TaskResult]) -> ResultSummary {
    let mut summary = ResultSummary::default();
    for result in results {
        match result.status {
            TaskStatus::Success => summary.success += 1,
            TaskStatus::Warning => summary.warning += 1,
            TaskStatus::Failure => summary.failure += 1,
            TaskStatus::Skipped => summary.skipped += 1,
        }
        if result.is_blocking_failure() {
            summary.blocking += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::verification::{Finding, Severity};

    #[test]
    fn empty_and_clean_rounds_are_ready() {
        assert_eq!(reduce(&[]), Verdict::Ready);
        let results = vec![
            TaskResult::success("lint", 5),
            TaskResult::skipped("docs", "not applicable"),
        ];
        assert_eq!(reduce(&results), Verdict::Ready);
    }

    #[test]
    fn warnings_and_soft_failures_need_attention() {
        let warn = vec![
            TaskResult::success("lint", 1),
            TaskResult::warning("docs", 1, vec![Finding::new(Severity::Warning, "stale")]),
        ];
        assert_eq!(reduce(&warn), Verdict::NeedsAttention);

        let soft = vec![TaskResult::failure(
            "typecheck",
            1,
            vec![Finding::new(Severity::Error, "mismatch")],
        )];
        assert_eq!(reduce(&soft), Verdict::NeedsAttention);
    }

    #[test]
    fn blocking_failure_blocks() {
        let results = vec![
            TaskResult::warning("docs", 1, Vec::new()),
            TaskResult::failure("lint", 1, vec![Finding::new(Severity::Blocking, "forbidden")]),
        ];
        assert_eq!(reduce(&results), Verdict::Blocked);
        assert_eq!(summarize(&results).blocking, 1);
    }

    #[test]
    fn blocking_finding_on_warning_does_not_block() {
        let results = vec![TaskResult::warning(
            "docs",
            1,
            vec![Finding::new(Severity::Blocking, "odd but only a warning")],
        )];
        assert_eq!(reduce(&results), Verdict::NeedsAttention);
    }

    #[test]
    fn reduction_is_repeatable_and_order_free() {
        let mut results = vec![
            TaskResult::success("a", 1),
            TaskResult::failure("b", 1, vec![Finding::new(Severity::Error, "x")]),
            TaskResult::skipped("c", "cancelled"),
        ];
        let first = reduce(&results);
        assert_eq!(reduce(&results), first);
        results.reverse();
        assert_eq!(reduce(&results), first);
    }
}
