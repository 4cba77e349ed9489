//! Core domain: events, rules, handlers, work units and publications.
//!
//! # Architecture
//!
//! ```text
//! Event → Dispatcher (rules) → TaskRunner (handler groups) → Aggregator (verdict)
//!                                                                 │
//!        LifecycleManager (work units) ← Watcher (publish → review → merge/reject)
//! ```
//!
//! # Key Concepts
//!
//! ## Work units
//!
//! A work unit is one branch plus its isolated workspace. The
//! [`LifecycleManager`](lifecycle::LifecycleManager) is the only component
//! that changes a unit's state or deletes its workspace. Every mutating
//! operation on a unit holds that unit's operation lock for its duration.
//!
//! ## Dispatch rounds
//!
//! Rules are data. The [`Dispatcher`](dispatcher::Dispatcher) unions the
//! handlers of every matching rule and layers them by `must_follow`
//! dependency; the [`TaskRunner`](runner::TaskRunner) runs each layer
//! concurrently and the layers in order. Handler failures are results, not
//! errors, and [`reduce`](aggregator::reduce) turns them into a verdict.
//!
//! ## Publications
//!
//! The [`Watcher`](watcher::Watcher) derives every step from persisted
//! records plus a fresh status query, so it can be restarted at any point.
//! [`decide`](publication::decide) is the pure merge policy.
//!
//! ## Errors
//!
//! All errors are [`ForemanError`](error::ForemanError): a taxonomy kind, a
//! code, the originating component and the offending work unit or
//! publication id in `context`.
//!
//! # Modules
//!
//! - [`event`] - Event records
//! - [`rules`] - Rule and predicate definitions
//! - [`handler`] - Handler descriptors, invocation contract, command handlers
//! - [`dispatcher`] - Event to handler groups
//! - [`runner`] - Concurrent group execution
//! - [`verification`] - Task results and findings
//! - [`aggregator`] - Verdict reduction
//! - [`workunit`] - Work unit state machine
//! - [`lifecycle`] - Work unit creation, teardown and orphan recovery
//! - [`publication`] - Publication records and the merge decision
//! - [`watcher`] - Publication and review state machine
//! - [`lock`] - Cross-process operation and merge locks
//! - [`retry`] - Bounded retry for idempotent queries
//! - [`config`] - Configuration
//! - [`engine`] - Component wiring
//! - [`error`] - Structured error types

pub mod aggregator;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod lifecycle;
pub mod lock;
pub mod publication;
pub mod retry;
pub mod rules;
pub mod runner;
pub mod verification;
pub mod watcher;
pub mod workunit;
