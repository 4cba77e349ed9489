//! Foreman - development workflow orchestrator.
//!
//! Matches development events to handler groups, runs them against isolated
//! work units and drives ready work through publication, review and merge.

pub mod adapters;
pub mod cli;
pub mod core;
pub mod storage;
