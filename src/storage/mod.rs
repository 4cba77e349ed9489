//! Persistence for work units, publication records and the audit journal.
//!
//! # Layout
//!
//! ```text
//! <data_dir>/
//!   state/workunits/<branch>.json
//!   state/publications/<remote-id>.json
//!   journal.jsonl
//!   locks/
//! ```
//!
//! Records are rewritten atomically (write + rename); the journal is
//! append-only. Both survive restarts, which is what lets the watcher
//! resume mid-cycle.
//!
//! # Modules
//!
//! - [`state_store`] - Work unit and publication records
//! - [`journal`] - Append-only audit journal

pub mod journal;
pub mod state_store;
