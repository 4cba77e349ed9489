//! CLI commands and argument parsing.
//!
//! Built on [`clap`](https://docs.rs/clap). Every component operation is
//! reachable from here.
//!
//! # Commands
//!
//! - **Work units**: `workunit create`, `workunit status`, `workunit list`,
//!   `workunit orphans`, `teardown`
//! - **Dispatch**: `dispatch <event-file>`
//! - **Publication**: `publish`, `watch`, `review`, `publication list|show|archive|resolve`
//! - **Rules**: `rules check|reload|show`
//! - **Audit**: `journal`
//!
//! # Output Formats
//!
//! `-f`/`--format` selects `table` (default), `json` or `yaml`. Logs go to
//! stderr, so stdout stays machine-readable.
//!
//! # Example
//!
//! ```bash,no_run
//! foreman workunit create feat-x
//! foreman dispatch event.json --work-unit feat-x
//! foreman publish feat-x
//! foreman watch --interval 30
//! ```
//!
//! # Modules
//!
//! - [`commands`] - Command definitions
//! - [`output`] - Output formatting and table rendering

pub mod commands;
pub mod output;
