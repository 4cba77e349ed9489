//! Version-control and code-hosting adapters.
//!
//! The core only issues commands and queries through
//! [`host::VcsHost`]; adapters own everything product-specific.
//!
//! # Supported Hosts
//!
//! | Kind | Backing | Reviews arrive via |
//! |------|---------|--------------------|
//! | `github` | `git` worktrees + `gh` | pull request reviews |
//! | `local` | plain directories + JSON file | `foreman review` |
//!
//! # Modules
//!
//! - [`host`] - Host trait, status types and errors
//! - [`github`] - git + GitHub CLI host
//! - [`local`] - Directory-backed host for dry runs and tests

pub mod github;
pub mod host;
pub mod local;
