//! CLI command definitions.

use super::output::OutputFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DecisionArg {
    Approve,
    RequestChanges,
    Block,
}

/// Foreman - development workflow orchestrator.
#[derive(Parser)]
#[command(name = "foreman")]
#[command(
    version,
    about,
    long_about = "Runs handler rounds against isolated work units and drives ready work through review to merge."
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Configuration file (default: <data dir>/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show version information
    Version,

    /// Work unit management
    #[command(subcommand)]
    Workunit(WorkunitCommands),

    /// Run the handlers an event selects against a work unit
    Dispatch(DispatchArgs),

    /// Publish a work unit whose last verdict is ready
    Publish(PublishArgs),

    /// Drive pending publications through review
    Watch(WatchArgs),

    /// Tear down a work unit's workspace and branch
    Teardown(TeardownArgs),

    /// Record a reviewer verdict on a publication
    Review(ReviewArgs),

    /// Publication record inspection and operator actions
    #[command(subcommand)]
    Publication(PublicationCommands),

    /// Rule configuration
    #[command(subcommand)]
    Rules(RulesCommands),

    /// Show the audit journal
    Journal(JournalArgs),
}

/// Work unit subcommands.
#[derive(Subcommand)]
pub enum WorkunitCommands {
    /// Create a branch and workspace
    Create(WorkunitCreateArgs),
    /// Show one work unit
    Status(WorkunitNameArgs),
    /// List work units
    List,
    /// List (and optionally reclaim) idle work units
    Orphans(OrphansArgs),
}

#[derive(Args)]
pub struct WorkunitCreateArgs {
    /// Branch name
    pub name: String,

    /// Base ref (default: base_ref from config)
    #[arg(long)]
    pub base: Option<String>,
}

#[derive(Args)]
pub struct WorkunitNameArgs {
    /// Branch name
    pub name: String,
}

#[derive(Args)]
pub struct OrphansArgs {
    /// Idle time after which a work unit counts as orphaned
    #[arg(long, default_value_t = 24)]
    pub max_age_hours: u32,

    /// Abandon and tear down every orphan found
    #[arg(long, default_value_t = false)]
    pub reclaim: bool,
}

#[derive(Args)]
pub struct DispatchArgs {
    /// Event file (JSON, or YAML by extension)
    pub event_file: PathBuf,

    /// Work unit (default: the event's work_unit payload key)
    #[arg(long)]
    pub work_unit: Option<String>,
}

#[derive(Args)]
pub struct PublishArgs {
    /// Branch name
    pub name: String,
}

#[derive(Args)]
pub struct WatchArgs {
    /// Seconds between passes (default: watcher.poll_interval_secs)
    #[arg(long)]
    pub interval: Option<u64>,

    /// Run a single pass and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

#[derive(Args)]
pub struct TeardownArgs {
    /// Branch name
    pub name: String,

    /// Abandon a live work unit first
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args)]
pub struct ReviewArgs {
    /// Publication remote id
    pub remote_id: String,

    /// Reviewer role id
    #[arg(long)]
    pub reviewer: String,

    #[arg(long, value_enum)]
    pub decision: DecisionArg,

    #[arg(long, default_value = "")]
    pub comment: String,
}

/// Publication subcommands.
#[derive(Subcommand)]
pub enum PublicationCommands {
    /// List publication records
    List,
    /// Show one publication record with its verdicts
    Show(RemoteIdArgs),
    /// Archive a closed record so its branch name can be reused
    Archive(RemoteIdArgs),
    /// Clear a failure annotation after checking the host by hand
    Resolve(RemoteIdArgs),
}

#[derive(Args)]
pub struct RemoteIdArgs {
    /// Publication remote id
    pub remote_id: String,
}

/// Rule subcommands.
#[derive(Subcommand)]
pub enum RulesCommands {
    /// Validate a rule file without installing it
    Check(RulesCheckArgs),
    /// Validate the rule source and install it as the active rule set
    Reload,
    /// Show the active rule set
    Show,
}

#[derive(Args)]
pub struct RulesCheckArgs {
    /// Rule file (default: rules_path from config)
    pub path: Option<PathBuf>,
}

#[derive(Args)]
pub struct JournalArgs {
    /// Only entries about this work unit or publication
    #[arg(long)]
    pub subject: Option<String>,

    /// Only the most recent entries
    #[arg(long)]
    pub limit: Option<usize>,
}
