//! Foreman CLI entrypoint.

use clap::error::ErrorKind;
use clap::Parser;
use foreman::cli::commands::{
    Cli, Commands, DecisionArg, DispatchArgs, JournalArgs, OrphansArgs, PublicationCommands,
    ReviewArgs, RulesCommands, TeardownArgs, WatchArgs, WorkunitCommands,
};
use foreman::cli::output::{create_table, output, output_error, print_list, print_rows, OutputFormat};
use foreman::core::aggregator::Verdict;
use foreman::core::config::{default_data_dir, ForemanConfig};
use foreman::core::engine::{DispatchReport, Engine, RulesInfo};
use foreman::core::error::ExitCode;
use foreman::core::event::Event;
use foreman::core::lifecycle::Reclaimed;
use foreman::core::publication::{PublicationRecord, ReviewDecision};
use foreman::core::runner::CancelToken;
use foreman::core::watcher::{ExternalUpdate, PollReport, StepOutcome};
use foreman::core::workunit::WorkUnit;
use foreman::storage::journal::JournalFilter;
use signal_hook::consts::SIGINT;
use std::ffi::OsString;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "FOREMAN_LOG";
const LOG_JSON_ENV: &str = "FOREMAN_LOG_JSON";

fn parse_format_from_args(args: &[OsString]) -> OutputFormat {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let s = arg.to_string_lossy();

        if s == "-f" || s == "--format" {
            if let Some(value) = iter.next() {
                return parse_format_value(&value.to_string_lossy());
            }
        }

        if let Some(value) = s.strip_prefix("--format=") {
            return parse_format_value(value);
        }
    }

    OutputFormat::Table
}

fn parse_format_value(value: &str) -> OutputFormat {
    match value.to_lowercase().as_str() {
        "json" => OutputFormat::Json,
        "yaml" | "yml" => OutputFormat::Yaml,
        _ => OutputFormat::Table,
    }
}

/// Logs go to stderr; `FOREMAN_LOG` overrides the filter and
/// `FOREMAN_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("foreman=info"));
    let json = std::env::var(LOG_JSON_ENV).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("Warning: logging disabled: {e}");
    }
}

fn print_structured<T: serde::Serialize>(value: &T, format: OutputFormat, context: &str) {
    if let Err(err) = output(value, format) {
        eprintln!("Failed to render {context}: {err}");
    }
}

fn output_version(format: OutputFormat) {
    let version = env!("CARGO_PKG_VERSION");
    match format {
        OutputFormat::Table => println!("foreman {version}"),
        _ => print_structured(
            &serde_json::json!({"name": "foreman", "version": version}),
            format,
            "version",
        ),
    }
}

fn handle_clap_error(err: &clap::Error, format: OutputFormat) -> ExitCode {
    match err.kind() {
        ErrorKind::DisplayHelp => {
            print!("{}", err.render());
            ExitCode::Success
        }
        ErrorKind::DisplayVersion => {
            output_version(format);
            ExitCode::Success
        }
        _ => {
            eprintln!("{}", err.render());
            ExitCode::Rejected
        }
    }
}

fn main() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let is_broken_pipe = info
            .payload()
            .downcast_ref::<&str>()
            .is_some_and(|s| s.contains("Broken pipe"))
            || info
                .payload()
                .downcast_ref::<String>()
                .is_some_and(|s| s.contains("Broken pipe"));

        if is_broken_pipe {
            return;
        }

        default_hook(info);
    }));

    init_tracing();
    let args: Vec<OsString> = std::env::args_os().collect();
    let format = parse_format_from_args(&args);

    let result = std::panic::catch_unwind(|| Cli::try_parse_from(&args).map(run));

    match result {
        Ok(Ok(exit_code)) => process::exit(i32::from(exit_code)),
        Ok(Err(e)) => process::exit(i32::from(handle_clap_error(&e, format))),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("panic");

            if msg.contains("Broken pipe") {
                process::exit(0);
            }

            std::panic::resume_unwind(payload);
        }
    }
}

fn run(cli: Cli) -> ExitCode {
    let format = cli.format;
    let Some(command) = cli.command else {
        println!("foreman {}", env!("CARGO_PKG_VERSION"));
        println!("Use --help for usage information.");
        return ExitCode::Success;
    };
    if matches!(command, Commands::Version) {
        output_version(format);
        return ExitCode::Success;
    }

    let Some(mut engine) = open_engine(cli.config.as_deref(), format) else {
        return ExitCode::Configuration;
    };
    match command {
        Commands::Version => ExitCode::Success,
        Commands::Workunit(cmd) => handle_workunit(&engine, cmd, format),
        Commands::Dispatch(args) => handle_dispatch(&engine, &args, format),
        Commands::Publish(args) => match engine.watcher().publish(&args.name) {
            Ok(record) => {
                print_publication(&record, format);
                ExitCode::Success
            }
            Err(e) => output_error(&e, format),
        },
        Commands::Watch(args) => handle_watch(&engine, &args, format),
        Commands::Teardown(args) => handle_teardown(&engine, &args, format),
        Commands::Review(args) => handle_review(&engine, args, format),
        Commands::Publication(cmd) => handle_publication(&engine, cmd, format),
        Commands::Rules(cmd) => handle_rules(&mut engine, cmd, format),
        Commands::Journal(args) => handle_journal(&engine, &args, format),
    }
}

fn open_engine(config_path: Option<&Path>, format: OutputFormat) -> Option<Engine> {
    let opened = ForemanConfig::load(default_data_dir(), config_path).and_then(Engine::open);
    match opened {
        Ok(engine) => Some(engine),
        Err(e) => {
            output_error(&e, format);
            None
        }
    }
}

fn print_work_unit(unit: &WorkUnit, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            println!("Branch:        {}", unit.branch_name);
            println!("State:         {}", unit.state);
            println!("Workspace:     {}", unit.workspace_path.display());
            println!("Parent ref:    {}", unit.parent_ref);
            if let Some(verdict) = unit.last_verdict {
                println!("Last verdict:  {verdict}");
            }
            if let Some(publication) = &unit.publication {
                println!("Publication:   {publication}");
            }
            println!("Created:       {}", unit.created_at);
            println!("Last activity: {}", unit.last_activity_at);
            if let Some(at) = unit.torn_down_at {
                println!("Torn down:     {at}");
            }
            if !unit.annotations.is_empty() {
                println!("Annotations:");
                for note in &unit.annotations {
                    println!("  - {} [{}] {}", note.at, note.origin, note.message);
                }
            }
        }
        _ => print_structured(unit, format, "work unit"),
    }
}

fn handle_workunit(engine: &Engine, cmd: WorkunitCommands, format: OutputFormat) -> ExitCode {
    let lifecycle = engine.lifecycle();
    match cmd {
        WorkunitCommands::Create(args) => {
            let base = args
                .base
                .unwrap_or_else(|| engine.config().base_ref.clone());
            match lifecycle.create(&args.name, &base) {
                Ok(unit) => {
                    print_work_unit(&unit, format);
                    ExitCode::Success
                }
                Err(e) => output_error(&e, format),
            }
        }
        WorkunitCommands::Status(args) => match lifecycle.status(&args.name) {
            Ok(unit) => {
                print_work_unit(&unit, format);
                ExitCode::Success
            }
            Err(e) => output_error(&e, format),
        },
        WorkunitCommands::List => match lifecycle.list() {
            Ok(units) => {
                print_list(&units, "No work units found.", format);
                ExitCode::Success
            }
            Err(e) => output_error(&e, format),
        },
        WorkunitCommands::Orphans(args) => handle_orphans(engine, &args, format),
    }
}

fn handle_orphans(engine: &Engine, args: &OrphansArgs, format: OutputFormat) -> ExitCode {
    let lifecycle = engine.lifecycle();
    let max_age = chrono::Duration::hours(i64::from(args.max_age_hours));
    let orphans = match lifecycle.list_orphans(max_age) {
        Ok(orphans) => orphans,
        Err(e) => return output_error(&e, format),
    };
    if !args.reclaim {
        print_list(&orphans, "No orphaned work units.", format);
        return ExitCode::Success;
    }

    let mut reclaimed: Vec<Reclaimed> = Vec::new();
    let mut first_error = None;
    for orphan in &orphans {
        match lifecycle.reclaim_orphan(&orphan.branch_name, max_age) {
            Ok(done) => reclaimed.push(done),
            Err(e) => {
                tracing::error!(branch = %orphan.branch_name, error = %e, "reclaim failed");
                first_error.get_or_insert(e);
            }
        }
    }
    match format {
        OutputFormat::Table => {
            if reclaimed.is_empty() {
                println!("No orphans reclaimed.");
            }
            for done in &reclaimed {
                let note = if done.had_unpublished_work {
                    " (had unpublished work)"
                } else {
                    ""
                };
                println!("Reclaimed {}{note}", done.work_unit.branch_name);
            }
        }
        _ => print_structured(&reclaimed, format, "reclaimed orphans"),
    }
    match first_error {
        Some(e) => output_error(&e, format),
        None => ExitCode::Success,
    }
}

fn print_dispatch(report: &DispatchReport, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            println!("Work unit: {}", report.work_unit);
            println!("Event:     {}", report.event_kind);
            if report.matched_rules.is_empty() {
                println!("Rules:     (none matched)");
            } else {
                println!("Rules:     {}", report.matched_rules.join(", "));
            }
            for (index, group) in report.groups.iter().enumerate() {
                println!("Group {}:   {}", index + 1, group.join(", "));
            }
            if !report.results.is_empty() {
                print_rows(&report.results, "");
            }
            if report.cancelled {
                println!("Round cancelled.");
            }
            println!("Verdict:   {}", report.verdict);
        }
        _ => print_structured(report, format, "dispatch report"),
    }
}

fn handle_dispatch(engine: &Engine, args: &DispatchArgs, format: OutputFormat) -> ExitCode {
    let event = match Event::from_file(&args.event_file) {
        Ok(event) => event,
        Err(e) => return output_error(&e, format),
    };
    let cancel = CancelToken::new();
    if let Err(e) = signal_hook::flag::register(SIGINT, cancel.flag()) {
        tracing::warn!(error = %e, "could not install SIGINT handler; the round cannot be cancelled");
    }

    match engine.dispatch(&event, args.work_unit.as_deref(), &cancel) {
        Ok(report) => {
            print_dispatch(&report, format);
            if report.verdict == Verdict::Blocked {
                ExitCode::Blocked
            } else {
                ExitCode::Success
            }
        }
        Err(e) => output_error(&e, format),
    }
}

fn print_step(remote_id: &str, work_unit: &str, outcome: &StepOutcome) {
    let text = match outcome {
        StepOutcome::Waiting { missing } if missing.is_empty() => {
            "waiting (no required roles configured)".to_string()
        }
        StepOutcome::Waiting { missing } => format!("waiting for {}", missing.join(", ")),
        StepOutcome::AwaitingRepublish => "awaiting re-publish".to_string(),
        StepOutcome::ChangesRequested { by } => format!("changes requested by {by}"),
        StepOutcome::MergeConflict => "merge conflict; work resumed".to_string(),
        StepOutcome::Finalized { outcome } => format!("closed as {outcome}"),
        StepOutcome::Busy => "busy; retried next pass".to_string(),
        StepOutcome::Skipped { reason } => format!("skipped ({reason})"),
        StepOutcome::NeedsOperator { reason } => format!("needs operator: {reason}"),
    };
    println!("{remote_id} ({work_unit}): {text}");
}

fn print_poll(report: &PollReport, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            for branch in &report.reconciled {
                println!("{branch}: teardown completed");
            }
            for step in &report.steps {
                match (&step.outcome, &step.error) {
                    (Some(outcome), _) => print_step(&step.remote_id, &step.work_unit, outcome),
                    (None, Some(e)) => println!("{} ({}): error: {e}", step.remote_id, step.work_unit),
                    (None, None) => {}
                }
            }
        }
        _ => print_structured(report, format, "watch report"),
    }
}

fn handle_watch(engine: &Engine, args: &WatchArgs, format: OutputFormat) -> ExitCode {
    let stop = Arc::new(AtomicBool::new(false));
    if !args.once {
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&stop)) {
            tracing::warn!(error = %e, "could not install SIGINT handler");
        }
    }
    let interval = Duration::from_secs(
        args.interval
            .unwrap_or(engine.config().watcher.poll_interval_secs)
            .max(1),
    );
    tracing::info!(host = engine.host_name(), interval_secs = interval.as_secs(), once = args.once, "watching publications");

    loop {
        match engine.watcher().poll() {
            Ok(report) => {
                print_poll(&report, format);
                if args.once {
                    return report
                        .steps
                        .iter()
                        .find_map(|s| s.error.as_ref())
                        .map_or(ExitCode::Success, ExitCode::from);
                }
            }
            Err(e) if args.once => return output_error(&e, format),
            Err(e) => tracing::error!(error = %e, "watch pass failed"),
        }

        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if stop.load(Ordering::SeqCst) {
                tracing::info!("interrupted; watcher stopped after the current pass");
                return ExitCode::Success;
            }
            std::thread::sleep(Duration::from_millis(200).min(deadline.saturating_duration_since(Instant::now())));
        }
        if stop.load(Ordering::SeqCst) {
            return ExitCode::Success;
        }
    }
}

fn handle_teardown(engine: &Engine, args: &TeardownArgs, format: OutputFormat) -> ExitCode {
    match engine.lifecycle().teardown(&args.name, args.force) {
        Ok(outcome) => {
            match format {
                OutputFormat::Table => println!("{}: {outcome:?}", args.name),
                _ => print_structured(
                    &serde_json::json!({"work_unit": args.name, "outcome": outcome}),
                    format,
                    "teardown",
                ),
            }
            ExitCode::Success
        }
        Err(e) => output_error(&e, format),
    }
}

fn handle_review(engine: &Engine, args: ReviewArgs, format: OutputFormat) -> ExitCode {
    let decision = match args.decision {
        DecisionArg::Approve => ReviewDecision::Approve,
        DecisionArg::RequestChanges => ReviewDecision::RequestChanges,
        DecisionArg::Block => ReviewDecision::Block,
    };
    let update = ExternalUpdate::Verdict {
        reviewer_id: args.reviewer,
        decision,
        comments: args.comment,
    };
    match engine.watcher().on_external_event(&args.remote_id, update) {
        Ok(outcome) => {
            match format {
                OutputFormat::Table => {
                    let work_unit = engine
                        .watcher()
                        .publication(&args.remote_id)
                        .map(|r| r.work_unit)
                        .unwrap_or_default();
                    print_step(&args.remote_id, &work_unit, &outcome);
                }
                _ => print_structured(&outcome, format, "review outcome"),
            }
            ExitCode::Success
        }
        Err(e) => output_error(&e, format),
    }
}

fn print_publication(record: &PublicationRecord, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            println!("Remote ID:  {}", record.remote_id);
            println!("Work unit:  {}", record.work_unit);
            println!("Cycle:      {}", record.cycle);
            println!("Outcome:    {}", record.merge_outcome);
            println!("Opened:     {}", record.opened_at);
            if let Some(at) = record.closed_at {
                println!("Closed:     {at}");
            }
            if let Some(intent) = &record.merge_intent {
                println!("Merge requested: {} (cycle {})", intent.requested_at, intent.cycle);
            }
            if let Some(failure) = &record.failure {
                println!("Failure:    {failure}");
            }
            if record.awaiting_republish {
                println!("Awaiting re-publish");
            }
            if record.archived {
                println!("Archived");
            }
            if !record.review_verdicts.is_empty() {
                let mut table = create_table(&["CYCLE", "REVIEWER", "DECISION", "COMMENTS"]);
                for verdict in &record.review_verdicts {
                    table.add_row(vec![
                        verdict.cycle.to_string(),
                        verdict.reviewer_id.clone(),
                        verdict.decision.to_string(),
                        verdict.comments.clone(),
                    ]);
                }
                println!("{table}");
            }
        }
        _ => print_structured(record, format, "publication"),
    }
}

fn handle_publication(engine: &Engine, cmd: PublicationCommands, format: OutputFormat) -> ExitCode {
    let watcher = engine.watcher();
    let result = match cmd {
        PublicationCommands::List => {
            return match watcher.publications() {
                Ok(records) => {
                    print_list(&records, "No publications found.", format);
                    ExitCode::Success
                }
                Err(e) => output_error(&e, format),
            };
        }
        PublicationCommands::Show(args) => watcher.publication(&args.remote_id),
        PublicationCommands::Archive(args) => watcher.archive(&args.remote_id),
        PublicationCommands::Resolve(args) => watcher.resolve(&args.remote_id),
    };
    match result {
        Ok(record) => {
            print_publication(&record, format);
            ExitCode::Success
        }
        Err(e) => output_error(&e, format),
    }
}

fn print_rules(info: &RulesInfo, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            match &info.source {
                Some(path) => println!("Source: {}", path.display()),
                None => println!("Source: (none)"),
            }
            if info.rules.is_empty() {
                println!("No rules loaded.");
                return;
            }
            let mut table = create_table(&["RULE", "PRIORITY", "PREDICATE", "HANDLERS", "CONCURRENCY"]);
            for (label, rule) in info.rules.by_priority() {
                table.add_row(vec![
                    label,
                    rule.priority.to_string(),
                    serde_json::to_string(&rule.predicate).unwrap_or_default(),
                    rule.handlers.join(", "),
                    serde_json::to_string(&rule.concurrency).unwrap_or_default(),
                ]);
            }
            println!("{table}");
        }
        _ => print_structured(info, format, "rules"),
    }
}

fn handle_rules(engine: &mut Engine, cmd: RulesCommands, format: OutputFormat) -> ExitCode {
    match cmd {
        RulesCommands::Check(args) => {
            let path = args.path.unwrap_or_else(|| engine.config().rules_path());
            match engine.check_rules(&path) {
                Ok(rules) => {
                    print_rules(
                        &RulesInfo {
                            source: Some(path),
                            rules,
                        },
                        format,
                    );
                    ExitCode::Success
                }
                Err(e) => output_error(&e, format),
            }
        }
        RulesCommands::Reload => match engine.reload_rules() {
            Ok(info) => {
                print_rules(&info, format);
                ExitCode::Success
            }
            Err(e) => output_error(&e, format),
        },
        RulesCommands::Show => {
            print_rules(&engine.rules(), format);
            ExitCode::Success
        }
    }
}

fn handle_journal(engine: &Engine, args: &JournalArgs, format: OutputFormat) -> ExitCode {
    let filter = JournalFilter {
        subject: args.subject.clone(),
        limit: args.limit,
    };
    match engine.journal_entries(&filter) {
        Ok(entries) => {
            print_list(&entries, "No journal entries.", format);
            ExitCode::Success
        }
        Err(e) => output_error(&e, format),
    }
}
