//! CLI output formatting (table, JSON, YAML).
//!
//! Structured formats wrap data in a [`CliResponse`] envelope; errors carry
//! the taxonomy kind and the offending work unit or publication id.

use crate::core::error::{ExitCode, ForemanError};
use crate::core::publication::PublicationRecord;
use crate::core::verification::TaskResult;
use crate::core::workunit::WorkUnit;
use crate::storage::journal::JournalEntry;
use comfy_table::{Cell, Table};
use serde::Serialize;
use std::collections::BTreeMap;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-readable JSON format.
    Json,
    /// YAML output format.
    Yaml,
}

/// Structured CLI response.
#[derive(Debug, Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutput>,
}

/// Structured error output.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub kind: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl From<&ForemanError> for ErrorOutput {
    fn from(err: &ForemanError) -> Self {
        Self {
            kind: err.kind.to_string(),
            code: err.code.clone(),
            message: err.message.clone(),
            subject: err.subject().map(str::to_string),
            hint: err.recovery_hint.clone(),
            context: err.context.clone(),
        }
    }
}

impl<T: Serialize> CliResponse<T> {
    /// Creates a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(err: &ForemanError) -> CliResponse<()> {
        CliResponse {
            success: false,
            data: None,
            error: Some(ErrorOutput::from(err)),
        }
    }
}

/// Outputs data in a structured format; `Table` falls back to pretty JSON.
pub fn output<T: Serialize>(data: T, format: OutputFormat) -> std::io::Result<()> {
    match format {
        OutputFormat::Json => {
            let response = CliResponse::success(data);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Table => {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        OutputFormat::Yaml => {
            let response = CliResponse::success(data);
            let yaml = serde_yaml::to_string(&response)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            print!("{yaml}");
        }
    }
    Ok(())
}

/// Outputs an error in the specified format and maps it to an exit code.
pub fn output_error(err: &ForemanError, format: OutputFormat) -> ExitCode {
    match format {
        OutputFormat::Json => {
            let response = CliResponse::<()>::error(err);
            if let Ok(json) = serde_json::to_string_pretty(&response) {
                eprintln!("{json}");
            }
        }
        OutputFormat::Yaml => {
            let response = CliResponse::<()>::error(err);
            if let Ok(yaml) = serde_yaml::to_string(&response) {
                eprint!("{yaml}");
            }
        }
        OutputFormat::Table => {
            eprintln!("Error: {err}");
            if let Some(hint) = &err.recovery_hint {
                eprintln!("Hint: {hint}");
            }
        }
    }
    ExitCode::from(err)
}

/// Helper to create a table with headers.
#[must_use]
pub fn create_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_header(headers.iter().map(|h| Cell::new(*h)));
    table
}

/// Types that can be displayed as a table row.
pub trait TableRow {
    const HEADERS: &'static [&'static str];

    fn to_row(&self) -> Vec<String>;
}

/// Renders rows as a table, or a placeholder line when empty.
pub fn print_rows<T: TableRow>(rows: &[T], empty: &str) {
    if rows.is_empty() {
        println!("{empty}");
        return;
    }
    let mut table = create_table(T::HEADERS);
    for row in rows {
        table.add_row(row.to_row());
    }
    println!("{table}");
}

/// Table rendering for table format, structured output otherwise.
pub fn print_list<T: TableRow + Serialize>(rows: &[T], empty: &str, format: OutputFormat) {
    match format {
        OutputFormat::Table => print_rows(rows, empty),
        _ => {
            if let Err(err) = output(rows, format) {
                eprintln!("Failed to render output: {err}");
            }
        }
    }
}

impl TableRow for WorkUnit {
    const HEADERS: &'static [&'static str] = &["BRANCH", "STATE", "VERDICT", "PUBLICATION", "LAST ACTIVITY"];

    fn to_row(&self) -> Vec<String> {
        vec![
            self.branch_name.clone(),
            self.state.to_string(),
            self.last_verdict.map_or_else(|| "-".to_string(), |v| v.to_string()),
            self.publication.clone().unwrap_or_else(|| "-".to_string()),
            self.last_activity_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]
    }
}

impl TableRow for PublicationRecord {
    const HEADERS: &'static [&'static str] = &["REMOTE ID", "WORK UNIT", "CYCLE", "OUTCOME", "VERDICTS", "FLAGS"];

    fn to_row(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.failure.is_some() {
            flags.push("failure");
        }
        if self.merge_intent.is_some() {
            flags.push("merge-requested");
        }
        if self.awaiting_republish {
            flags.push("awaiting-republish");
        }
        if self.archived {
            flags.push("archived");
        }
        vec![
            self.remote_id.clone(),
            self.work_unit.clone(),
            self.cycle.to_string(),
            self.merge_outcome.to_string(),
            self.review_verdicts.len().to_string(),
            flags.join(","),
        ]
    }
}

impl TableRow for JournalEntry {
    const HEADERS: &'static [&'static str] = &["#", "TIME", "SUBJECT", "ACTION", "DETAIL"];

    fn to_row(&self) -> Vec<String> {
        let detail = self
            .detail
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        vec![
            self.sequence.to_string(),
            self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            self.subject.clone(),
            self.action.clone(),
            detail,
        ]
    }
}

impl TableRow for TaskResult {
    const HEADERS: &'static [&'static str] = &["HANDLER", "STATUS", "DURATION MS", "FINDINGS"];

    fn to_row(&self) -> Vec<String> {
        let findings = self
            .findings
            .iter()
            .map(|f| match &f.location {
                Some(location) => format!("{:?} {location}: {}", f.severity, f.message),
                None => format!("{:?}: {}", f.severity, f.message),
            })
            .collect::<Vec<_>>()
            .join("\n");
        vec![
            self.handler_id.clone(),
            format!("{:?}", self.status),
            self.duration_ms.to_string(),
            findings,
        ]
    }
}
