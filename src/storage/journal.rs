//! Append-only audit journal.
//!
//! Every lifecycle transition, dispatch verdict, review verdict and
//! collaborator failure is recorded here. Entries are never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Errors that can occur in the journal.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Journal lock poisoned")]
    Poisoned,
    #[error("Journal sequence overflow")]
    Overflow,
}

impl From<JournalError> for crate::core::error::ForemanError {
    fn from(err: JournalError) -> Self {
        Self::system("journal_failed", err.to_string(), "storage:journal")
    }
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the journal, assigned on append.
    #[serde(default)]
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Work unit branch or publication remote id.
    pub subject: String,
    /// Short verb, e.g. `created`, `verdict`, `merged`.
    pub action: String,
    #[serde(default)]
    pub detail: BTreeMap<String, String>,
}

impl JournalEntry {
    #[must_use]
    pub fn new(subject: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            subject: subject.into(),
            action: action.into(),
            detail: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.detail.insert(key.into(), value.to_string());
        self
    }
}

/// Filter for reading the journal.
#[derive(Debug, Default, Clone)]
pub struct JournalFilter {
    pub subject: Option<String>,
    /// Keep only the most recent `limit` matching entries.
    pub limit: Option<usize>,
}

impl JournalFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            limit: None,
        }
    }

    #[must_use]
    pub fn matches(&self, entry: &JournalEntry) -> bool {
        self.subject.as_deref().map_or(true, |s| s == entry.subject)
    }

    fn apply(&self, entries: &[JournalEntry]) -> Vec<JournalEntry> {
        let mut out: Vec<JournalEntry> = entries.iter().filter(|e| self.matches(e)).cloned().collect();
        if let Some(limit) = self.limit {
            let skip = out.len().saturating_sub(limit);
            out.drain(..skip);
        }
        out
    }
}

/// Trait for journal backends.
pub trait Journal: Send + Sync {
    /// Appends an entry, returning its sequence number.
    fn append(&self, entry: JournalEntry) -> Result<u64>;

    fn read(&self, filter: &JournalFilter) -> Result<Vec<JournalEntry>>;
}

pub type SharedJournal = Arc<dyn Journal>;

/// In-memory journal for testing.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    entries: RwLock<Vec<JournalEntry>>,
}

impl InMemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for InMemoryJournal {
    fn append(&self, mut entry: JournalEntry) -> Result<u64> {
        let mut entries = self.entries.write().map_err(|_| JournalError::Poisoned)?;
        let sequence = sequence_for(entries.len())?;
        entry.sequence = sequence;
        entries.push(entry);
        Ok(sequence)
    }

    fn read(&self, filter: &JournalFilter) -> Result<Vec<JournalEntry>> {
        let entries = self.entries.read().map_err(|_| JournalError::Poisoned)?;
        Ok(filter.apply(&entries))
    }
}

/// File-based journal (append-only JSON lines).
///
/// Holds no cache: every append takes an exclusive `fs2` lock on the file and
/// numbers the entry from what is on disk, so several processes can share
/// one journal.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
}

impl FileJournal {
    /// Creates or opens a journal file.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let journal = Self { path };
        // Surfaces a corrupt journal at open rather than on first read.
        journal.read(&JournalFilter::all())?;
        Ok(journal)
    }

    #[must_use]
    pub const fn path(&self) -> &PathBuf {
        &self.path
    }

    fn handle(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?)
    }
}

fn parse_entries(file: &mut File) -> Result<Vec<JournalEntry>> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(JournalError::from))
        .collect()
}

fn sequence_for(len: usize) -> Result<u64> {
    u64::try_from(len).map_err(|_| JournalError::Overflow)
}

impl Journal for FileJournal {
    fn append(&self, mut entry: JournalEntry) -> Result<u64> {
        let mut file = self.handle()?;
        file.lock_exclusive()?;
        let result = (|| -> Result<u64> {
            let sequence = sequence_for(parse_entries(&mut file)?.len())?;
            entry.sequence = sequence;
            let json = serde_json::to_string(&entry)?;
            writeln!(file, "{json}")?;
            file.flush()?;
            Ok(sequence)
        })();
        let _ = FileExt::unlock(&file);
        result
    }

    fn read(&self, filter: &JournalFilter) -> Result<Vec<JournalEntry>> {
        let mut file = self.handle()?;
        file.lock_shared()?;
        let entries = parse_entries(&mut file);
        let _ = FileExt::unlock(&file);
        Ok(filter.apply(&entries?))
    }
}
