//! `StateStore` trait and implementations.
//!
//! One record per work unit (keyed by branch name) and one per publication
//! (keyed by remote id). Records survive restarts so the watcher can resume
//! any cycle from disk.

use crate::core::error::ForemanError;
use crate::core::publication::PublicationRecord;
use crate::core::workunit::WorkUnit;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Errors that can occur in the state store.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt record {}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("State store lock poisoned")]
    Poisoned,
}

impl From<StateStoreError> for ForemanError {
    fn from(err: StateStoreError) -> Self {
        let code = match err {
            StateStoreError::Io { .. } => "state_io_failed",
            StateStoreError::Serialization { .. } => "state_corrupt",
            StateStoreError::Poisoned => "state_poisoned",
        };
        Self::system(code, err.to_string(), "storage:state")
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;

/// Trait for state persistence backends.
pub trait StateStore: Send + Sync {
    fn load_work_unit(&self, branch: &str) -> Result<Option<WorkUnit>>;

    /// Inserts or replaces the record for `unit.branch_name`.
    fn save_work_unit(&self, unit: &WorkUnit) -> Result<()>;

    /// All work units, ordered by branch name.
    fn list_work_units(&self) -> Result<Vec<WorkUnit>>;

    fn load_publication(&self, remote_id: &str) -> Result<Option<PublicationRecord>>;

    fn save_publication(&self, record: &PublicationRecord) -> Result<()>;

    /// All publications, ordered by remote id.
    fn list_publications(&self) -> Result<Vec<PublicationRecord>>;
}

/// Thread-safe handle to any state store.
pub type SharedStateStore = Arc<dyn StateStore>;

/// In-memory state store for testing.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    work_units: RwLock<BTreeMap<String, WorkUnit>>,
    publications: RwLock<BTreeMap<String, PublicationRecord>>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn load_work_unit(&self, branch: &str) -> Result<Option<WorkUnit>> {
        let units = self.work_units.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(units.get(branch).cloned())
    }

    fn save_work_unit(&self, unit: &WorkUnit) -> Result<()> {
        let mut units = self.work_units.write().map_err(|_| StateStoreError::Poisoned)?;
        units.insert(unit.branch_name.clone(), unit.clone());
        Ok(())
    }

    fn list_work_units(&self) -> Result<Vec<WorkUnit>> {
        let units = self.work_units.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(units.values().cloned().collect())
    }

    fn load_publication(&self, remote_id: &str) -> Result<Option<PublicationRecord>> {
        let records = self.publications.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(records.get(remote_id).cloned())
    }

    fn save_publication(&self, record: &PublicationRecord) -> Result<()> {
        let mut records = self.publications.write().map_err(|_| StateStoreError::Poisoned)?;
        records.insert(record.remote_id.clone(), record.clone());
        Ok(())
    }

    fn list_publications(&self) -> Result<Vec<PublicationRecord>> {
        let records = self.publications.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }
}

/// File-based state store: one JSON document per record.
///
/// ```text
/// <root>/workunits/<encoded-branch>.json
/// <root>/publications/<encoded-remote-id>.json
/// ```
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written record.
#[derive(Debug)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: PathBuf) -> Result<Self> {
        for dir in [root.join("workunits"), root.join("publications")] {
            std::fs::create_dir_all(&dir).map_err(|source| StateStoreError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn work_unit_path(&self, branch: &str) -> PathBuf {
        self.root
            .join("workunits")
            .join(format!("{}.json", encode_key(branch)))
    }

    fn publication_path(&self, remote_id: &str) -> PathBuf {
        self.root
            .join("publications")
            .join(format!("{}.json", encode_key(remote_id)))
    }

    fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StateStoreError::Serialization {
                path: path.to_path_buf(),
                source,
            })
    }

    fn write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let json =
            serde_json::to_string_pretty(value).map_err(|source| StateStoreError::Serialization {
                path: path.to_path_buf(),
                source,
            })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| StateStoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| StateStoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn list<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        let entries = std::fs::read_dir(dir).map_err(|source| StateStoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(value) = Self::read(&path)? {
                out.push(value);
            }
        }
        Ok(out)
    }
}

impl StateStore for FileStateStore {
    fn load_work_unit(&self, branch: &str) -> Result<Option<WorkUnit>> {
        Self::read(&self.work_unit_path(branch))
    }

    fn save_work_unit(&self, unit: &WorkUnit) -> Result<()> {
        Self::write(&self.work_unit_path(&unit.branch_name), unit)
    }

    fn list_work_units(&self) -> Result<Vec<WorkUnit>> {
        let mut units: Vec<WorkUnit> = Self::list(&self.root.join("workunits"))?;
        units.sort_by(|a, b| a.branch_name.cmp(&b.branch_name));
        Ok(units)
    }

    fn load_publication(&self, remote_id: &str) -> Result<Option<PublicationRecord>> {
        Self::read(&self.publication_path(remote_id))
    }

    fn save_publication(&self, record: &PublicationRecord) -> Result<()> {
        Self::write(&self.publication_path(&record.remote_id), record)
    }

    fn list_publications(&self) -> Result<Vec<PublicationRecord>> {
        let mut records: Vec<PublicationRecord> = Self::list(&self.root.join("publications"))?;
        records.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        Ok(records)
    }
}

/// Encodes a key into a single file name component.
///
/// Branch names routinely contain `/`; `%` is escaped first so the
/// encoding stays reversible.
#[must_use]
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    out
}
