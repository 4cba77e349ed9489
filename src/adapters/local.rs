//! Directory-backed host with no remote.
//!
//! Workspaces are plain directories, commits are timestamps and
//! publications live in a JSON file next to the state store. Reviews arrive
//! through `foreman review`. Used for dry runs, demos and tests; failures can
//! be scripted one call at a time.
//!
//! A persisted host re-reads its file under an `fs2` lock on every call, so
//! the CLI, the watcher and tests can share one state file.

use crate::adapters::host::{
    HostError, HostResult, PublicationStatus, RemoteReview, RemoteState, VcsHost,
};
use crate::storage::state_store::encode_key;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalPublication {
    branch: String,
    base_ref: String,
    title: String,
    state: RemoteState,
    #[serde(default)]
    reviews: Vec<RemoteReview>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalState {
    next_id: u64,
    /// branch -> base ref
    branches: BTreeMap<String, String>,
    publications: BTreeMap<String, LocalPublication>,
    /// workspace path -> last commit time
    commits: BTreeMap<String, DateTime<Utc>>,
    /// branches that have been pushed at least once
    pushed: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug)]
pub struct LocalHost {
    workspace_root: PathBuf,
    state_path: Option<PathBuf>,
    state: Mutex<LocalState>,
    scripted: Mutex<BTreeMap<&'static str, String>>,
    calls: Mutex<Vec<String>>,
}

impl LocalHost {
    /// Host whose publications live only in memory.
    #[must_use]
    pub fn in_memory(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            state_path: None,
            state: Mutex::new(LocalState::default()),
            scripted: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Host persisted to `state_path`, loading it if present.
    pub fn open(workspace_root: PathBuf, state_path: PathBuf) -> HostResult<Self> {
        let state = read_state(&state_path, "open_local_host")?;
        Ok(Self {
            workspace_root,
            state_path: Some(state_path),
            state: Mutex::new(state),
            scripted: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Makes the next call of `op` fail with `message`.
    pub fn fail_next(&self, op: &'static str, message: impl Into<String>) {
        lock(&self.scripted).insert(op, message.into());
    }

    /// Sets the remote state of a publication, as if changed on the host.
    pub fn set_remote_state(&self, remote_id: &str, state: RemoteState) -> HostResult<()> {
        self.mutate(|s| {
            let publication = s
                .publications
                .get_mut(remote_id)
                .ok_or_else(|| HostError::UnknownPublication(remote_id.to_string()))?;
            publication.state = state;
            Ok(())
        })
    }

    /// Adds a review as if posted on the host.
    pub fn add_review(&self, remote_id: &str, review: RemoteReview) -> HostResult<()> {
        self.mutate(|s| {
            let publication = s
                .publications
                .get_mut(remote_id)
                .ok_or_else(|| HostError::UnknownPublication(remote_id.to_string()))?;
            publication.reviews.push(review);
            Ok(())
        })
    }

    #[cfg(test)]
    pub(crate) fn is_pushed(&self, branch: &str) -> bool {
        self.view("inspect_branch", |s| s.pushed.contains_key(branch))
            .unwrap_or(false)
    }

    /// Every mutating call made so far, as `op:subject`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, op: &'static str, subject: &str) -> HostResult<()> {
        lock(&self.calls).push(format!("{op}:{subject}"));
        match lock(&self.scripted).remove(op) {
            Some(message) if op == "merge" && message.contains("conflict") => {
                Err(HostError::MergeConflict {
                    remote_id: subject.to_string(),
                    message,
                })
            }
            Some(message) => Err(HostError::command(op, message)),
            None => Ok(()),
        }
    }

    /// Locks the state file and refreshes the in-memory copy from it.
    fn sync(
        &self,
        exclusive: bool,
        op: &'static str,
    ) -> HostResult<(MutexGuard<'_, LocalState>, Option<StateLock>)> {
        let mut state = lock(&self.state);
        let Some(path) = &self.state_path else {
            return Ok((state, None));
        };
        let guard = StateLock::acquire(path, exclusive, op)?;
        *state = read_state(path, op)?;
        Ok((state, Some(guard)))
    }

    fn view<T>(&self, op: &'static str, f: impl FnOnce(&LocalState) -> T) -> HostResult<T> {
        let (state, _guard) = self.sync(false, op)?;
        Ok(f(&state))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut LocalState) -> HostResult<T>) -> HostResult<T> {
        let (mut state, _guard) = self.sync(true, "save_local_host")?;
        let value = f(&mut state)?;
        if let Some(path) = &self.state_path {
            let json = serde_json::to_string_pretty(&*state)
                .map_err(|e| HostError::command("save_local_host", e.to_string()))?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json).map_err(|e| HostError::io("save_local_host", e))?;
            std::fs::rename(&tmp, path).map_err(|e| HostError::io("save_local_host", e))?;
        }
        Ok(value)
    }

    fn last_modified(dir: &Path) -> HostResult<Option<DateTime<Utc>>> {
        let mut newest: Option<DateTime<Utc>> = None;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current).map_err(|e| HostError::io("inspect_workspace", e))?;
            for entry in entries {
                let entry = entry.map_err(|e| HostError::io("inspect_workspace", e))?;
                let meta = entry.metadata().map_err(|e| HostError::io("inspect_workspace", e))?;
                if meta.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let modified: DateTime<Utc> = meta
                    .modified()
                    .map_err(|e| HostError::io("inspect_workspace", e))?
                    .into();
                newest = Some(newest.map_or(modified, |n| n.max(modified)));
            }
        }
        Ok(newest)
    }

    fn file_count(dir: &Path) -> usize {
        let mut count = 0;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&current) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    pending.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }
        count
    }
}

fn read_state(path: &Path, op: &'static str) -> HostResult<LocalState> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| HostError::command(op, e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LocalState::default()),
        Err(e) => Err(HostError::io(op, e)),
    }
}

/// Advisory lock on `<state>.lock`; released when dropped.
struct StateLock {
    file: File,
}

impl StateLock {
    fn acquire(state_path: &Path, exclusive: bool, op: &'static str) -> HostResult<Self> {
        if let Some(parent) = state_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HostError::io(op, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(state_path.with_extension("json.lock"))
            .map_err(|e| HostError::io(op, e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| HostError::io(op, e))?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl VcsHost for LocalHost {
    fn name(&self) -> &'static str {
        "local"
    }

    fn create_branch(&self, branch: &str, base_ref: &str) -> HostResult<()> {
        self.record("create_branch", branch)?;
        self.mutate(|s| {
            if s.branches.contains_key(branch) {
                return Err(HostError::command(
                    "create_branch",
                    format!("branch '{branch}' already exists"),
                ));
            }
            s.branches.insert(branch.to_string(), base_ref.to_string());
            Ok(())
        })
    }

    fn create_workspace(&self, branch: &str) -> HostResult<PathBuf> {
        self.record("create_workspace", branch)?;
        let path = self.workspace_root.join(encode_key(branch));
        if path.exists() {
            return Err(HostError::command(
                "create_workspace",
                format!("{} already exists", path.display()),
            ));
        }
        std::fs::create_dir_all(&path).map_err(|e| HostError::io("create_workspace", e))?;
        Ok(path)
    }

    fn remove_workspace(&self, workspace: &Path) -> HostResult<()> {
        self.record("remove_workspace", &workspace.display().to_string())?;
        if workspace.exists() {
            std::fs::remove_dir_all(workspace).map_err(|e| HostError::io("remove_workspace", e))?;
        }
        self.mutate(|s| {
            s.commits.remove(&workspace.display().to_string());
            Ok(())
        })
    }

    fn delete_branch(&self, branch: &str) -> HostResult<()> {
        self.record("delete_branch", branch)?;
        self.mutate(|s| {
            s.branches.remove(branch);
            Ok(())
        })
    }

    fn delete_remote_branch(&self, branch: &str) -> HostResult<()> {
        self.record("delete_remote_branch", branch)?;
        self.mutate(|s| {
            s.pushed.remove(branch);
            Ok(())
        })
    }

    fn commit(&self, workspace: &Path, _message: &str) -> HostResult<Option<String>> {
        self.record("commit", &workspace.display().to_string())?;
        let key = workspace.display().to_string();
        let newest = Self::last_modified(workspace)?;
        self.mutate(|s| {
            let previous = s.commits.get(&key).copied();
            let changed = match (newest, previous) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(newest), Some(previous)) => newest > previous,
            };
            if !changed {
                return Ok(None);
            }
            s.commits.insert(key.clone(), Utc::now());
            Ok(Some(uuid::Uuid::new_v4().simple().to_string()))
        })
    }

    fn push(&self, _workspace: &Path, branch: &str) -> HostResult<()> {
        self.record("push", branch)?;
        self.mutate(|s| {
            if !s.branches.contains_key(branch) {
                return Err(HostError::command("push", format!("unknown branch '{branch}'")));
            }
            s.pushed.insert(branch.to_string(), Utc::now());
            Ok(())
        })
    }

    fn open_publication(&self, branch: &str, base_ref: &str, title: &str) -> HostResult<String> {
        self.record("open_publication", branch)?;
        self.mutate(|s| {
            if let Some((id, _)) = s
                .publications
                .iter()
                .find(|(_, p)| p.branch == branch && p.state == RemoteState::Open)
            {
                return Ok(id.clone());
            }
            s.next_id += 1;
            let id = s.next_id.to_string();
            s.publications.insert(
                id.clone(),
                LocalPublication {
                    branch: branch.to_string(),
                    base_ref: base_ref.to_string(),
                    title: title.to_string(),
                    state: RemoteState::Open,
                    reviews: Vec::new(),
                },
            );
            Ok(id)
        })
    }

    fn get_publication_status(&self, remote_id: &str) -> HostResult<PublicationStatus> {
        if let Some(message) = lock(&self.scripted).remove("get_publication_status") {
            return Err(HostError::command("get_publication_status", message));
        }
        self.view("get_publication_status", |state| {
            state
                .publications
                .get(remote_id)
                .map(|publication| PublicationStatus {
                    state: publication.state,
                    reviews: publication.reviews.clone(),
                })
                .ok_or_else(|| HostError::UnknownPublication(remote_id.to_string()))
        })?
    }

    fn merge(&self, remote_id: &str) -> HostResult<()> {
        self.record("merge", remote_id)?;
        self.mutate(|s| {
            let publication = s
                .publications
                .get_mut(remote_id)
                .ok_or_else(|| HostError::UnknownPublication(remote_id.to_string()))?;
            match publication.state {
                RemoteState::Open | RemoteState::Merged => {
                    publication.state = RemoteState::Merged;
                    Ok(())
                }
                RemoteState::Closed => Err(HostError::command(
                    "merge",
                    format!("publication {remote_id} is closed"),
                )),
            }
        })
    }

    fn close_publication(&self, remote_id: &str, _reason: &str) -> HostResult<()> {
        self.record("close_publication", remote_id)?;
        self.mutate(|s| {
            let publication = s
                .publications
                .get_mut(remote_id)
                .ok_or_else(|| HostError::UnknownPublication(remote_id.to_string()))?;
            if publication.state == RemoteState::Open {
                publication.state = RemoteState::Closed;
            }
            Ok(())
        })
    }

    fn has_unpublished_work(&self, workspace: &Path, branch: &str) -> HostResult<bool> {
        if !workspace.exists() {
            return Ok(false);
        }
        let Some(newest) = Self::last_modified(workspace)? else {
            return Ok(false);
        };
        let (committed, pushed) = self.view("inspect_workspace", |state| {
            (
                state.commits.get(&workspace.display().to_string()).copied(),
                state.pushed.get(branch).copied(),
            )
        })?;
        Ok(match (committed, pushed) {
            (Some(committed), Some(pushed)) => newest > committed || committed > pushed,
            _ => true,
        })
    }

    fn diff_summary(&self, branch: &str, base_ref: &str) -> HostResult<String> {
        let path = self.workspace_root.join(encode_key(branch));
        Ok(format!(
            "{branch} vs {base_ref}: {} file(s) in workspace",
            Self::file_count(&path)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::publication::ReviewDecision;

    #[test]
    fn workspace_and_publication_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let host = LocalHost::in_memory(tmp.path().join("ws"));

        host.create_branch("feat/x", "main").unwrap();
        assert!(host.create_branch("feat/x", "main").is_err());
        let ws = host.create_workspace("feat/x").unwrap();
        assert!(ws.is_dir());
        assert!(!host.has_unpublished_work(&ws, "feat/x").unwrap());

        std::fs::write(ws.join("a.txt"), "a").unwrap();
        assert!(host.has_unpublished_work(&ws, "feat/x").unwrap());
        assert!(host.commit(&ws, "c1").unwrap().is_some());
        host.push(&ws, "feat/x").unwrap();
        assert!(!host.has_unpublished_work(&ws, "feat/x").unwrap());
        assert!(host.commit(&ws, "c2").unwrap().is_none());

        let id = host.open_publication("feat/x", "main", "feat/x").unwrap();
        assert_eq!(host.open_publication("feat/x", "main", "again").unwrap(), id);
        host.add_review(
            &id,
            RemoteReview {
                reviewer_id: "security".to_string(),
                decision: ReviewDecision::Approve,
                comments: String::new(),
            },
        )
        .unwrap();
        assert_eq!(host.get_publication_status(&id).unwrap().reviews.len(), 1);

        host.merge(&id).unwrap();
        assert_eq!(host.get_publication_status(&id).unwrap().state, RemoteState::Merged);

        host.remove_workspace(&ws).unwrap();
        host.remove_workspace(&ws).unwrap();
        assert!(!ws.exists());
    }

    #[test]
    fn scripted_failures_fire_once() {
        let tmp = tempfile::tempdir().unwrap();
        let host = LocalHost::in_memory(tmp.path().to_path_buf());
        host.create_branch("b", "main").unwrap();
        let id = host.open_publication("b", "main", "b").unwrap();

        host.fail_next("merge", "merge conflict in core/x");
        assert!(host.merge(&id).unwrap_err().is_merge_conflict());
        host.merge(&id).unwrap();

        host.fail_next("get_publication_status", "timeout");
        assert!(host.get_publication_status(&id).is_err());
        assert!(host.get_publication_status(&id).is_ok());
        assert!(host.calls().contains(&format!("merge:{id}")));
    }

    #[test]
    fn persisted_state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("host.json");
        let id = {
            let host = LocalHost::open(tmp.path().join("ws"), state.clone()).unwrap();
            host.create_branch("b", "main").unwrap();
            host.open_publication("b", "main", "b").unwrap()
        };
        let host = LocalHost::open(tmp.path().join("ws"), state).unwrap();
        assert_eq!(host.get_publication_status(&id).unwrap().state, RemoteState::Open);
        host.close_publication(&id, "stale").unwrap();
        assert_eq!(host.get_publication_status(&id).unwrap().state, RemoteState::Closed);
        assert!(host.merge(&id).is_err());
    }

    #[test]
    fn local_branch_delete_keeps_the_pushed_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let host = LocalHost::in_memory(tmp.path().to_path_buf());
        host.create_branch("b", "main").unwrap();
        let ws = host.create_workspace("b").unwrap();
        host.push(&ws, "b").unwrap();

        host.delete_branch("b").unwrap();
        assert!(host.is_pushed("b"));
        host.create_branch("b", "main").unwrap();

        host.delete_remote_branch("b").unwrap();
        assert!(!host.is_pushed("b"));
        host.delete_remote_branch("b").unwrap();
    }

    #[test]
    fn two_handles_on_one_state_file_see_each_other() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("host.json");
        let a = LocalHost::open(tmp.path().join("ws"), state.clone()).unwrap();
        let b = LocalHost::open(tmp.path().join("ws"), state.clone()).unwrap();

        b.create_branch("feat/b", "main").unwrap();
        let id = b.open_publication("feat/b", "main", "feat/b").unwrap();
        assert_eq!(id, "1");
        assert_eq!(a.get_publication_status(&id).unwrap().state, RemoteState::Open);

        a.create_branch("feat/a", "main").unwrap();
        assert_eq!(a.open_publication("feat/a", "main", "feat/a").unwrap(), "2");
        assert!(b.create_branch("feat/a", "main").is_err());

        let reopened = LocalHost::open(tmp.path().join("ws"), state).unwrap();
        assert_eq!(reopened.get_publication_status("1").unwrap().state, RemoteState::Open);
        assert_eq!(reopened.get_publication_status("2").unwrap().state, RemoteState::Open);
    }
}
