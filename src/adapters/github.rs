//! Git worktrees plus GitHub pull requests through the `gh` CLI.
//!
//! Each work unit gets its own `git worktree` under the workspace root.
//! Publications are pull requests; the remote id is the PR number.

use crate::adapters::host::{
    HostError, HostResult, PublicationStatus, RemoteReview, RemoteState, VcsHost,
};
use crate::core::publication::ReviewDecision;
use crate::storage::state_store::encode_key;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Body prefix that turns a review into a hard block.
pub const BLOCK_MARKER: &str = "[block]";

/// Executables and remote used by [`GitHubHost`].
#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub git_bin: String,
    pub gh_bin: String,
    pub remote: String,
    /// `owner/name`; defaults to the repository `gh` infers from the checkout.
    pub repo: Option<String>,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            git_bin: "git".to_string(),
            gh_bin: "gh".to_string(),
            remote: "origin".to_string(),
            repo: None,
        }
    }
}

pub struct GitHubHost {
    repo_path: PathBuf,
    workspace_root: PathBuf,
    settings: GitHubSettings,
}

impl GitHubHost {
    /// Creates a host for the repository at `repo_path`.
    pub fn new(
        repo_path: PathBuf,
        workspace_root: PathBuf,
        settings: GitHubSettings,
    ) -> HostResult<Self> {
        let host = Self {
            repo_path,
            workspace_root,
            settings,
        };
        host.git(&host.repo_path, "open_repository", &["rev-parse", "--git-dir"])
            .map_err(|_| {
                HostError::command(
                    "open_repository",
                    format!("{} is not a git repository", host.repo_path.display()),
                )
            })?;
        Ok(host)
    }

    fn run(
        bin: &str,
        cwd: &Path,
        op: &'static str,
        args: &[&str],
    ) -> HostResult<std::process::Output> {
        tracing::debug!(bin, ?args, cwd = %cwd.display(), "running host command");
        Command::new(bin)
            .current_dir(cwd)
            .args(args)
            .output()
            .map_err(|e| HostError::io(op, e))
    }

    fn git(&self, cwd: &Path, op: &'static str, args: &[&str]) -> HostResult<String> {
        let output = Self::run(&self.settings.git_bin, cwd, op, args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HostError::command(op, stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn gh_output(&self, op: &'static str, args: &[&str]) -> HostResult<std::process::Output> {
        let mut full: Vec<&str> = args.to_vec();
        if let Some(repo) = &self.settings.repo {
            full.extend(["--repo", repo.as_str()]);
        }
        Self::run(&self.settings.gh_bin, &self.repo_path, op, &full)
    }

    fn gh(&self, op: &'static str, args: &[&str]) -> HostResult<String> {
        let output = self.gh_output(op, args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HostError::command(op, stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn workspace_path(&self, branch: &str) -> PathBuf {
        self.workspace_root.join(encode_key(branch))
    }

    fn existing_publication(&self, branch: &str) -> HostResult<Option<String>> {
        #[derive(Deserialize)]
        struct Listed {
            number: u64,
        }
        let raw = self.gh(
            "open_publication",
            &["pr", "list", "--head", branch, "--state", "open", "--json", "number"],
        )?;
        let listed: Vec<Listed> = serde_json::from_str(&raw)
            .map_err(|e| HostError::command("open_publication", e.to_string()))?;
        Ok(listed.first().map(|pr| pr.number.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct PrView {
    state: String,
    #[serde(default)]
    reviews: Vec<PrReview>,
}

#[derive(Debug, Deserialize)]
struct PrReview {
    author: Option<PrAuthor>,
    state: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct PrAuthor {
    login: String,
}

/// Maps `gh pr view --json state,reviews` output to a status snapshot.
///
/// `APPROVED` approves, `CHANGES_REQUESTED` requests changes, and any review
/// whose body starts with [`BLOCK_MARKER`] blocks. Plain comments are not
/// verdicts.
fn parse_status(raw: &str) -> HostResult<PublicationStatus> {
    let view: PrView = serde_json::from_str(raw)
        .map_err(|e| HostError::command("get_publication_status", e.to_string()))?;
    let state = match view.state.as_str() {
        "MERGED" => RemoteState::Merged,
        "CLOSED" => RemoteState::Closed,
        _ => RemoteState::Open,
    };
    let reviews = view
        .reviews
        .into_iter()
        .filter_map(|review| {
            let reviewer_id = review.author?.login;
            let decision = if review.body.trim_start().starts_with(BLOCK_MARKER) {
                ReviewDecision::Block
            } else {
                match review.state.as_str() {
                    "APPROVED" => ReviewDecision::Approve,
                    "CHANGES_REQUESTED" => ReviewDecision::RequestChanges,
                    _ => return None,
                }
            };
            Some(RemoteReview {
                reviewer_id,
                decision,
                comments: review.body,
            })
        })
        .collect();
    Ok(PublicationStatus { state, reviews })
}

impl VcsHost for GitHubHost {
    fn name(&self) -> &'static str {
        "github"
    }

    fn create_branch(&self, branch: &str, base_ref: &str) -> HostResult<()> {
        self.git(
            &self.repo_path,
            "create_branch",
            &["branch", "--no-track", branch, base_ref],
        )
        .map(|_| ())
    }

    fn create_workspace(&self, branch: &str) -> HostResult<PathBuf> {
        let path = self.workspace_path(branch);
        if path.exists() {
            return Err(HostError::command(
                "create_workspace",
                format!("{} already exists", path.display()),
            ));
        }
        std::fs::create_dir_all(&self.workspace_root)
            .map_err(|e| HostError::io("create_workspace", e))?;
        let path_str = path.to_str().ok_or_else(|| {
            HostError::command("create_workspace", "workspace path is not valid UTF-8")
        })?;
        self.git(
            &self.repo_path,
            "create_workspace",
            &["worktree", "add", path_str, branch],
        )?;
        Ok(path)
    }

    fn remove_workspace(&self, workspace: &Path) -> HostResult<()> {
        if workspace.exists() {
            let path_str = workspace.to_str().ok_or_else(|| {
                HostError::command("remove_workspace", "workspace path is not valid UTF-8")
            })?;
            self.git(
                &self.repo_path,
                "remove_workspace",
                &["worktree", "remove", "--force", path_str],
            )?;
        }
        self.git(&self.repo_path, "remove_workspace", &["worktree", "prune"])
            .map(|_| ())
    }

    fn delete_branch(&self, branch: &str) -> HostResult<()> {
        let local = Self::run(
            &self.settings.git_bin,
            &self.repo_path,
            "delete_branch",
            &["branch", "-D", branch],
        )?;
        if !local.status.success() {
            let stderr = String::from_utf8_lossy(&local.stderr);
            if !stderr.contains("not found") {
                return Err(HostError::command("delete_branch", stderr.trim().to_string()));
            }
        }
        Ok(())
    }

    fn delete_remote_branch(&self, branch: &str) -> HostResult<()> {
        let remote = Self::run(
            &self.settings.git_bin,
            &self.repo_path,
            "delete_remote_branch",
            &["push", &self.settings.remote, "--delete", branch],
        )?;
        if !remote.status.success() {
            let stderr = String::from_utf8_lossy(&remote.stderr);
            if !stderr.contains("remote ref does not exist") {
                return Err(HostError::command(
                    "delete_remote_branch",
                    stderr.trim().to_string(),
                ));
            }
        }
        Ok(())
    }

    fn commit(&self, workspace: &Path, message: &str) -> HostResult<Option<String>> {
        self.git(workspace, "commit", &["add", "-A"])?;
        let status = self.git(workspace, "commit", &["status", "--porcelain"])?;
        if status.is_empty() {
            return Ok(None);
        }
        self.git(workspace, "commit", &["commit", "-m", message])?;
        self.git(workspace, "commit", &["rev-parse", "HEAD"]).map(Some)
    }

    fn push(&self, workspace: &Path, branch: &str) -> HostResult<()> {
        self.git(
            workspace,
            "push",
            &["push", "-u", &self.settings.remote, branch],
        )
        .map(|_| ())
    }

    fn open_publication(&self, branch: &str, base_ref: &str, title: &str) -> HostResult<String> {
        if let Some(existing) = self.existing_publication(branch)? {
            return Ok(existing);
        }
        let url = self.gh(
            "open_publication",
            &[
                "pr", "create", "--head", branch, "--base", base_ref, "--title", title, "--body",
                "Opened by foreman.",
            ],
        )?;
        url.rsplit('/')
            .next()
            .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .map(ToString::to_string)
            .ok_or_else(|| {
                HostError::command("open_publication", format!("unexpected gh output: {url}"))
            })
    }

    fn get_publication_status(&self, remote_id: &str) -> HostResult<PublicationStatus> {
        let output = self.gh_output(
            "get_publication_status",
            &["pr", "view", remote_id, "--json", "state,reviews"],
        )?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Could not resolve") || stderr.contains("no pull requests found") {
                return Err(HostError::UnknownPublication(remote_id.to_string()));
            }
            return Err(HostError::command(
                "get_publication_status",
                stderr.trim().to_string(),
            ));
        }
        parse_status(&String::from_utf8_lossy(&output.stdout))
    }

    fn merge(&self, remote_id: &str) -> HostResult<()> {
        let output = self.gh_output("merge", &["pr", "merge", remote_id, "--merge"])?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("conflict") || lowered.contains("not mergeable") {
            return Err(HostError::MergeConflict {
                remote_id: remote_id.to_string(),
                message: stderr,
            });
        }
        Err(HostError::command("merge", stderr))
    }

    fn close_publication(&self, remote_id: &str, reason: &str) -> HostResult<()> {
        self.gh(
            "close_publication",
            &["pr", "close", remote_id, "--comment", reason],
        )
        .map(|_| ())
    }

    fn has_unpublished_work(&self, workspace: &Path, _branch: &str) -> HostResult<bool> {
        if !workspace.exists() {
            return Ok(false);
        }
        let status = self.git(workspace, "inspect_workspace", &["status", "--porcelain"])?;
        if !status.is_empty() {
            return Ok(true);
        }
        let local_only = self.git(
            workspace,
            "inspect_workspace",
            &["rev-list", "--count", "HEAD", "--not", "--remotes"],
        )?;
        Ok(local_only.parse::<u64>().unwrap_or(0) > 0)
    }

    fn diff_summary(&self, branch: &str, base_ref: &str) -> HostResult<String> {
        let range = format!("{base_ref}...{branch}");
        self.git(&self.repo_path, "diff_summary", &["diff", "--stat", &range])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git");
        assert!(out.status.success(), "git {args:?} failed");
    }

    fn init_git_repo(repo_dir: &Path) {
        std::fs::create_dir_all(repo_dir).expect("create repo dir");
        git(repo_dir, &["init"]);
        git(repo_dir, &["config", "user.name", "Foreman"]);
        git(repo_dir, &["config", "user.email", "foreman@example.com"]);
        std::fs::write(repo_dir.join("README.md"), "test\n").expect("write file");
        git(repo_dir, &["add", "."]);
        git(repo_dir, &["commit", "-m", "init"]);
        git(repo_dir, &["branch", "-M", "main"]);
    }

    #[test]
    fn parses_pr_view_reviews() {
        let raw = r#"{
            "state": "OPEN",
            "reviews": [
                {"author": {"login": "security"}, "state": "APPROVED", "body": ""},
                {"author": {"login": "docs"}, "state": "CHANGES_REQUESTED", "body": "missing docs"},
                {"author": {"login": "arch"}, "state": "COMMENTED", "body": "[block] wrong layer"},
                {"author": {"login": "bob"}, "state": "COMMENTED", "body": "nice"}
            ]
        }"#;
        let status = parse_status(raw).unwrap();
        assert_eq!(status.state, RemoteState::Open);
        let decisions: Vec<_> = status
            .reviews
            .iter()
            .map(|r| (r.reviewer_id.as_str(), r.decision))
            .collect();
        assert_eq!(
            decisions,
            [
                ("security", ReviewDecision::Approve),
                ("docs", ReviewDecision::RequestChanges),
                ("arch", ReviewDecision::Block),
            ]
        );
    }

    #[test]
    fn parses_terminal_remote_states() {
        assert_eq!(
            parse_status(r#"{"state":"MERGED"}"#).unwrap().state,
            RemoteState::Merged
        );
        assert_eq!(
            parse_status(r#"{"state":"CLOSED","reviews":[]}"#).unwrap().state,
            RemoteState::Closed
        );
        assert!(parse_status("not json").is_err());
    }

    #[test]
    fn rejects_non_repository() {
        let tmp = tempdir().expect("tempdir");
        let result = GitHubHost::new(
            tmp.path().join("missing"),
            tmp.path().join("ws"),
            GitHubSettings::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn worktree_lifecycle_against_real_repo() {
        let tmp = tempdir().expect("tempdir");
        let repo = tmp.path().join("repo");
        init_git_repo(&repo);
        let host = GitHubHost::new(repo, tmp.path().join("ws"), GitHubSettings::default())
            .expect("host");

        host.create_branch("feature/x", "main").expect("branch");
        let ws = host.create_workspace("feature/x").expect("workspace");
        assert!(ws.ends_with("feature%2Fx"));
        assert!(ws.join("README.md").exists());

        assert_eq!(host.commit(&ws, "nothing").expect("commit"), None);
        std::fs::write(ws.join("new.txt"), "hi\n").expect("write");
        assert!(host.has_unpublished_work(&ws, "feature/x").expect("inspect"));
        let head = host.commit(&ws, "add file").expect("commit");
        assert!(head.is_some());
        assert!(host.has_unpublished_work(&ws, "feature/x").expect("inspect"));

        let summary = host.diff_summary("feature/x", "main").expect("diff");
        assert!(summary.contains("new.txt"));

        host.remove_workspace(&ws).expect("remove");
        assert!(!ws.exists());
        host.remove_workspace(&ws).expect("remove twice");
    }
}
