//! Per-worker git worktrees.
//!
//! Each worker owns one slot directory under the worktrees root and holds at
//! most one branch in it at a time. `acquire` recovers from earlier crashes
//! before checking out:
//!
//! 1. a leftover directory in the worker's own slot is force-removed;
//! 2. a checkout of the requested branch in another slot is removed, since a
//!    branch can only be checked out once;
//! 3. an existing branch is attached, otherwise it is created from the base ref.
//!
//! `release` drops the checkout but keeps the branch and its commits.
//! `reconcile` prunes stale worktree metadata and any slot directory that no
//! live worker holds.

use crate::config::WorkspaceConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Git worktree failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("git {command} failed after {attempts} attempt(s): {stderr}")]
    Git {
        command: String,
        stderr: String,
        attempts: u32,
    },

    #[error("invalid branch name '{0}'")]
    InvalidBranch(String),

    #[error("invalid worker id '{0}'")]
    InvalidWorker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorkspaceResult<T> = std::result::Result<T, WorkspaceError>;

/// An active checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub worker_id: String,
    pub branch: String,
    pub path: PathBuf,
}

pub struct WorkspaceManager {
    repo: PathBuf,
    root: PathBuf,
    base_ref: String,
    attempts: u32,
    slots: Mutex<HashMap<String, Workspace>>,
    /// Serializes worktree mutations; concurrent `git worktree` calls
    /// contend on the repository's lock files.
    git_lock: Mutex<()>,
}

fn validate_branch(branch: &str) -> WorkspaceResult<()> {
    let bad = branch.is_empty()
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("@{")
        || branch
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if bad {
        return Err(WorkspaceError::InvalidBranch(branch.to_string()));
    }
    Ok(())
}

/// Directory name for a worker's slot.
fn slot_name(worker_id: &str) -> WorkspaceResult<String> {
    let name: String = worker_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        return Err(WorkspaceError::InvalidWorker(worker_id.to_string()));
    }
    Ok(name)
}

/// Parse `git worktree list --porcelain` into (path, branch) pairs.
fn parse_worktree_list(output: &str) -> Vec<(PathBuf, Option<String>)> {
    let mut entries = Vec::new();
    let mut current: Option<(PathBuf, Option<String>)> = None;
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some((PathBuf::from(path), None));
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some((_, b)) = current.as_mut() {
                *b = Some(branch.trim_start_matches("refs/heads/").to_string());
            }
        }
    }
    entries.extend(current);
    entries
}

impl WorkspaceManager {
    /// Create a manager for `config.repo`. Returns `Ok(None)` when no repo is
    /// configured.
    pub fn from_config(config: &WorkspaceConfig) -> WorkspaceResult<Option<Self>> {
        match &config.repo {
            Some(repo) => Self::new(repo, &config.worktrees_dir, &config.base_ref, config.git_attempts)
                .map(Some),
            None => Ok(None),
        }
    }

    pub fn new(
        repo: impl AsRef<Path>,
        worktrees_dir: impl AsRef<Path>,
        base_ref: &str,
        attempts: u32,
    ) -> WorkspaceResult<Self> {
        let repo = repo.as_ref().canonicalize()?;
        let root = if worktrees_dir.as_ref().is_absolute() {
            worktrees_dir.as_ref().to_path_buf()
        } else {
            repo.join(worktrees_dir)
        };
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;

        Ok(Self {
            repo,
            root,
            base_ref: base_ref.to_string(),
            attempts: attempts.max(1),
            slots: Mutex::new(HashMap::new()),
            git_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git_once(&self, args: &[&str]) -> WorkspaceResult<std::process::Output> {
        Ok(Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?)
    }

    /// Run git, retrying with exponential backoff.
    async fn git(&self, args: &[&str]) -> WorkspaceResult<String> {
        let mut delay = Duration::from_millis(100);
        let mut stderr = String::new();
        for attempt in 1..=self.attempts {
            let output = self.git_once(args).await?;
            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
            }
            stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if attempt < self.attempts {
                debug!(args = ?args, attempt, stderr = %stderr, "git failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(WorkspaceError::Git {
            command: args.join(" "),
            stderr,
            attempts: self.attempts,
        })
    }

    async fn branch_exists(&self, branch: &str) -> WorkspaceResult<bool> {
        let reference = format!("refs/heads/{}", branch);
        let output = self
            .git_once(&["rev-parse", "--verify", "--quiet", reference.as_str()])
            .await?;
        Ok(output.status.success())
    }

    async fn worktrees(&self) -> WorkspaceResult<Vec<(PathBuf, Option<String>)>> {
        let listing = self.git(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&listing))
    }

    /// Remove a checkout directory and its worktree metadata.
    async fn remove_checkout(&self, path: &Path) -> WorkspaceResult<()> {
        let path_str = path.to_string_lossy().into_owned();
        let removed = self
            .git_once(&["worktree", "remove", "--force", path_str.as_str()])
            .await?;
        if !removed.status.success() {
            debug!(path = %path.display(), "git worktree remove failed, deleting directory");
        }
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        self.git(&["worktree", "prune"]).await?;
        Ok(())
    }

    /// Check out `branch` into the worker's slot.
    pub async fn acquire(&self, worker_id: &str, branch: &str) -> WorkspaceResult<PathBuf> {
        validate_branch(branch)?;
        let path = self.root.join(slot_name(worker_id)?);

        let _git = self.git_lock.lock().await;
        let mut slots = self.slots.lock().await;

        // A slot never holds two branches.
        if slots.remove(worker_id).is_some() || path.exists() {
            warn!(worker_id, path = %path.display(), "Clearing leftover checkout in slot");
            self.remove_checkout(&path).await?;
        }

        for (other, checked_out) in self.worktrees().await? {
            if checked_out.as_deref() == Some(branch) && other != path && other != self.repo {
                warn!(
                    worker_id,
                    branch,
                    stale = %other.display(),
                    "Branch is checked out in another slot, removing it"
                );
                self.remove_checkout(&other).await?;
                slots.retain(|_, ws| ws.branch != branch);
            }
        }

        let path_str = path.to_string_lossy().into_owned();
        if self.branch_exists(branch).await? {
            self.git(&["worktree", "add", path_str.as_str(), branch]).await?;
            info!(worker_id, branch, path = %path.display(), "Attached existing branch");
        } else {
            self.git(&["worktree", "add", "-b", branch, path_str.as_str(), self.base_ref.as_str()])
                .await?;
            info!(worker_id, branch, path = %path.display(), "Created branch");
        }

        slots.insert(
            worker_id.to_string(),
            Workspace {
                worker_id: worker_id.to_string(),
                branch: branch.to_string(),
                path: path.clone(),
            },
        );
        Ok(path)
    }

    /// Remove the worker's checkout, keeping its branch.
    pub async fn release(&self, worker_id: &str) -> WorkspaceResult<()> {
        let _git = self.git_lock.lock().await;
        let Some(workspace) = self.slots.lock().await.remove(worker_id) else {
            debug!(worker_id, "No workspace to release");
            return Ok(());
        };
        self.remove_checkout(&workspace.path).await?;
        info!(worker_id, branch = %workspace.branch, "Workspace released");
        Ok(())
    }

    /// Release every active workspace, continuing past failures.
    pub async fn release_all(&self) -> usize {
        let workers: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        let mut released = 0;
        for worker_id in workers {
            match self.release(&worker_id).await {
                Ok(()) => released += 1,
                Err(e) => warn!(worker_id, error = %e, "Failed to release workspace"),
            }
        }
        released
    }

    /// Prune stale metadata and remove slot directories no live worker holds.
    /// Returns the removed directories.
    pub async fn reconcile(&self) -> WorkspaceResult<Vec<PathBuf>> {
        let _git = self.git_lock.lock().await;
        self.git(&["worktree", "prune"]).await?;

        let live: Vec<PathBuf> = self
            .slots
            .lock()
            .await
            .values()
            .map(|ws| ws.path.clone())
            .collect();

        let mut removed = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() || live.contains(&path) {
                continue;
            }
            self.remove_checkout(&path).await?;
            removed.push(path);
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "Removed orphaned workspaces");
        }
        Ok(removed)
    }

    /// Active workspace of a worker.
    pub async fn get(&self, worker_id: &str) -> Option<Workspace> {
        self.slots.lock().await.get(worker_id).cloned()
    }
}
