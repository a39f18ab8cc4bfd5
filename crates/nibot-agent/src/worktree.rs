//! Git worktree provisioning for isolated subagent workspaces.
//!
//! Each worktree lives under `<workspace>/.worktrees/<task_id>` on its own
//! `nibot/<task_id>` branch, so file-mutating work cannot touch the main
//! checkout.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
}

pub struct WorktreeManager {
    workspace: PathBuf,
}

impl WorktreeManager {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        WorktreeManager {
            workspace: workspace.into(),
        }
    }

    /// Create a worktree for `task_id`. The workspace must be a git
    /// repository.
    pub async fn create(&self, task_id: &str) -> Result<Worktree> {
        let worktrees_dir = self.workspace.join(".worktrees");
        std::fs::create_dir_all(&worktrees_dir)
            .with_context(|| format!("failed to create {}", worktrees_dir.display()))?;

        let branch = format!("nibot/{task_id}");
        let path = worktrees_dir.join(task_id);

        let output = Command::new("git")
            .arg("-C")
            .arg(&self.workspace)
            .args(["worktree", "add", "-b", &branch])
            .arg(&path)
            .output()
            .await
            .context("failed to run git")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree add failed: {}", stderr.trim());
        }

        debug!(task_id, branch = %branch, path = %path.display(), "created worktree");
        Ok(Worktree { path, branch })
    }

    /// Remove a task's worktree. The branch is kept so finished work stays
    /// recoverable.
    pub async fn remove(&self, task_id: &str) -> Result<()> {
        let path = self.workspace.join(".worktrees").join(task_id);
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.workspace)
            .args(["worktree", "remove", "--force"])
            .arg(&path)
            .output()
            .await
            .context("failed to run git")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(task_id, error = %stderr.trim(), "git worktree remove failed");
            bail!("git worktree remove failed: {}", stderr.trim());
        }
        Ok(())
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.workspace.join(".worktrees").join(task_id)
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
