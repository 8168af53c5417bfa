//! Per-agent git worktrees.
//!
//! Every agent gets a private working tree at `repos/<team_id>-<agent_id>`
//! tracking a dedicated `agent/<agent_id>` branch, so concurrent agents
//! never touch each other's checkouts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::db::DbHandle;

pub struct WorktreeManager {
    /// Directory under the workspace root where worktrees are created.
    worktrees_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(worktrees_dir: &Path) -> Self {
        Self {
            worktrees_dir: worktrees_dir.to_path_buf(),
        }
    }

    pub fn worktree_path(&self, team_id: i64, agent_id: &str) -> PathBuf {
        self.worktrees_dir.join(format!("{}-{}", team_id, agent_id))
    }

    /// Create a worktree for the agent on branch `agent/<agent_id>`. If the
    /// branch already exists (a previous agent with the same id, or a retry
    /// after a partial create), attach to it instead.
    pub async fn create(&self, agent_id: &str, team_id: i64, repo_path: &Path) -> Result<PathBuf> {
        let worktree_path = self.worktree_path(team_id, agent_id);
        let branch = format!("agent/{}", agent_id);

        let parent = self
            .worktrees_dir
            .parent()
            .unwrap_or(&self.worktrees_dir);
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create worktrees directory")?;
        tokio::fs::create_dir_all(&self.worktrees_dir)
            .await
            .context("Failed to create worktrees directory")?;

        let worktree_str = worktree_path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;

        let output = Command::new("git")
            .args(["worktree", "add", "-b", &branch, worktree_str])
            .current_dir(repo_path)
            .output()
            .await
            .context("Failed to run git worktree add")?;

        if output.status.success() {
            return Ok(worktree_path);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            let output = Command::new("git")
                .args(["worktree", "add", worktree_str, &branch])
                .current_dir(repo_path)
                .output()
                .await
                .context("Failed to run git worktree add on existing branch")?;
            if output.status.success() {
                return Ok(worktree_path);
            }
            anyhow::bail!(
                "Git worktree attach failed for {}: {}",
                branch,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        anyhow::bail!("Git worktree creation failed: {}", stderr.trim());
    }

    /// Best-effort removal. Failure is recorded in the event log but never
    /// surfaced: a leaked worktree directory is an operator cleanup, not a
    /// reason to wedge the scheduler.
    pub async fn remove(&self, db: &DbHandle, agent_id: &str, worktree_path: &Path) {
        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(worktree_path)
            .output()
            .await;

        let failure = match output {
            Ok(output) if output.status.success() => None,
            Ok(output) => Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            Err(err) => Some(err.to_string()),
        };

        if let Some(reason) = failure {
            tracing::warn!(
                agent_id,
                path = %worktree_path.display(),
                %reason,
                "worktree removal failed"
            );
            let agent_id = agent_id.to_string();
            let path = worktree_path.display().to_string();
            let result = db
                .call(move |store| {
                    store.create_log(
                        &agent_id,
                        None,
                        crate::events::WORKTREE_REMOVAL_FAILED,
                        None,
                        Some(&reason),
                        Some(&serde_json::json!({ "path": path })),
                    )
                })
                .await;
            if let Err(err) = result {
                tracing::warn!(%err, "failed to log worktree removal failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    #[test]
    fn test_worktree_path_layout() {
        let manager = WorktreeManager::new(Path::new("/work/repos"));
        assert_eq!(
            manager.worktree_path(3, "agent-abc"),
            PathBuf::from("/work/repos/3-agent-abc")
        );
    }

    #[tokio::test]
    async fn test_remove_missing_worktree_logs_event_and_returns() -> Result<()> {
        let db = DbHandle::new(Store::open_in_memory()?);
        let manager = WorktreeManager::new(Path::new("/nonexistent/repos"));

        manager
            .remove(&db, "agent-x", Path::new("/nonexistent/repos/1-agent-x"))
            .await;

        let events = db.call(|store| store.list_events(10)).await?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "WORKTREE_REMOVAL_FAILED");
        assert_eq!(events[0].agent_id, "agent-x");
        Ok(())
    }
}
