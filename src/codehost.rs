//! Shell wrapper over the code-host CLI (`gh`).
//!
//! Every call is time-bounded and error-swallowing: the code host is
//! eventually consistent with the store, so a failed listing or merge is
//! reported as an empty result or `false` and retried on the next manager
//! tick, never propagated.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

const GH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPr {
    pub number: i64,
    pub head_ref_name: String,
    pub url: String,
    pub title: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedPr {
    pub number: i64,
    pub head_ref_name: String,
    pub merged_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPr {
    pub number: i64,
    pub head_ref_name: String,
    pub closed_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedPr {
    pub number: i64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    fn flag(&self) -> &'static str {
        match self {
            Self::Squash => "--squash",
            Self::Merge => "--merge",
            Self::Rebase => "--rebase",
        }
    }
}

#[derive(Default)]
pub struct CodeHostGateway;

impl CodeHostGateway {
    pub fn new() -> Self {
        Self
    }

    /// Open PRs for the repository at `repo_dir`; `repo_slug` overrides the
    /// directory's origin when set.
    pub async fn list_open_prs(&self, repo_dir: &Path, repo_slug: Option<&str>) -> Vec<OpenPr> {
        let mut args = vec![
            "pr",
            "list",
            "--state",
            "open",
            "--json",
            "number,headRefName,url,title,createdAt",
        ];
        if let Some(slug) = repo_slug {
            args.extend(["--repo", slug]);
        }
        self.gh_json(repo_dir, &args).await.unwrap_or_default()
    }

    pub async fn list_merged_prs(
        &self,
        repo_dir: &Path,
        repo_slug: Option<&str>,
        limit: u32,
    ) -> Vec<MergedPr> {
        let limit = limit.to_string();
        let mut args = vec![
            "pr",
            "list",
            "--state",
            "merged",
            "--limit",
            &limit,
            "--json",
            "number,headRefName,mergedAt",
        ];
        if let Some(slug) = repo_slug {
            args.extend(["--repo", slug]);
        }
        self.gh_json(repo_dir, &args).await.unwrap_or_default()
    }

    pub async fn list_closed_prs(&self, repo_dir: &Path, limit: u32) -> Vec<ClosedPr> {
        let limit = limit.to_string();
        let args = [
            "pr",
            "list",
            "--state",
            "closed",
            "--limit",
            &limit,
            "--json",
            "number,headRefName,closedAt",
        ];
        self.gh_json(repo_dir, &args).await.unwrap_or_default()
    }

    /// Close a PR. Fails soft: a PR already closed (or gone) is not fatal.
    pub async fn close_pr(&self, repo_dir: &Path, number: i64) -> bool {
        let number = number.to_string();
        self.gh_status(repo_dir, &["pr", "close", &number]).await
    }

    /// Create a PR for `head` against `base`. When the host reports an
    /// existing PR for the branch, return that one instead.
    pub async fn create_pr(
        &self,
        repo_dir: &Path,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Option<CreatedPr> {
        let args = [
            "pr", "create", "--head", head, "--base", base, "--title", title, "--body", body,
        ];
        match self.gh_output(repo_dir, &args).await {
            Some(output) if output.status.success() => {
                let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let number = url.rsplit('/').next().and_then(|n| n.parse().ok())?;
                Some(CreatedPr { number, url })
            }
            Some(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("already exists") {
                    return self.view_pr(repo_dir, head).await;
                }
                tracing::warn!(head, %stderr, "gh pr create failed");
                None
            }
            None => None,
        }
    }

    pub async fn merge_pr(&self, repo_dir: &Path, number: i64, strategy: MergeStrategy) -> bool {
        let number = number.to_string();
        self.gh_status(repo_dir, &["pr", "merge", &number, strategy.flag()])
            .await
    }

    async fn view_pr(&self, repo_dir: &Path, branch: &str) -> Option<CreatedPr> {
        let args = ["pr", "view", branch, "--json", "number,url"];
        self.gh_json(repo_dir, &args).await
    }

    async fn gh_json<T: serde::de::DeserializeOwned>(
        &self,
        repo_dir: &Path,
        args: &[&str],
    ) -> Option<T> {
        let output = self.gh_output(repo_dir, args).await?;
        if !output.status.success() {
            tracing::warn!(
                args = ?args,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "gh call failed"
            );
            return None;
        }
        match serde_json::from_slice(&output.stdout) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(args = ?args, %err, "gh returned unparseable JSON");
                None
            }
        }
    }

    async fn gh_status(&self, repo_dir: &Path, args: &[&str]) -> bool {
        match self.gh_output(repo_dir, args).await {
            Some(output) => {
                if !output.status.success() {
                    tracing::warn!(
                        args = ?args,
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "gh call failed"
                    );
                }
                output.status.success()
            }
            None => false,
        }
    }

    async fn gh_output(&self, repo_dir: &Path, args: &[&str]) -> Option<std::process::Output> {
        let result = tokio::time::timeout(
            GH_TIMEOUT,
            Command::new("gh").args(args).current_dir(repo_dir).output(),
        )
        .await;
        match result {
            Ok(Ok(output)) => Some(output),
            Ok(Err(err)) => {
                tracing::warn!(%err, "failed to run gh");
                None
            }
            Err(_) => {
                tracing::warn!(args = ?args, "gh call timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_pr_parses_gh_json() {
        let json = r#"[{"number": 12, "headRefName": "agent/abc", "url":
            "https://github.com/acme/app/pull/12", "title": "Add login",
            "createdAt": "2026-07-01T10:00:00Z"}]"#;
        let prs: Vec<OpenPr> = serde_json::from_str(json).unwrap();
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].number, 12);
        assert_eq!(prs[0].head_ref_name, "agent/abc");
    }

    #[test]
    fn test_merged_pr_tolerates_null_timestamp() {
        let json = r#"[{"number": 3, "headRefName": "agent/x", "mergedAt": null}]"#;
        let prs: Vec<MergedPr> = serde_json::from_str(json).unwrap();
        assert_eq!(prs[0].merged_at, None);
    }

    #[test]
    fn test_merge_strategy_flags() {
        assert_eq!(MergeStrategy::Squash.flag(), "--squash");
        assert_eq!(MergeStrategy::Merge.flag(), "--merge");
        assert_eq!(MergeStrategy::Rebase.flag(), "--rebase");
    }
}
