use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::GitHubError;
use crate::rate_limit::RateLimiter;

const GH_TIMEOUT_SECS: u64 = 60;

/// Thin adapter over the authenticated `gh` CLI. Every call passes the
/// process-global rate limiter first; rate-limit language in stderr is
/// surfaced as the typed error.
pub struct GhClient {
    repo: String,
    project_dir: PathBuf,
    limiter: Arc<RateLimiter>,
}

impl GhClient {
    pub fn new(repo: impl Into<String>, project_dir: PathBuf, limiter: Arc<RateLimiter>) -> Self {
        Self {
            repo: repo.into(),
            project_dir,
            limiter,
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    async fn run(&self, args: &[&str]) -> Result<String, GitHubError> {
        self.limiter.acquire_github().await?;
        let label = args.join(" ");
        debug!(command = %label, "gh");

        let mut cmd = Command::new("gh");
        cmd.args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(GH_TIMEOUT_SECS), cmd.output())
            .await
            .map_err(|_| GitHubError::Timeout {
                command: label.clone(),
                timeout_secs: GH_TIMEOUT_SECS,
            })??;

        if !output.status.success() {
            return Err(GitHubError::from_gh_failure(
                label,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json(&self, args: &[&str]) -> Result<Value, GitHubError> {
        let out = self.run(args).await?;
        serde_json::from_str(&out).map_err(|e| GitHubError::Parse(e.to_string()))
    }

    /// PR metadata with the fields the context gatherer needs.
    pub async fn pr_view(&self, pr_number: u64) -> Result<Value, GitHubError> {
        let number = pr_number.to_string();
        self.run_json(&[
            "pr",
            "view",
            &number,
            "--repo",
            &self.repo,
            "--json",
            "number,title,body,author,headRefName,baseRefName,headRefOid,baseRefOid,\
             additions,deletions,mergeable,mergeStateStatus,statusCheckRollup,comments",
        ])
        .await
    }

    pub async fn pr_diff(&self, pr_number: u64) -> Result<String, GitHubError> {
        let number = pr_number.to_string();
        self.run(&["pr", "diff", &number, "--repo", &self.repo]).await
    }

    /// PR-scoped files endpoint: excludes files pulled in from merge
    /// commits, and carries each file's blob SHA.
    pub async fn pr_files(&self, pr_number: u64) -> Result<Vec<Value>, GitHubError> {
        let path = format!("repos/{}/pulls/{pr_number}/files", self.repo);
        let value = self.run_json(&["api", &path, "--paginate"]).await?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| GitHubError::Parse("files endpoint did not return an array".into()))
    }

    pub async fn pr_commits(&self, pr_number: u64) -> Result<Vec<Value>, GitHubError> {
        let path = format!("repos/{}/pulls/{pr_number}/commits", self.repo);
        let value = self.run_json(&["api", &path, "--paginate"]).await?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| GitHubError::Parse("commits endpoint did not return an array".into()))
    }

    /// `compare/<base>...<head>` fallback used when PR-scoped endpoints
    /// are insufficient.
    pub async fn compare(&self, base: &str, head: &str) -> Result<Value, GitHubError> {
        let path = format!("repos/{}/compare/{base}...{head}", self.repo);
        self.run_json(&["api", &path]).await
    }

    pub async fn file_content_at(&self, rev: &str, path: &str) -> Result<String, GitHubError> {
        let api_path = format!("repos/{}/contents/{path}?ref={rev}", self.repo);
        let value = self
            .run_json(&["api", &api_path, "--jq", ".content"])
            .await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| GitHubError::Parse("contents endpoint missing content".into()))?;
        decode_base64_content(encoded)
            .ok_or_else(|| GitHubError::Parse("contents endpoint returned invalid base64".into()))
    }

    pub async fn post_pr_review(
        &self,
        pr_number: u64,
        body: &str,
        approve: Option<bool>,
    ) -> Result<(), GitHubError> {
        let number = pr_number.to_string();
        let mut args = vec!["pr", "review", &number, "--repo", &self.repo, "--body", body];
        match approve {
            Some(true) => args.push("--approve"),
            Some(false) => args.push("--request-changes"),
            None => args.push("--comment"),
        }
        self.run(&args).await.map(|_| ())
    }

    pub async fn list_open_prs(&self, limit: u32) -> Result<Vec<Value>, GitHubError> {
        let limit = limit.to_string();
        let value = self
            .run_json(&[
                "pr", "list", "--repo", &self.repo, "--state", "open", "--limit", &limit,
                "--json", "number,title,author,headRefOid",
            ])
            .await?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| GitHubError::Parse("pr list did not return an array".into()))
    }

    pub async fn issue_view(&self, issue_number: u64) -> Result<Value, GitHubError> {
        let number = issue_number.to_string();
        self.run_json(&[
            "issue", "view", &number, "--repo", &self.repo, "--json",
            "number,title,body,author,labels,createdAt",
        ])
        .await
    }

    pub async fn list_open_issues(&self, limit: u32) -> Result<Vec<Value>, GitHubError> {
        let limit = limit.to_string();
        let value = self
            .run_json(&[
                "issue", "list", "--repo", &self.repo, "--state", "open", "--limit", &limit,
                "--json", "number,title,labels",
            ])
            .await?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| GitHubError::Parse("issue list did not return an array".into()))
    }

    pub async fn post_issue_comment(
        &self,
        issue_number: u64,
        body: &str,
    ) -> Result<(), GitHubError> {
        let number = issue_number.to_string();
        self.run(&[
            "issue", "comment", &number, "--repo", &self.repo, "--body", body,
        ])
        .await
        .map(|_| ())
    }

    pub async fn add_issue_labels(
        &self,
        issue_number: u64,
        labels: &[String],
    ) -> Result<(), GitHubError> {
        if labels.is_empty() {
            return Ok(());
        }
        let number = issue_number.to_string();
        let joined = labels.join(",");
        self.run(&[
            "issue", "edit", &number, "--repo", &self.repo, "--add-label", &joined,
        ])
        .await
        .map(|_| ())
    }

    /// Approve workflow runs awaiting maintainer approval (fork PRs).
    pub async fn approve_workflow_run(&self, run_id: u64) -> Result<(), GitHubError> {
        let path = format!("repos/{}/actions/runs/{run_id}/approve", self.repo);
        self.run(&["api", "--method", "POST", &path]).await.map(|_| ())
    }

    pub async fn current_login(&self) -> Result<String, GitHubError> {
        let value = self.run_json(&["api", "user", "--jq", "{login: .login}"]).await?;
        value
            .get("login")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| GitHubError::Parse("user endpoint missing login".into()))
    }
}

#[async_trait::async_trait]
impl crate::followup::DiffSource for GhClient {
    /// Interval diff via the compare endpoint, reassembled from the
    /// per-file patches it returns.
    async fn diff_between(
        &self,
        base_sha: &str,
        head_sha: &str,
    ) -> Result<String, GitHubError> {
        let comparison = self.compare(base_sha, head_sha).await?;
        let files = comparison
            .get("files")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut diff = String::new();
        for file in files {
            let Some(name) = file.get("filename").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(patch) = file.get("patch").and_then(|v| v.as_str()) else {
                continue;
            };
            diff.push_str(&format!("--- a/{name}\n+++ b/{name}\n{patch}\n"));
        }
        Ok(diff)
    }
}

/// GitHub's contents API returns newline-wrapped standard base64.
fn decode_base64_content(encoded: &str) -> Option<String> {
    use base64::Engine;
    let stripped: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(stripped)
        .ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wrapped_base64() {
        assert_eq!(
            decode_base64_content("aGVsbG8g\nd29ybGQ=").as_deref(),
            Some("hello world")
        );
        assert_eq!(decode_base64_content("").as_deref(), Some(""));
        assert!(decode_base64_content("not base64!!").is_none());
    }
}
