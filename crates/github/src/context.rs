use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::GitHubError;
use crate::gh::GhClient;
use crate::models::{
    AiBotComment, ChangedFile, ChangedFileStatus, CiState, CiStatus, CommitInfo, PrContext,
};

/// Known AI review bots whose comments feed the triage pass.
const AI_BOT_MARKERS: &[&str] = &["coderabbit", "copilot", "cursor", "sourcery", "[bot]"];

/// Source of PR snapshots. The review pipeline depends on this interface
/// rather than the CLI adapter directly.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn gather(&self, pr_number: u64) -> Result<PrContext, GitHubError>;
}

pub struct GhContextGatherer {
    client: GhClient,
    /// Diffs above this many lines are flagged truncated and not
    /// attached (GitHub stops serving them around 20k lines anyway).
    diff_truncation_lines: usize,
}

impl GhContextGatherer {
    pub fn new(client: GhClient, diff_truncation_lines: usize) -> Self {
        Self {
            client,
            diff_truncation_lines,
        }
    }

    pub fn client(&self) -> &GhClient {
        &self.client
    }
}

#[async_trait]
impl ContextSource for GhContextGatherer {
    async fn gather(&self, pr_number: u64) -> Result<PrContext, GitHubError> {
        let view = self.client.pr_view(pr_number).await?;

        let head_sha = string_at(&view, "headRefOid");
        let base_sha = string_at(&view, "baseRefOid");
        let merge_state_status = string_at(&view, "mergeStateStatus");
        let has_merge_conflicts = string_at(&view, "mergeable") == "CONFLICTING";
        let ci_status = parse_ci_status(view.get("statusCheckRollup"));

        let files = self.client.pr_files(pr_number).await?;
        let changed_files: Vec<ChangedFile> = files.iter().filter_map(parse_changed_file).collect();
        let total_additions = view.get("additions").and_then(|v| v.as_u64()).unwrap_or(0);
        let total_deletions = view.get("deletions").and_then(|v| v.as_u64()).unwrap_or(0);

        let (full_diff, diff_truncated) = match self.client.pr_diff(pr_number).await {
            Ok(diff) if diff.lines().count() > self.diff_truncation_lines => {
                debug!(pr_number, "diff exceeds threshold, flagging truncated");
                (None, true)
            }
            Ok(diff) => (Some(diff), false),
            Err(e) => {
                warn!(pr_number, error = %e, "could not fetch full diff");
                (None, true)
            }
        };

        let commits = self
            .client
            .pr_commits(pr_number)
            .await
            .map(|raw| raw.iter().filter_map(parse_commit).collect())
            .unwrap_or_else(|e| {
                warn!(pr_number, error = %e, "could not fetch commit list");
                Vec::new()
            });

        let ai_bot_comments = view
            .get("comments")
            .and_then(|v| v.as_array())
            .map(|comments| comments.iter().filter_map(parse_ai_comment).collect())
            .unwrap_or_default();

        Ok(PrContext {
            pr_number,
            repo: self.client.repo().to_string(),
            head_sha,
            base_sha,
            head_branch: string_at(&view, "headRefName"),
            base_branch: string_at(&view, "baseRefName"),
            title: string_at(&view, "title"),
            description: string_at(&view, "body"),
            author: view
                .pointer("/author/login")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            changed_files,
            full_diff,
            diff_truncated,
            related_files: Vec::new(),
            commits,
            ai_bot_comments,
            has_merge_conflicts,
            merge_state_status,
            ci_status,
            total_additions,
            total_deletions,
        })
    }
}

fn string_at(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn parse_changed_file(raw: &Value) -> Option<ChangedFile> {
    let path = raw.get("filename").and_then(|v| v.as_str())?.to_string();
    let status = match raw.get("status").and_then(|v| v.as_str()).unwrap_or("") {
        "added" => ChangedFileStatus::Added,
        "removed" => ChangedFileStatus::Deleted,
        "renamed" => ChangedFileStatus::Renamed,
        _ => ChangedFileStatus::Modified,
    };
    Some(ChangedFile {
        path,
        status,
        additions: raw.get("additions").and_then(|v| v.as_u64()).unwrap_or(0),
        deletions: raw.get("deletions").and_then(|v| v.as_u64()).unwrap_or(0),
        content_after: None,
        content_before: None,
        patch: raw.get("patch").and_then(|v| v.as_str()).map(String::from),
        blob_sha: raw.get("sha").and_then(|v| v.as_str()).map(String::from),
    })
}

fn parse_commit(raw: &Value) -> Option<CommitInfo> {
    let sha = raw.get("sha").and_then(|v| v.as_str())?.to_string();
    let committed_at = raw
        .pointer("/commit/committer/date")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
        .unwrap_or_else(Utc::now);
    Some(CommitInfo {
        sha,
        message: raw
            .pointer("/commit/message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        author: raw
            .pointer("/commit/author/name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        committed_at,
    })
}

fn parse_ai_comment(raw: &Value) -> Option<AiBotComment> {
    let author = raw
        .pointer("/author/login")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_lowercase();
    if !AI_BOT_MARKERS.iter().any(|m| author.contains(m)) {
        return None;
    }
    Some(AiBotComment {
        author,
        body: raw
            .get("body")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        file: None,
        line: None,
    })
}

/// Fold gh's statusCheckRollup into the CI overlay the verdict uses.
pub fn parse_ci_status(rollup: Option<&Value>) -> CiStatus {
    let Some(checks) = rollup.and_then(|v| v.as_array()) else {
        return CiStatus {
            state: Some(CiState::Unknown),
            ..Default::default()
        };
    };
    if checks.is_empty() {
        return CiStatus {
            state: Some(CiState::Unknown),
            ..Default::default()
        };
    }

    let mut failed_checks = Vec::new();
    let mut awaiting_approval: u32 = 0;
    let mut pending = false;

    for check in checks {
        let name = check
            .get("name")
            .or_else(|| check.get("context"))
            .and_then(|v| v.as_str())
            .unwrap_or("unnamed")
            .to_string();
        let conclusion = check
            .get("conclusion")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_uppercase();
        let status = check
            .get("status")
            .or_else(|| check.get("state"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_uppercase();

        match conclusion.as_str() {
            "FAILURE" | "TIMED_OUT" | "STARTUP_FAILURE" => failed_checks.push(name),
            "ACTION_REQUIRED" => awaiting_approval += 1,
            _ => {
                if status == "IN_PROGRESS" || status == "QUEUED" || status == "PENDING" {
                    pending = true;
                }
            }
        }
    }

    let state = if !failed_checks.is_empty() {
        CiState::Failing
    } else if awaiting_approval > 0 {
        CiState::AwaitingApproval
    } else if pending {
        CiState::Pending
    } else {
        CiState::Passing
    };

    CiStatus {
        state: Some(state),
        failed_checks,
        awaiting_approval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ci_rollup_maps_failures_and_approvals() {
        let rollup = json!([
            {"name": "unit-tests", "conclusion": "FAILURE", "status": "COMPLETED"},
            {"name": "lint", "conclusion": "SUCCESS", "status": "COMPLETED"},
            {"name": "fork-build", "conclusion": "ACTION_REQUIRED", "status": "WAITING"}
        ]);
        let status = parse_ci_status(Some(&rollup));
        assert_eq!(status.state, Some(CiState::Failing));
        assert_eq!(status.failed_checks, vec!["unit-tests"]);
        assert_eq!(status.awaiting_approval, 1);
        assert!(!status.is_green());
    }

    #[test]
    fn all_green_rollup_is_passing() {
        let rollup = json!([
            {"name": "unit-tests", "conclusion": "SUCCESS", "status": "COMPLETED"}
        ]);
        let status = parse_ci_status(Some(&rollup));
        assert_eq!(status.state, Some(CiState::Passing));
        assert!(status.is_green());
    }

    #[test]
    fn pending_checks_are_pending() {
        let rollup = json!([
            {"name": "build", "conclusion": "", "status": "IN_PROGRESS"}
        ]);
        assert_eq!(parse_ci_status(Some(&rollup)).state, Some(CiState::Pending));
    }

    #[test]
    fn missing_rollup_is_unknown() {
        assert_eq!(parse_ci_status(None).state, Some(CiState::Unknown));
    }

    #[test]
    fn changed_file_parses_blob_sha() {
        let raw = json!({
            "filename": "src/auth.py",
            "status": "modified",
            "additions": 10,
            "deletions": 2,
            "sha": "abc123",
            "patch": "@@ -1 +1 @@"
        });
        let file = parse_changed_file(&raw).unwrap();
        assert_eq!(file.path, "src/auth.py");
        assert_eq!(file.status, ChangedFileStatus::Modified);
        assert_eq!(file.blob_sha.as_deref(), Some("abc123"));
    }

    #[test]
    fn human_comments_are_not_ai_comments() {
        let human = json!({"author": {"login": "octocat"}, "body": "lgtm"});
        let bot = json!({"author": {"login": "coderabbitai[bot]"}, "body": "possible bug"});
        assert!(parse_ai_comment(&human).is_none());
        assert!(parse_ai_comment(&bot).is_some());
    }
}
