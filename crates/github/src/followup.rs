use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use autoforge_agent::{AgentRole, SessionOptions};
use autoforge_core::orchestrator::SessionRunner;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ContextSource;
use crate::error::GitHubError;
use crate::models::{
    ChangedFileStatus, CiStatus, Finding, FindingResolution, MergeVerdict, PrContext,
    PrReviewResult, ReviewSeverity, RiskAssessment,
};
use crate::prompts;
use crate::review::{dedup_findings, parse_review_payload};
use crate::store::GitHubStore;
use crate::verdict::{self, is_ci_blocker, VerdictInput};

/// Source for the textual diff between two commits, used to judge
/// whether a finding's region actually changed.
#[async_trait]
pub trait DiffSource: Send + Sync {
    async fn diff_between(&self, base_sha: &str, head_sha: &str)
        -> Result<String, GitHubError>;
}

/// Incremental review of a PR against its previous review. Tracks
/// finding resolution across commits and survives rebases via blob-SHA
/// comparison.
pub struct FollowupReviewer {
    context_source: Arc<dyn ContextSource>,
    diff_source: Arc<dyn DiffSource>,
    store: Arc<GitHubStore>,
    /// When present, unresolved findings are re-investigated and fresh
    /// specialist findings gathered for the changed files.
    runner: Option<Arc<dyn SessionRunner>>,
    model: String,
}

impl FollowupReviewer {
    pub fn new(
        context_source: Arc<dyn ContextSource>,
        diff_source: Arc<dyn DiffSource>,
        store: Arc<GitHubStore>,
        runner: Option<Arc<dyn SessionRunner>>,
        model: String,
    ) -> Self {
        Self {
            context_source,
            diff_source,
            store,
            runner,
            model,
        }
    }

    pub async fn review_followup(
        &self,
        pr_number: u64,
        repo: &str,
        project_root: &std::path::Path,
        cancel: CancellationToken,
    ) -> PrReviewResult {
        let Some(previous) = self.store.load_latest_review(pr_number) else {
            let result = PrReviewResult::failed(
                pr_number,
                repo,
                "no previous review to follow up on",
            );
            let _ = self.store.save_review(&result);
            return result;
        };

        let context = match self.context_source.gather(pr_number).await {
            Ok(context) => context,
            Err(e) => {
                let mut result = PrReviewResult::failed(pr_number, repo, e.to_string());
                result.is_followup_review = true;
                result.previous_review_id = Some(previous.id.clone());
                let _ = self.store.save_review(&result);
                return result;
            }
        };

        // Unchanged head: keep the previous review but refresh the CI
        // overlay, which may have flipped either way since.
        if previous.reviewed_commit_sha.as_deref() == Some(context.head_sha.as_str()) {
            info!(pr_number, "head unchanged since previous review, refreshing CI overlay");
            let result = refresh_ci_verdict(&previous, &context.ci_status);
            let _ = self.store.save_review(&result);
            return result;
        }

        let (changed_files, rebase_detected) = changed_files_since(&previous, &context);
        debug!(
            pr_number,
            changed = changed_files.len(),
            rebase_detected,
            "derived changed files since previous review"
        );

        let interval_diff = if rebase_detected {
            // After a rewrite the old sha may be unreachable; the blob
            // set already tells us what changed.
            String::new()
        } else {
            match &previous.reviewed_commit_sha {
                Some(prev_sha) => self
                    .diff_source
                    .diff_between(prev_sha, &context.head_sha)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(pr_number, error = %e, "interval diff unavailable");
                        String::new()
                    }),
                None => String::new(),
            }
        };

        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();
        for finding in &previous.findings {
            let resolution =
                finding_resolution(finding, &changed_files, &interval_diff, rebase_detected);
            match resolution {
                FindingResolution::Resolved => resolved.push(finding.clone()),
                _ => {
                    let mut finding = finding.clone();
                    finding.validation_status = Some(resolution);
                    unresolved.push(finding);
                }
            }
        }

        if let Some(runner) = &self.runner {
            unresolved =
                self.validate_unresolved(runner, unresolved, &mut resolved, project_root, &cancel)
                    .await;
        }

        let new_findings = match (&self.runner, changed_files.is_empty()) {
            (Some(runner), false) => self
                .gather_new_findings(runner, &context, &changed_files, project_root, &cancel)
                .await,
            _ => Vec::new(),
        };
        let new_ids: Vec<String> = new_findings.iter().map(|f| f.id.clone()).collect();

        let mut all_findings = unresolved.clone();
        all_findings.extend(new_findings);
        let all_findings = dedup_findings(all_findings);

        let verdict = verdict::derive_verdict(&VerdictInput {
            findings: &all_findings,
            structural_issues: &previous.structural_issues,
            ai_triages: &previous.ai_comment_triages,
            ci: &context.ci_status,
            has_merge_conflicts: context.has_merge_conflicts,
            merge_state_status: &context.merge_state_status,
        });
        let bottom_line = verdict::bottom_line(&verdict, &context.ci_status, &all_findings);
        let risk_assessment =
            RiskAssessment::calculate(&context, &all_findings, &previous.structural_issues);

        let reviewed_file_blobs: BTreeMap<String, String> = context
            .changed_files
            .iter()
            .filter_map(|f| f.blob_sha.clone().map(|sha| (f.path.clone(), sha)))
            .collect();

        info!(
            pr_number,
            resolved = resolved.len(),
            unresolved = unresolved.len(),
            new = new_ids.len(),
            verdict = %verdict.verdict,
            "follow-up review complete"
        );

        let result = PrReviewResult {
            id: format!("review-{pr_number}-{}", Utc::now().timestamp_millis()),
            pr_number,
            repo: repo.to_string(),
            success: true,
            error: None,
            findings: all_findings,
            structural_issues: previous.structural_issues.clone(),
            ai_comment_triages: previous.ai_comment_triages.clone(),
            verdict: verdict.verdict,
            verdict_reasoning: verdict.reasoning,
            blockers: verdict.blockers,
            risk_assessment,
            bottom_line,
            reviewed_commit_sha: Some(context.head_sha.clone()),
            reviewed_file_blobs,
            is_followup_review: true,
            previous_review_id: Some(previous.id.clone()),
            resolved_findings: resolved.iter().map(|f| f.id.clone()).collect(),
            unresolved_findings: unresolved.iter().map(|f| f.id.clone()).collect(),
            new_findings_since_last_review: new_ids,
            reviewed_at: Utc::now(),
        };
        let _ = self.store.save_review(&result);
        result
    }

    /// Re-investigate unresolved findings with the validator agent: it
    /// confirms, dismisses as a false positive (dismissed findings are
    /// reclassified as resolved), or flags for human review.
    async fn validate_unresolved(
        &self,
        runner: &Arc<dyn SessionRunner>,
        unresolved: Vec<Finding>,
        resolved: &mut Vec<Finding>,
        project_root: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Vec<Finding> {
        let mut still_unresolved = Vec::new();
        for mut finding in unresolved {
            let mut options = SessionOptions::new(
                self.model.clone(),
                AgentRole::FindingValidator,
                project_root.to_path_buf(),
            );
            options.output_schema = Some(prompts::validator_output_schema());
            let prompt = prompts::finding_validator_prompt(
                &finding.title,
                &finding.file,
                finding.line,
                &finding.description,
            );

            let status = match runner.run(&options, &prompt, cancel.child_token()).await {
                Ok(outcome) => outcome
                    .structured_output
                    .as_ref()
                    .and_then(|v| v.get("status"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("needs_human")
                    .to_string(),
                Err(e) => {
                    warn!(finding = %finding.id, error = %e, "finding validation failed");
                    "needs_human".to_string()
                }
            };

            match status.as_str() {
                "false_positive" => {
                    debug!(finding = %finding.id, "dismissed as false positive");
                    finding.validation_status = Some(FindingResolution::Resolved);
                    resolved.push(finding);
                }
                _ => still_unresolved.push(finding),
            }
        }
        still_unresolved
    }

    async fn gather_new_findings(
        &self,
        runner: &Arc<dyn SessionRunner>,
        context: &PrContext,
        changed_files: &[String],
        project_root: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Vec<Finding> {
        let mut options = SessionOptions::new(
            self.model.clone(),
            AgentRole::ReviewOrchestrator,
            project_root.to_path_buf(),
        );
        options.output_schema = Some(prompts::review_output_schema());

        let prompt = format!(
            "Follow-up review of PR #{} in {}. Only these files changed since the \
             last review:\n{}\n\nReview only those files for new issues introduced \
             since the previous round. Report structured findings.",
            context.pr_number,
            context.repo,
            changed_files.join("\n"),
        );

        match runner.run(&options, &prompt, cancel.child_token()).await {
            Ok(outcome) => outcome
                .structured_output
                .map(|payload| parse_review_payload(&payload).0)
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "follow-up specialist pass failed");
                Vec::new()
            }
        }
    }
}

/// Files changed since the previous review, plus whether a rebase or
/// force-push was detected. Normal path: the previous head is still in
/// the PR's commit list. Rebase path: compare each current file's blob
/// SHA against the previous review's recorded blobs; identical blobs
/// mean identical bytes no matter how history was rewritten.
pub fn changed_files_since(
    previous: &PrReviewResult,
    context: &PrContext,
) -> (Vec<String>, bool) {
    let prev_sha = previous.reviewed_commit_sha.as_deref().unwrap_or("");
    let rebase_detected =
        !prev_sha.is_empty() && !context.commits.iter().any(|c| c.sha == prev_sha);

    if !rebase_detected {
        // Files from commits after the previously reviewed one.
        let mut past_previous = false;
        let changed = if prev_sha.is_empty() {
            context.changed_files.iter().map(|f| f.path.clone()).collect()
        } else {
            let commits_after: Vec<&str> = context
                .commits
                .iter()
                .filter_map(|c| {
                    if past_previous {
                        Some(c.sha.as_str())
                    } else {
                        if c.sha == prev_sha {
                            past_previous = true;
                        }
                        None
                    }
                })
                .collect();
            if commits_after.is_empty() {
                Vec::new()
            } else {
                // The PR-scoped file list is the authority on what the
                // PR touches; membership in the interval is judged per
                // finding against the interval diff.
                context.changed_files.iter().map(|f| f.path.clone()).collect()
            }
        };
        return (changed, false);
    }

    // Blob-level comparison after a rewrite.
    let mut changed = Vec::new();
    for file in &context.changed_files {
        let prior_blob = previous.reviewed_file_blobs.get(&file.path);
        let include = match (&file.blob_sha, prior_blob) {
            (Some(current), Some(prior)) => current != prior,
            // Not seen before, or no blob recorded: treat as changed.
            (Some(_), None) | (None, _) => true,
        };
        let include = include
            || matches!(
                file.status,
                ChangedFileStatus::Added | ChangedFileStatus::Deleted | ChangedFileStatus::Renamed
            ) && prior_blob.is_none();
        if include {
            changed.push(file.path.clone());
        }
    }
    // Files the previous review saw that vanished from the PR entirely.
    for path in previous.reviewed_file_blobs.keys() {
        if !context.changed_files.iter().any(|f| &f.path == path) {
            changed.push(path.clone());
        }
    }
    (changed, true)
}

/// Did the region around the finding actually change in the interval?
/// `cant_verify` (no line, or no diff available) is treated as
/// unresolved by the verdict.
pub fn finding_resolution(
    finding: &Finding,
    changed_files: &[String],
    interval_diff: &str,
    rebase_detected: bool,
) -> FindingResolution {
    if !changed_files.iter().any(|f| f == &finding.file) {
        return FindingResolution::Unresolved;
    }
    if rebase_detected {
        // Blob changed but no reliable line mapping across the rewrite.
        return FindingResolution::CantVerify;
    }
    let Some(line) = finding.line else {
        return FindingResolution::CantVerify;
    };
    if interval_diff.is_empty() {
        return FindingResolution::CantVerify;
    }
    if line_appears_changed(&finding.file, line, interval_diff) {
        FindingResolution::Resolved
    } else {
        FindingResolution::Unresolved
    }
}

/// Scan the unified diff for a hunk in `file` covering `line` on the old
/// side (with a small margin for drift).
fn line_appears_changed(file: &str, line: u32, diff: &str) -> bool {
    const MARGIN: u32 = 3;
    let mut in_file = false;
    for diff_line in diff.lines() {
        if diff_line.starts_with("--- ") || diff_line.starts_with("+++ ") {
            in_file = diff_line.ends_with(&format!("/{file}")) || diff_line.ends_with(file);
            continue;
        }
        if diff_line.starts_with("diff --git") {
            in_file = diff_line.contains(file);
            continue;
        }
        if !in_file || !diff_line.starts_with("@@") {
            continue;
        }
        if let Some((start, count)) = parse_hunk_old_range(diff_line) {
            let from = start.saturating_sub(MARGIN);
            let to = start + count + MARGIN;
            if line >= from && line <= to {
                return true;
            }
        }
    }
    false
}

/// `@@ -12,4 +12,6 @@` -> (12, 4)
fn parse_hunk_old_range(header: &str) -> Option<(u32, u32)> {
    let old = header.split_whitespace().nth(1)?.strip_prefix('-')?;
    let mut parts = old.splitn(2, ',');
    let start = parts.next()?.parse().ok()?;
    let count = parts.next().and_then(|c| c.parse().ok()).unwrap_or(1);
    Some((start, count))
}

/// Same head, new CI facts: rebuild the blocker list by stripping every
/// CI blocker and re-adding current ones, then refresh the verdict. A
/// review blocked solely on CI must become mergeable once CI is green.
pub fn refresh_ci_verdict(previous: &PrReviewResult, ci: &CiStatus) -> PrReviewResult {
    let mut blockers: Vec<String> = previous
        .blockers
        .iter()
        .filter(|b| !is_ci_blocker(b))
        .cloned()
        .collect();
    for check in &ci.failed_checks {
        let blocker = format!("CI Failed: {check}");
        if !blockers.contains(&blocker) {
            blockers.push(blocker);
        }
    }
    if ci.awaiting_approval > 0 {
        blockers.push(format!(
            "Workflows Pending: {} workflow(s) awaiting maintainer approval",
            ci.awaiting_approval
        ));
    }

    let was_ci_blocked = previous.verdict == MergeVerdict::Blocked
        && previous.blockers.iter().any(|b| is_ci_blocker(b));
    let ci_still_bad = !ci.failed_checks.is_empty() || ci.awaiting_approval > 0;

    let (verdict, reasoning) = if ci_still_bad {
        if previous.verdict == MergeVerdict::Blocked || was_ci_blocked || !blockers.is_empty() {
            (
                MergeVerdict::Blocked,
                format!(
                    "Blocked: {} CI check(s) failing, {} workflow(s) awaiting approval.",
                    ci.failed_checks.len(),
                    ci.awaiting_approval
                ),
            )
        } else {
            (previous.verdict, previous.verdict_reasoning.clone())
        }
    } else if was_ci_blocked {
        // CI recovered. Any non-CI blockers keep it blocked; otherwise
        // the verdict comes from the findings that remain.
        if !blockers.is_empty() {
            (
                MergeVerdict::Blocked,
                format!(
                    "CI checks now passing. Non-CI blockers still remain: {}",
                    blockers
                        .iter()
                        .take(3)
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
        } else {
            let blocking = previous
                .findings
                .iter()
                .filter(|f| {
                    matches!(f.severity, ReviewSeverity::High | ReviewSeverity::Medium)
                })
                .count();
            if blocking > 0 {
                (
                    MergeVerdict::NeedsRevision,
                    format!(
                        "CI checks now passing. {blocking} code issue(s) still need attention."
                    ),
                )
            } else {
                (
                    MergeVerdict::ReadyToMerge,
                    "CI checks now passing and no blocking findings remain.".to_string(),
                )
            }
        }
    } else {
        (previous.verdict, previous.verdict_reasoning.clone())
    };

    let mut result = previous.clone();
    result.id = format!(
        "review-{}-{}",
        previous.pr_number,
        Utc::now().timestamp_millis()
    );
    result.is_followup_review = true;
    result.previous_review_id = Some(previous.id.clone());
    result.verdict = verdict;
    result.verdict_reasoning = reasoning;
    result.blockers = blockers;
    result.bottom_line = verdict::bottom_line(
        &verdict::Verdict {
            verdict,
            reasoning: result.verdict_reasoning.clone(),
            blockers: result.blockers.clone(),
        },
        ci,
        &result.findings,
    );
    result.reviewed_at = Utc::now();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangedFile, CiState, CommitInfo, ReviewCategory};

    fn base_context(head: &str) -> PrContext {
        PrContext {
            pr_number: 5,
            repo: "owner/repo".into(),
            head_sha: head.into(),
            base_sha: "base".into(),
            head_branch: "feature".into(),
            base_branch: "main".into(),
            title: "t".into(),
            description: String::new(),
            author: "dev".into(),
            changed_files: vec![],
            full_diff: None,
            diff_truncated: false,
            related_files: vec![],
            commits: vec![],
            ai_bot_comments: vec![],
            has_merge_conflicts: false,
            merge_state_status: "CLEAN".into(),
            ci_status: CiStatus::default(),
            total_additions: 0,
            total_deletions: 0,
        }
    }

    fn changed(path: &str, blob: &str) -> ChangedFile {
        ChangedFile {
            path: path.into(),
            status: ChangedFileStatus::Modified,
            additions: 1,
            deletions: 1,
            content_after: None,
            content_before: None,
            patch: None,
            blob_sha: Some(blob.into()),
        }
    }

    fn previous_result(sha: &str, blobs: &[(&str, &str)]) -> PrReviewResult {
        let mut result = PrReviewResult::failed(5, "owner/repo", "seed");
        result.success = true;
        result.error = None;
        result.verdict = MergeVerdict::ReadyToMerge;
        result.reviewed_commit_sha = Some(sha.into());
        result.reviewed_file_blobs = blobs
            .iter()
            .map(|(path, blob)| (path.to_string(), blob.to_string()))
            .collect();
        result
    }

    fn commit(sha: &str) -> CommitInfo {
        CommitInfo {
            sha: sha.into(),
            message: String::new(),
            author: String::new(),
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn rebase_with_changed_blob_flags_only_that_file() {
        // Previous review saw a.py=H1, b.py=H2. After the rebase the PR
        // serves a.py=H1 (unchanged bytes) and b.py=H3.
        let previous = previous_result("oldsha", &[("a.py", "H1"), ("b.py", "H2")]);
        let mut context = base_context("newsha");
        context.changed_files = vec![changed("a.py", "H1"), changed("b.py", "H3")];
        context.commits = vec![commit("c1"), commit("newsha")];

        let (files, rebase) = changed_files_since(&previous, &context);
        assert!(rebase);
        assert_eq!(files, vec!["b.py".to_string()]);
    }

    #[test]
    fn rebase_with_identical_blobs_is_empty_set() {
        let previous = previous_result("oldsha", &[("a.py", "H1"), ("b.py", "H2")]);
        let mut context = base_context("newsha");
        context.changed_files = vec![changed("a.py", "H1"), changed("b.py", "H2")];
        context.commits = vec![commit("other")];

        let (files, rebase) = changed_files_since(&previous, &context);
        assert!(rebase);
        assert!(files.is_empty());
    }

    #[test]
    fn linear_history_is_not_a_rebase() {
        let previous = previous_result("oldsha", &[]);
        let mut context = base_context("newsha");
        context.commits = vec![commit("oldsha"), commit("newsha")];
        context.changed_files = vec![changed("a.py", "H9")];

        let (files, rebase) = changed_files_since(&previous, &context);
        assert!(!rebase);
        assert_eq!(files, vec!["a.py".to_string()]);
    }

    fn finding(file: &str, line: Option<u32>) -> Finding {
        Finding {
            id: Finding::make_id(file, line, "issue"),
            severity: ReviewSeverity::High,
            category: ReviewCategory::Logic,
            title: "issue".into(),
            description: String::new(),
            file: file.into(),
            line,
            suggested_fix: None,
            evidence: None,
            validation_status: None,
            confidence: 0.9,
            source_agents: vec![],
            cross_validated: false,
        }
    }

    const DIFF: &str = "--- a/src/auth.py\n+++ b/src/auth.py\n@@ -40,6 +40,8 @@\n context\n-old\n+new\n";

    #[test]
    fn finding_in_changed_region_is_resolved() {
        let f = finding("src/auth.py", Some(42));
        let files = vec!["src/auth.py".to_string()];
        assert_eq!(
            finding_resolution(&f, &files, DIFF, false),
            FindingResolution::Resolved
        );
    }

    #[test]
    fn finding_outside_changed_region_is_unresolved() {
        let f = finding("src/auth.py", Some(400));
        let files = vec!["src/auth.py".to_string()];
        assert_eq!(
            finding_resolution(&f, &files, DIFF, false),
            FindingResolution::Unresolved
        );
    }

    #[test]
    fn finding_in_untouched_file_is_unresolved() {
        let f = finding("src/other.py", Some(42));
        let files = vec!["src/auth.py".to_string()];
        assert_eq!(
            finding_resolution(&f, &files, DIFF, false),
            FindingResolution::Unresolved
        );
    }

    #[test]
    fn missing_line_cannot_be_verified() {
        let f = finding("src/auth.py", None);
        let files = vec!["src/auth.py".to_string()];
        assert_eq!(
            finding_resolution(&f, &files, DIFF, false),
            FindingResolution::CantVerify
        );
    }

    #[test]
    fn ci_recovery_refreshes_blocked_verdict() {
        // Previously blocked solely on CI; next poll shows green.
        let mut previous = previous_result("sha", &[]);
        previous.verdict = MergeVerdict::Blocked;
        previous.blockers = vec!["CI Failed: unit-tests".to_string()];

        let green = CiStatus {
            state: Some(CiState::Passing),
            failed_checks: vec![],
            awaiting_approval: 0,
        };
        let refreshed = refresh_ci_verdict(&previous, &green);
        assert_eq!(refreshed.verdict, MergeVerdict::ReadyToMerge);
        assert!(refreshed.blockers.is_empty());
        assert!(refreshed.is_followup_review);
        assert_eq!(refreshed.previous_review_id.as_deref(), Some(previous.id.as_str()));
    }

    #[test]
    fn ci_recovery_with_remaining_findings_needs_revision() {
        let mut previous = previous_result("sha", &[]);
        previous.verdict = MergeVerdict::Blocked;
        previous.blockers = vec!["CI Failed: build".to_string()];
        previous.findings = vec![finding("a.py", Some(3))];

        let green = CiStatus {
            state: Some(CiState::Passing),
            ..Default::default()
        };
        let refreshed = refresh_ci_verdict(&previous, &green);
        assert_eq!(refreshed.verdict, MergeVerdict::NeedsRevision);
    }

    #[test]
    fn ci_recovery_keeps_non_ci_blockers() {
        let mut previous = previous_result("sha", &[]);
        previous.verdict = MergeVerdict::Blocked;
        previous.blockers = vec![
            "CI Failed: build".to_string(),
            "Security: token leak (a.py:1)".to_string(),
        ];

        let green = CiStatus {
            state: Some(CiState::Passing),
            ..Default::default()
        };
        let refreshed = refresh_ci_verdict(&previous, &green);
        assert_eq!(refreshed.verdict, MergeVerdict::Blocked);
        assert_eq!(refreshed.blockers.len(), 1);
        assert!(refreshed.blockers[0].starts_with("Security"));
    }

    #[test]
    fn ci_regression_blocks_a_previously_clean_review() {
        let previous = previous_result("sha", &[]);
        let red = CiStatus {
            state: Some(CiState::Failing),
            failed_checks: vec!["unit-tests".into()],
            awaiting_approval: 0,
        };
        let refreshed = refresh_ci_verdict(&previous, &red);
        assert_eq!(refreshed.verdict, MergeVerdict::Blocked);
        assert!(refreshed
            .blockers
            .contains(&"CI Failed: unit-tests".to_string()));
    }
}
