use std::path::PathBuf;
use std::sync::Arc;

use autoforge_config::Config;
use autoforge_core::orchestrator::{BuildOutcome, SessionOrchestrator, SessionRunner};
use autoforge_core::specs::Spec;
use autoforge_core::worktree::WorktreeManager;
use autoforge_core::GitAdapter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::autofix::AutoFixTracker;
use crate::context::{ContextSource, GhContextGatherer};
use crate::error::GitHubError;
use crate::followup::{DiffSource, FollowupReviewer};
use crate::gh::GhClient;
use crate::models::{AutoFixStatus, PrReviewResult, TriageResult};
use crate::rate_limit::RateLimiter;
use crate::review::ReviewEngine;
use crate::store::GitHubStore;
use crate::triage::TriageEngine;

/// Thin coordinator over the review, follow-up, triage, and auto-fix
/// flows for one repository. Owns the process-global rate limiter all
/// GitHub calls pass through.
pub struct GitHubOrchestrator {
    repo: String,
    project_dir: PathBuf,
    config: Config,
    client: Arc<GhClient>,
    store: Arc<GitHubStore>,
    review_engine: ReviewEngine,
    followup_reviewer: FollowupReviewer,
    triage_engine: TriageEngine,
    autofix: AutoFixTracker,
    runner: Arc<dyn SessionRunner>,
}

impl GitHubOrchestrator {
    pub fn new(
        repo: impl Into<String>,
        project_dir: PathBuf,
        state_dir: PathBuf,
        config: Config,
        runner: Arc<dyn SessionRunner>,
        bot_login: Option<String>,
    ) -> anyhow::Result<Self> {
        let repo = repo.into();
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let client = Arc::new(GhClient::new(
            repo.clone(),
            project_dir.clone(),
            limiter.clone(),
        ));
        let store = Arc::new(GitHubStore::open(
            &state_dir,
            config.review.archive_keep_per_pr,
        )?);

        // Worktrees live under github/pr/worktrees per the state layout.
        let git = GitAdapter::new(config.git.clone());
        let worktrees = Arc::new(WorktreeManager::new(
            git,
            &project_dir,
            &store.pr_dir(),
            config.worktrees.clone(),
        ));

        let gatherer: Arc<dyn ContextSource> = Arc::new(GhContextGatherer::new(
            GhClient::new(repo.clone(), project_dir.clone(), limiter.clone()),
            config.review.diff_truncation_lines,
        ));
        let diff_source: Arc<dyn DiffSource> = Arc::new(GhClient::new(
            repo.clone(),
            project_dir.clone(),
            limiter,
        ));

        let review_engine = ReviewEngine::new(
            gatherer.clone(),
            runner.clone(),
            worktrees,
            store.clone(),
            config.review.clone(),
            config.agent.model.clone(),
            bot_login,
        );
        let followup_reviewer = FollowupReviewer::new(
            gatherer,
            diff_source,
            store.clone(),
            config.review.validate_findings.then(|| runner.clone()),
            config.agent.model.clone(),
        );
        let triage_engine = TriageEngine::new(
            client.clone(),
            runner.clone(),
            store.clone(),
            config.agent.model.clone(),
            project_dir.clone(),
        );
        let autofix = AutoFixTracker::new(store.clone());

        Ok(Self {
            repo,
            project_dir,
            config,
            client,
            store,
            review_engine,
            followup_reviewer,
            triage_engine,
            autofix,
            runner,
        })
    }

    pub fn store(&self) -> &Arc<GitHubStore> {
        &self.store
    }

    /// Initial review, or reuse of the prior one when the head is
    /// already reviewed and `force` is not set.
    pub async fn review_pr(
        &self,
        pr_number: u64,
        force: bool,
        cancel: CancellationToken,
    ) -> PrReviewResult {
        self.review_engine
            .review_pr(pr_number, &self.repo, force, cancel)
            .await
    }

    pub async fn followup_review_pr(
        &self,
        pr_number: u64,
        cancel: CancellationToken,
    ) -> PrReviewResult {
        self.followup_reviewer
            .review_followup(pr_number, &self.repo, &self.project_dir, cancel)
            .await
    }

    pub async fn triage_issue(
        &self,
        issue_number: u64,
        cancel: CancellationToken,
    ) -> Result<TriageResult, GitHubError> {
        self.triage_engine.triage_issue(issue_number, cancel).await
    }

    pub async fn triage_open_issues(
        &self,
        limit: u32,
        cancel: CancellationToken,
    ) -> Vec<TriageResult> {
        let issues = match self.client.list_open_issues(limit).await {
            Ok(issues) => issues,
            Err(e) => {
                warn!(error = %e, "could not list open issues");
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        for issue in issues {
            if cancel.is_cancelled() {
                break;
            }
            let Some(number) = issue.get("number").and_then(|v| v.as_u64()) else {
                continue;
            };
            match self.triage_issue(number, cancel.child_token()).await {
                Ok(result) => results.push(result),
                Err(e) => warn!(issue = number, error = %e, "triage failed"),
            }
        }
        results
    }

    /// Drive an automatic fix for an issue: create a spec from the issue
    /// body, run the build loop, and record every lifecycle move.
    pub async fn autofix_issue(
        &self,
        issue_number: u64,
        specs_root: &std::path::Path,
        cancel: CancellationToken,
    ) -> anyhow::Result<AutoFixStatus> {
        self.autofix
            .advance(issue_number, AutoFixStatus::Analyzing, |_| {})?;

        let issue = match self.client.issue_view(issue_number).await {
            Ok(issue) => issue,
            Err(e) => {
                self.autofix
                    .advance(issue_number, AutoFixStatus::Failed, |state| {
                        state.error = Some(e.to_string());
                    })?;
                return Ok(AutoFixStatus::Failed);
            }
        };

        let title = issue.get("title").and_then(|v| v.as_str()).unwrap_or("");
        let body = issue.get("body").and_then(|v| v.as_str()).unwrap_or("");
        let spec_dir = specs_root.join(format!("issue-{issue_number}"));
        std::fs::create_dir_all(&spec_dir)?;
        std::fs::write(
            spec_dir.join("spec.md"),
            format!("# Fix issue #{issue_number}: {title}\n\n{body}\n"),
        )?;
        self.autofix
            .advance(issue_number, AutoFixStatus::CreatingSpec, |state| {
                state.spec_dir = Some(spec_dir.display().to_string());
            })?;

        self.autofix
            .advance(issue_number, AutoFixStatus::Building, |_| {})?;
        let orchestrator = SessionOrchestrator::new(
            Spec::new(format!("issue-{issue_number}"), &spec_dir),
            self.project_dir.clone(),
            self.config.clone(),
            self.runner.clone(),
            cancel,
        )?;
        let outcome = orchestrator.run().await;

        let status = match outcome {
            BuildOutcome::Complete => AutoFixStatus::QaReview,
            BuildOutcome::Stuck => AutoFixStatus::Failed,
            BuildOutcome::Paused => AutoFixStatus::Cancelled,
            BuildOutcome::Error(ref e) => {
                info!(issue_number, error = %e, "auto-fix build errored");
                AutoFixStatus::Failed
            }
        };
        self.autofix.advance(issue_number, status, |state| {
            if let BuildOutcome::Error(e) = &outcome {
                state.error = Some(e.clone());
            }
        })?;
        Ok(status)
    }
}
