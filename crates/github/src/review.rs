use std::collections::BTreeMap;
use std::sync::Arc;

use autoforge_agent::{AgentRole, SessionOptions, SubAgentDefinition};
use autoforge_core::orchestrator::SessionRunner;
use autoforge_core::worktree::WorktreeManager;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autoforge_config::ReviewSettings;

use crate::context::ContextSource;
use crate::models::{
    AiCommentTriage, AiCommentVerdict, Finding, PrContext, PrReviewResult, ReviewCategory,
    ReviewPass, ReviewSeverity, RiskAssessment, StructuralIssue,
};
use crate::prompts;
use crate::store::GitHubStore;
use crate::verdict::{self, VerdictInput};

/// Initial multi-pass PR review: gather context, check out the PR head
/// into an isolated worktree, run the orchestrated specialist passes,
/// overlay CI and merge state, derive the verdict, persist.
pub struct ReviewEngine {
    context_source: Arc<dyn ContextSource>,
    runner: Arc<dyn SessionRunner>,
    worktrees: Arc<WorktreeManager>,
    store: Arc<GitHubStore>,
    settings: ReviewSettings,
    model: String,
    /// Login of the reviewing bot, for the self-review skip.
    bot_login: Option<String>,
}

impl ReviewEngine {
    pub fn new(
        context_source: Arc<dyn ContextSource>,
        runner: Arc<dyn SessionRunner>,
        worktrees: Arc<WorktreeManager>,
        store: Arc<GitHubStore>,
        settings: ReviewSettings,
        model: String,
        bot_login: Option<String>,
    ) -> Self {
        Self {
            context_source,
            runner,
            worktrees,
            store,
            settings,
            model,
            bot_login,
        }
    }

    pub async fn review_pr(
        &self,
        pr_number: u64,
        repo: &str,
        force: bool,
        cancel: CancellationToken,
    ) -> PrReviewResult {
        let context = match self.context_source.gather(pr_number).await {
            Ok(context) => context,
            Err(e) => {
                let result = PrReviewResult::failed(pr_number, repo, e.to_string());
                let _ = self.store.save_review(&result);
                return result;
            }
        };

        // Skip our own PRs unless configured otherwise.
        if let Some(bot) = &self.bot_login {
            if &context.author == bot && !self.settings.review_own_prs {
                info!(pr_number, "skipping own PR");
                let mut result = PrReviewResult::failed(pr_number, repo, "authored by bot");
                result.success = true;
                result.error = None;
                result.verdict_reasoning = "Skipped: PR authored by the reviewing bot".into();
                return result;
            }
        }

        // Same head already reviewed successfully: reuse unless forced.
        if !force && self.store.was_reviewed(pr_number, &context.head_sha) {
            if let Some(previous) = self.store.load_latest_review(pr_number) {
                info!(pr_number, sha = %context.head_sha, "head already reviewed, reusing");
                return previous;
            }
        }

        let worktree = match self
            .worktrees
            .create("pr", &pr_number.to_string(), &context.head_sha)
            .await
        {
            Ok(worktree) => worktree,
            Err(e) => {
                let result = PrReviewResult::failed(
                    pr_number,
                    repo,
                    format!("worktree provisioning failed: {e}"),
                );
                let _ = self.store.save_review(&result);
                return result;
            }
        };

        // quick_scan runs first, on its own; its assessment decides
        // whether the deep-analysis pass joins the specialist pool.
        let quick_scan = self
            .run_quick_scan(&context, &worktree.path, cancel.child_token())
            .await;
        let passes = self.select_passes(&context, &quick_scan);
        let outcome = self
            .run_orchestrated_review(&context, &worktree.path, &passes, &quick_scan, cancel)
            .await;
        self.worktrees.remove(&worktree.path).await;

        let (mut findings, structural_issues, ai_comment_triages) = match outcome {
            Ok(parsed) => parsed,
            Err(e) => {
                let result = PrReviewResult::failed(pr_number, repo, e);
                let _ = self.store.save_review(&result);
                return result;
            }
        };
        findings.extend(quick_scan.findings);

        let findings = dedup_findings(findings);
        let result = self.assemble_result(&context, findings, structural_issues, ai_comment_triages);
        if let Err(e) = self.store.save_review(&result) {
            warn!(pr_number, error = %e, "could not persist review result");
        }
        result
    }

    /// Run the quick-scan pass. A failed scan degrades to an empty one:
    /// the deep-analysis decision then rests on change volume alone.
    async fn run_quick_scan(
        &self,
        context: &PrContext,
        worktree_path: &std::path::Path,
        cancel: CancellationToken,
    ) -> QuickScanResult {
        let mut options = SessionOptions::new(
            self.model.clone(),
            AgentRole::ReviewOrchestrator,
            worktree_path.to_path_buf(),
        );
        options.allowed_tools = Some(vec!["Read".into(), "Glob".into(), "Grep".into()]);
        options.output_schema = Some(prompts::quick_scan_output_schema());

        let prompt = prompts::quick_scan_prompt(context);
        match self.runner.run(&options, &prompt, cancel).await {
            Ok(outcome) => outcome
                .structured_output
                .map(|payload| parse_quick_scan_payload(&payload))
                .unwrap_or_default(),
            Err(e) => {
                warn!(pr = context.pr_number, error = %e, "quick scan failed");
                QuickScanResult::default()
            }
        }
    }

    /// Remaining specialist pool after the quick scan.
    fn select_passes(&self, context: &PrContext, scan: &QuickScanResult) -> Vec<ReviewPass> {
        let mut passes = vec![
            ReviewPass::Security,
            ReviewPass::Quality,
            ReviewPass::Logic,
            ReviewPass::CodebaseFit,
            ReviewPass::Structural,
        ];
        if !context.ai_bot_comments.is_empty() {
            passes.push(ReviewPass::AiCommentTriage);
        }
        if needs_deep_analysis(scan, context, self.settings.deep_analysis_threshold) {
            passes.push(ReviewPass::DeepAnalysis);
        }
        passes
    }

    async fn run_orchestrated_review(
        &self,
        context: &PrContext,
        worktree_path: &std::path::Path,
        passes: &[ReviewPass],
        quick_scan: &QuickScanResult,
        cancel: CancellationToken,
    ) -> Result<ParsedReview, String> {
        let sub_agents: Vec<SubAgentDefinition> = passes
            .iter()
            .map(|pass| SubAgentDefinition {
                name: pass.as_str().to_string(),
                description: format!("{} specialist review pass", pass.as_str()),
                prompt: prompts::specialist_prompt(*pass),
                tools: vec!["Read".into(), "Glob".into(), "Grep".into()],
            })
            .collect();

        let mut options = SessionOptions::new(
            self.model.clone(),
            AgentRole::ReviewOrchestrator,
            worktree_path.to_path_buf(),
        );
        options.output_schema = Some(prompts::review_output_schema());
        options.sub_agents = sub_agents;

        let prompt = prompts::orchestrator_prompt(context, passes, &quick_scan.summary());
        let outcome = self
            .runner
            .run(&options, &prompt, cancel)
            .await
            .map_err(|e| format!("review session failed: {e}"))?;

        let Some(payload) = outcome.structured_output else {
            return Err("review session produced no structured output".to_string());
        };
        Ok(parse_review_payload(&payload))
    }

    fn assemble_result(
        &self,
        context: &PrContext,
        findings: Vec<Finding>,
        structural_issues: Vec<StructuralIssue>,
        ai_comment_triages: Vec<AiCommentTriage>,
    ) -> PrReviewResult {
        let verdict = verdict::derive_verdict(&VerdictInput {
            findings: &findings,
            structural_issues: &structural_issues,
            ai_triages: &ai_comment_triages,
            ci: &context.ci_status,
            has_merge_conflicts: context.has_merge_conflicts,
            merge_state_status: &context.merge_state_status,
        });
        let bottom_line = verdict::bottom_line(&verdict, &context.ci_status, &findings);
        let risk_assessment = RiskAssessment::calculate(context, &findings, &structural_issues);

        let reviewed_file_blobs: BTreeMap<String, String> = context
            .changed_files
            .iter()
            .filter_map(|f| f.blob_sha.clone().map(|sha| (f.path.clone(), sha)))
            .collect();

        info!(
            pr = context.pr_number,
            findings = findings.len(),
            verdict = %verdict.verdict,
            "review complete"
        );

        PrReviewResult {
            id: format!(
                "review-{}-{}",
                context.pr_number,
                Utc::now().timestamp_millis()
            ),
            pr_number: context.pr_number,
            repo: context.repo.clone(),
            success: true,
            error: None,
            findings,
            structural_issues,
            ai_comment_triages,
            verdict: verdict.verdict,
            verdict_reasoning: verdict.reasoning,
            blockers: verdict.blockers,
            risk_assessment,
            bottom_line,
            reviewed_commit_sha: Some(context.head_sha.clone()),
            reviewed_file_blobs,
            is_followup_review: false,
            previous_review_id: None,
            resolved_findings: Vec::new(),
            unresolved_findings: Vec::new(),
            new_findings_since_last_review: Vec::new(),
            reviewed_at: Utc::now(),
        }
    }
}

type ParsedReview = (Vec<Finding>, Vec<StructuralIssue>, Vec<AiCommentTriage>);

/// What the quick-scan pass reported: an overall complexity call, areas
/// it wants looked at harder, and anything obviously wrong.
#[derive(Debug, Clone, Default)]
pub struct QuickScanResult {
    pub complexity: String,
    pub risk_areas: Vec<String>,
    pub findings: Vec<Finding>,
}

impl QuickScanResult {
    /// One-paragraph summary handed to the orchestrating agent.
    pub fn summary(&self) -> String {
        if self.complexity.is_empty() && self.risk_areas.is_empty() && self.findings.is_empty() {
            return String::new();
        }
        let mut summary = format!(
            "complexity: {}",
            if self.complexity.is_empty() {
                "unknown"
            } else {
                &self.complexity
            }
        );
        if !self.risk_areas.is_empty() {
            summary.push_str(&format!("; risk areas: {}", self.risk_areas.join(", ")));
        }
        if !self.findings.is_empty() {
            summary.push_str(&format!("; {} finding(s) flagged", self.findings.len()));
        }
        summary
    }
}

pub fn parse_quick_scan_payload(payload: &Value) -> QuickScanResult {
    QuickScanResult {
        complexity: payload
            .get("complexity")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_lowercase(),
        risk_areas: payload
            .get("risk_areas")
            .and_then(|v| v.as_array())
            .map(|areas| {
                areas
                    .iter()
                    .filter_map(|a| a.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
        findings: payload
            .get("findings")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(parse_finding).collect())
            .unwrap_or_default(),
    }
}

/// Deep analysis joins the pool when the change volume alone crosses the
/// ceiling, or when the quick scan judged the PR medium/high complexity
/// or named risk areas. The scan's content is a real input here, not
/// just an ordering guarantee.
pub fn needs_deep_analysis(
    scan: &QuickScanResult,
    context: &PrContext,
    threshold: usize,
) -> bool {
    context.total_changes() as usize > threshold
        || matches!(scan.complexity.as_str(), "high" | "medium")
        || !scan.risk_areas.is_empty()
}

/// Tolerant mapping from the agent's structured output into typed
/// findings; unknown severities and categories get conservative
/// defaults instead of dropping the record.
pub fn parse_review_payload(payload: &Value) -> ParsedReview {
    let findings = payload
        .get("findings")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(parse_finding).collect())
        .unwrap_or_default();
    let structural = payload
        .get("structural_issues")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(parse_structural).collect())
        .unwrap_or_default();
    let triages = payload
        .get("ai_comment_triages")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(parse_triage).collect())
        .unwrap_or_default();
    (findings, structural, triages)
}

fn parse_severity(raw: &str) -> ReviewSeverity {
    match raw.to_lowercase().as_str() {
        "critical" => ReviewSeverity::Critical,
        "high" => ReviewSeverity::High,
        "medium" => ReviewSeverity::Medium,
        _ => ReviewSeverity::Low,
    }
}

fn parse_category(raw: &str) -> ReviewCategory {
    match raw.to_lowercase().as_str() {
        "security" => ReviewCategory::Security,
        "style" => ReviewCategory::Style,
        "test" => ReviewCategory::Test,
        "docs" => ReviewCategory::Docs,
        "pattern" => ReviewCategory::Pattern,
        "performance" => ReviewCategory::Performance,
        "logic" => ReviewCategory::Logic,
        "codebase_fit" => ReviewCategory::CodebaseFit,
        "verification_failed" => ReviewCategory::VerificationFailed,
        "redundancy" => ReviewCategory::Redundancy,
        _ => ReviewCategory::Quality,
    }
}

fn parse_finding(raw: &Value) -> Option<Finding> {
    let title = raw.get("title").and_then(|v| v.as_str())?.to_string();
    let file = raw
        .get("file")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let line = raw.get("line").and_then(|v| v.as_u64()).map(|l| l as u32);
    let severity = parse_severity(raw.get("severity").and_then(|v| v.as_str()).unwrap_or(""));
    let category = parse_category(raw.get("category").and_then(|v| v.as_str()).unwrap_or(""));
    let source_agent = raw
        .get("source_agent")
        .and_then(|v| v.as_str())
        .unwrap_or("orchestrator")
        .to_string();

    Some(Finding {
        id: Finding::make_id(&file, line, &title),
        severity,
        category,
        title,
        description: raw
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        file,
        line,
        suggested_fix: raw
            .get("suggested_fix")
            .and_then(|v| v.as_str())
            .map(String::from),
        evidence: raw.get("evidence").and_then(|v| v.as_str()).map(String::from),
        validation_status: None,
        confidence: raw
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        source_agents: vec![source_agent],
        cross_validated: false,
    })
}

fn parse_structural(raw: &Value) -> Option<StructuralIssue> {
    Some(StructuralIssue {
        issue_type: raw.get("issue_type").and_then(|v| v.as_str())?.to_string(),
        severity: parse_severity(raw.get("severity").and_then(|v| v.as_str()).unwrap_or("")),
        title: raw
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        description: raw
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

fn parse_triage(raw: &Value) -> Option<AiCommentTriage> {
    let verdict = match raw
        .get("verdict")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase()
        .as_str()
    {
        "critical" => AiCommentVerdict::Critical,
        "important" => AiCommentVerdict::Important,
        "nice_to_have" => AiCommentVerdict::NiceToHave,
        "false_positive" => AiCommentVerdict::FalsePositive,
        "addressed" => AiCommentVerdict::Addressed,
        _ => AiCommentVerdict::Trivial,
    };
    Some(AiCommentTriage {
        tool_name: raw.get("tool_name").and_then(|v| v.as_str())?.to_string(),
        original_comment: raw
            .get("original_comment")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        verdict,
        reasoning: raw
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        file: raw.get("file").and_then(|v| v.as_str()).map(String::from),
        line: raw.get("line").and_then(|v| v.as_u64()).map(|l| l as u32),
    })
}

/// Synthesis is associative and commutative over per-pass findings:
/// duplicates by (file, line, normalized title) collapse, merging their
/// source agents and taking the highest severity.
pub fn dedup_findings(findings: Vec<Finding>) -> Vec<Finding> {
    let mut merged: Vec<Finding> = Vec::new();
    for finding in findings {
        if let Some(existing) = merged
            .iter_mut()
            .find(|f| f.dedup_key() == finding.dedup_key())
        {
            for agent in &finding.source_agents {
                if !existing.source_agents.contains(agent) {
                    existing.source_agents.push(agent.clone());
                }
            }
            existing.cross_validated = existing.source_agents.len() > 1;
            if finding.severity > existing.severity {
                existing.severity = finding.severity;
            }
            existing.confidence = existing.confidence.max(finding.confidence);
        } else {
            merged.push(finding);
        }
    }
    merged.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.file.cmp(&b.file)));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_parses_all_sections() {
        let payload = json!({
            "findings": [
                {"title": "SQL injection", "file": "db.py", "line": 10,
                 "severity": "critical", "category": "security", "source_agent": "security"}
            ],
            "structural_issues": [
                {"issue_type": "feature_creep", "severity": "high", "title": "unrelated refactor"}
            ],
            "ai_comment_triages": [
                {"tool_name": "coderabbit", "original_comment": "possible npe", "verdict": "critical"}
            ]
        });
        let (findings, structural, triages) = parse_review_payload(&payload);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, ReviewSeverity::Critical);
        assert_eq!(findings[0].category, ReviewCategory::Security);
        assert_eq!(structural.len(), 1);
        assert_eq!(triages[0].verdict, AiCommentVerdict::Critical);
    }

    #[test]
    fn unknown_severity_defaults_low() {
        let payload = json!({"findings": [
            {"title": "odd", "file": "a.rs", "severity": "catastrophic", "category": "mystery"}
        ]});
        let (findings, _, _) = parse_review_payload(&payload);
        assert_eq!(findings[0].severity, ReviewSeverity::Low);
        assert_eq!(findings[0].category, ReviewCategory::Quality);
    }

    #[test]
    fn dedup_merges_sources_and_keeps_max_severity() {
        let make = |severity, agent: &str| {
            let payload = json!({
                "title": "Unchecked unwrap", "file": "x.rs", "line": 5,
                "severity": severity, "category": "quality", "source_agent": agent
            });
            parse_finding(&payload).unwrap()
        };
        let deduped = dedup_findings(vec![
            make("medium", "quality"),
            make("high", "logic"),
            make("medium", "quick_scan"),
        ]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].severity, ReviewSeverity::High);
        assert!(deduped[0].cross_validated);
        assert_eq!(deduped[0].source_agents.len(), 3);
    }

    fn context_with_changes(additions: u64, deletions: u64) -> PrContext {
        PrContext {
            pr_number: 1,
            repo: "owner/repo".into(),
            head_sha: "head".into(),
            base_sha: "base".into(),
            head_branch: "feature".into(),
            base_branch: "main".into(),
            title: String::new(),
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
            ci_status: Default::default(),
            total_additions: additions,
            total_deletions: deletions,
        }
    }

    #[test]
    fn parses_quick_scan_payload() {
        let payload = json!({
            "complexity": "High",
            "risk_areas": ["src/auth", "migration scripts"],
            "findings": [
                {"title": "hardcoded secret", "file": "src/auth.rs", "line": 4,
                 "severity": "critical", "category": "security"}
            ]
        });
        let scan = parse_quick_scan_payload(&payload);
        assert_eq!(scan.complexity, "high");
        assert_eq!(scan.risk_areas.len(), 2);
        assert_eq!(scan.findings.len(), 1);
        assert!(scan.summary().contains("risk areas"));
    }

    #[test]
    fn small_high_risk_diff_triggers_deep_analysis() {
        // A tiny diff the scan flags must still get the deep pass.
        let context = context_with_changes(10, 2);
        let scan = QuickScanResult {
            complexity: "high".into(),
            risk_areas: vec![],
            findings: vec![],
        };
        assert!(needs_deep_analysis(&scan, &context, 200));

        let scan = QuickScanResult {
            complexity: "low".into(),
            risk_areas: vec!["src/auth".into()],
            findings: vec![],
        };
        assert!(needs_deep_analysis(&scan, &context, 200));
    }

    #[test]
    fn small_clean_diff_skips_deep_analysis() {
        let context = context_with_changes(10, 2);
        let scan = QuickScanResult {
            complexity: "low".into(),
            risk_areas: vec![],
            findings: vec![],
        };
        assert!(!needs_deep_analysis(&scan, &context, 200));
        // A failed scan degrades to the line-count rule alone.
        assert!(!needs_deep_analysis(&QuickScanResult::default(), &context, 200));
    }

    #[test]
    fn large_diff_triggers_deep_analysis_regardless_of_scan() {
        let context = context_with_changes(300, 50);
        let scan = QuickScanResult {
            complexity: "low".into(),
            risk_areas: vec![],
            findings: vec![],
        };
        assert!(needs_deep_analysis(&scan, &context, 200));
    }

    #[test]
    fn medium_complexity_also_triggers() {
        let context = context_with_changes(50, 10);
        let scan = QuickScanResult {
            complexity: "medium".into(),
            risk_areas: vec![],
            findings: vec![],
        };
        assert!(needs_deep_analysis(&scan, &context, 200));
    }

    #[test]
    fn dedup_is_order_insensitive_on_outcome() {
        let a = json!({"title": "Bug", "file": "x.rs", "line": 5, "severity": "high", "category": "logic", "source_agent": "a"});
        let b = json!({"title": "bug", "file": "x.rs", "line": 5, "severity": "medium", "category": "logic", "source_agent": "b"});
        let forward = dedup_findings(vec![
            parse_finding(&a).unwrap(),
            parse_finding(&b).unwrap(),
        ]);
        let reverse = dedup_findings(vec![
            parse_finding(&b).unwrap(),
            parse_finding(&a).unwrap(),
        ]);
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].severity, reverse[0].severity);
        let mut fa = forward[0].source_agents.clone();
        let mut ra = reverse[0].source_agents.clone();
        fa.sort();
        ra.sort();
        assert_eq!(fa, ra);
    }
}
