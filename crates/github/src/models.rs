use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ReviewSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewSeverity::Low => write!(f, "low"),
            ReviewSeverity::Medium => write!(f, "medium"),
            ReviewSeverity::High => write!(f, "high"),
            ReviewSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCategory {
    Security,
    Quality,
    Style,
    Test,
    Docs,
    Pattern,
    Performance,
    Logic,
    CodebaseFit,
    /// A claim in the PR that could not be verified against the code.
    VerificationFailed,
    /// Duplicate code or logic.
    Redundancy,
}

/// Specialist passes of the review pipeline. `quick_scan` always runs
/// first and decides whether `deep_analysis` joins the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPass {
    QuickScan,
    Security,
    Quality,
    Logic,
    CodebaseFit,
    AiCommentTriage,
    Structural,
    DeepAnalysis,
}

impl ReviewPass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewPass::QuickScan => "quick_scan",
            ReviewPass::Security => "security",
            ReviewPass::Quality => "quality",
            ReviewPass::Logic => "logic",
            ReviewPass::CodebaseFit => "codebase_fit",
            ReviewPass::AiCommentTriage => "ai_comment_triage",
            ReviewPass::Structural => "structural",
            ReviewPass::DeepAnalysis => "deep_analysis",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeVerdict {
    ReadyToMerge,
    MergeWithChanges,
    NeedsRevision,
    Blocked,
}

impl std::fmt::Display for MergeVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeVerdict::ReadyToMerge => write!(f, "ready_to_merge"),
            MergeVerdict::MergeWithChanges => write!(f, "merge_with_changes"),
            MergeVerdict::NeedsRevision => write!(f, "needs_revision"),
            MergeVerdict::Blocked => write!(f, "blocked"),
        }
    }
}

impl MergeVerdict {
    /// Ordering used by the monotonicity property: more blockers can
    /// only move a verdict toward Blocked.
    pub fn rank(&self) -> u8 {
        match self {
            MergeVerdict::ReadyToMerge => 0,
            MergeVerdict::MergeWithChanges => 1,
            MergeVerdict::NeedsRevision => 2,
            MergeVerdict::Blocked => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiCommentVerdict {
    Critical,
    Important,
    NiceToHave,
    Trivial,
    FalsePositive,
    /// Valid issue already fixed by a later commit.
    Addressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingResolution {
    Resolved,
    Unresolved,
    PartiallyResolved,
    /// Could not be checked; treated as unresolved for verdict purposes.
    CantVerify,
}

impl FindingResolution {
    pub fn counts_as_resolved(&self) -> bool {
        matches!(self, FindingResolution::Resolved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: ReviewSeverity,
    pub category: ReviewCategory,
    pub title: String,
    pub description: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<FindingResolution>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub source_agents: Vec<String>,
    #[serde(default)]
    pub cross_validated: bool,
}

fn default_confidence() -> f64 {
    0.5
}

impl Finding {
    /// Stable id from location and title, so the same finding keeps its
    /// identity across review rounds.
    pub fn make_id(file: &str, line: Option<u32>, title: &str) -> String {
        let key = format!("{file}:{}:{}", line.unwrap_or(0), title.to_lowercase());
        let digest = Sha256::digest(key.as_bytes());
        hex::encode(&digest[..6])
    }

    /// Dedup key: findings reported by several passes for the same spot
    /// collapse into one.
    pub fn dedup_key(&self) -> (String, u32, String) {
        (
            self.file.clone(),
            self.line.unwrap_or(0),
            self.title.trim().to_lowercase(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralIssue {
    pub issue_type: String,
    pub severity: ReviewSeverity,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiCommentTriage {
    pub tool_name: String,
    pub original_comment: String,
    pub verdict: AiCommentVerdict,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangedFileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: ChangedFileStatus,
    pub additions: u64,
    pub deletions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    /// Git blob SHA of the file's content at the PR head. Survives
    /// rebases: same bytes, same blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiState {
    Passing,
    Failing,
    Pending,
    AwaitingApproval,
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CiStatus {
    pub state: Option<CiState>,
    #[serde(default)]
    pub failed_checks: Vec<String>,
    /// Workflow runs awaiting maintainer approval (fork PRs).
    #[serde(default)]
    pub awaiting_approval: u32,
}

impl CiStatus {
    pub fn is_green(&self) -> bool {
        matches!(self.state, Some(CiState::Passing))
            && self.failed_checks.is_empty()
            && self.awaiting_approval == 0
    }
}

/// Snapshot of a pull request at review time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrContext {
    pub pr_number: u64,
    pub repo: String,
    pub head_sha: String,
    pub base_sha: String,
    pub head_branch: String,
    pub base_branch: String,
    pub title: String,
    pub description: String,
    pub author: String,
    #[serde(default)]
    pub changed_files: Vec<ChangedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_diff: Option<String>,
    /// True when the diff exceeded the provider's line threshold and was
    /// not fetched in full.
    #[serde(default)]
    pub diff_truncated: bool,
    #[serde(default)]
    pub related_files: Vec<String>,
    #[serde(default)]
    pub commits: Vec<CommitInfo>,
    #[serde(default)]
    pub ai_bot_comments: Vec<AiBotComment>,
    #[serde(default)]
    pub has_merge_conflicts: bool,
    #[serde(default)]
    pub merge_state_status: String,
    #[serde(default)]
    pub ci_status: CiStatus,
    #[serde(default)]
    pub total_additions: u64,
    #[serde(default)]
    pub total_deletions: u64,
}

impl PrContext {
    pub fn total_changes(&self) -> u64 {
        self.total_additions + self.total_deletions
    }

    pub fn is_branch_behind(&self) -> bool {
        self.merge_state_status == "BEHIND"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiBotComment {
    pub author: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub complexity: String,
    pub security_impact: String,
    pub scope_coherence: String,
}

impl RiskAssessment {
    pub fn calculate(
        context: &PrContext,
        findings: &[Finding],
        structural_issues: &[StructuralIssue],
    ) -> Self {
        let total = context.total_changes();
        let complexity = if total > 500 {
            "high"
        } else if total > 200 {
            "medium"
        } else {
            "low"
        };

        let security: Vec<&Finding> = findings
            .iter()
            .filter(|f| f.category == ReviewCategory::Security)
            .collect();
        let security_impact = if security
            .iter()
            .any(|f| f.severity == ReviewSeverity::Critical)
        {
            "critical"
        } else if security.iter().any(|f| f.severity == ReviewSeverity::High) {
            "medium"
        } else if !security.is_empty() {
            "low"
        } else {
            "none"
        };

        let scope: Vec<&StructuralIssue> = structural_issues
            .iter()
            .filter(|s| s.issue_type == "feature_creep" || s.issue_type == "scope_creep")
            .collect();
        let scope_coherence = if scope.iter().any(|s| {
            matches!(s.severity, ReviewSeverity::Critical | ReviewSeverity::High)
        }) {
            "poor"
        } else if !scope.is_empty() {
            "mixed"
        } else {
            "good"
        };

        Self {
            complexity: complexity.to_string(),
            security_impact: security_impact.to_string(),
            scope_coherence: scope_coherence.to_string(),
        }
    }
}

/// Persisted outcome of one review round. Append-only: follow-ups link
/// back via `previous_review_id` rather than rewriting history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrReviewResult {
    pub id: String,
    pub pr_number: u64,
    pub repo: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub structural_issues: Vec<StructuralIssue>,
    #[serde(default)]
    pub ai_comment_triages: Vec<AiCommentTriage>,
    pub verdict: MergeVerdict,
    pub verdict_reasoning: String,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub risk_assessment: RiskAssessment,
    #[serde(default)]
    pub bottom_line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_commit_sha: Option<String>,
    /// filename -> blob SHA at the reviewed head; the anchor for
    /// rebase-resistant follow-ups.
    #[serde(default)]
    pub reviewed_file_blobs: BTreeMap<String, String>,
    #[serde(default)]
    pub is_followup_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_review_id: Option<String>,
    #[serde(default)]
    pub resolved_findings: Vec<String>,
    #[serde(default)]
    pub unresolved_findings: Vec<String>,
    #[serde(default)]
    pub new_findings_since_last_review: Vec<String>,
    pub reviewed_at: DateTime<Utc>,
}

impl PrReviewResult {
    pub fn failed(pr_number: u64, repo: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: format!("review-{pr_number}-{}", Utc::now().timestamp_millis()),
            pr_number,
            repo: repo.into(),
            success: false,
            error: Some(error.into()),
            findings: Vec::new(),
            structural_issues: Vec::new(),
            ai_comment_triages: Vec::new(),
            verdict: MergeVerdict::NeedsRevision,
            verdict_reasoning: "Review did not complete".to_string(),
            blockers: Vec::new(),
            risk_assessment: RiskAssessment::default(),
            bottom_line: String::new(),
            reviewed_commit_sha: None,
            reviewed_file_blobs: BTreeMap::new(),
            is_followup_review: false,
            previous_review_id: None,
            resolved_findings: Vec::new(),
            unresolved_findings: Vec::new(),
            new_findings_since_last_review: Vec::new(),
            reviewed_at: Utc::now(),
        }
    }
}

/// Category assigned by issue triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageCategory {
    Bug,
    Feature,
    Documentation,
    Question,
    Duplicate,
    Spam,
    FeatureCreep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResult {
    pub issue_number: u64,
    pub category: TriageCategory,
    pub priority: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub response: String,
    pub triaged_at: DateTime<Utc>,
}

/// Lifecycle of an automatic issue fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoFixStatus {
    Pending,
    Analyzing,
    CreatingSpec,
    WaitingApproval,
    Building,
    QaReview,
    PrCreated,
    MergeConflict,
    Completed,
    Failed,
    Cancelled,
    Stale,
    RateLimited,
}

impl AutoFixStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AutoFixStatus::Completed | AutoFixStatus::Failed | AutoFixStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFixState {
    pub issue_number: u64,
    pub status: AutoFixStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(ReviewSeverity::Low < ReviewSeverity::Medium);
        assert!(ReviewSeverity::High < ReviewSeverity::Critical);
    }

    #[test]
    fn verdict_rank_is_monotone() {
        assert!(MergeVerdict::ReadyToMerge.rank() < MergeVerdict::NeedsRevision.rank());
        assert!(MergeVerdict::NeedsRevision.rank() < MergeVerdict::Blocked.rank());
    }

    #[test]
    fn finding_id_is_stable() {
        let a = Finding::make_id("src/auth.rs", Some(42), "SQL injection");
        let b = Finding::make_id("src/auth.rs", Some(42), "SQL injection");
        let c = Finding::make_id("src/auth.rs", Some(43), "SQL injection");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dedup_key_normalizes_title() {
        let mut finding = Finding {
            id: "x".into(),
            severity: ReviewSeverity::Low,
            category: ReviewCategory::Quality,
            title: "  Unused Variable ".into(),
            description: String::new(),
            file: "a.rs".into(),
            line: Some(3),
            suggested_fix: None,
            evidence: None,
            validation_status: None,
            confidence: 0.9,
            source_agents: vec![],
            cross_validated: false,
        };
        let key_a = finding.dedup_key();
        finding.title = "unused variable".into();
        assert_eq!(key_a, finding.dedup_key());
    }

    #[test]
    fn risk_assessment_thresholds() {
        let mut context = PrContext {
            pr_number: 1,
            repo: "o/r".into(),
            head_sha: "h".into(),
            base_sha: "b".into(),
            head_branch: "f".into(),
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
            merge_state_status: String::new(),
            ci_status: CiStatus::default(),
            total_additions: 600,
            total_deletions: 0,
        };
        let risk = RiskAssessment::calculate(&context, &[], &[]);
        assert_eq!(risk.complexity, "high");
        assert_eq!(risk.security_impact, "none");

        context.total_additions = 100;
        let risk = RiskAssessment::calculate(&context, &[], &[]);
        assert_eq!(risk.complexity, "low");
    }

    #[test]
    fn verdicts_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&MergeVerdict::ReadyToMerge).unwrap(),
            "\"ready_to_merge\""
        );
        assert_eq!(
            serde_json::to_string(&FindingResolution::CantVerify).unwrap(),
            "\"cant_verify\""
        );
    }
}
