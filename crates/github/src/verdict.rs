use serde::{Deserialize, Serialize};

use crate::models::{
    AiCommentTriage, AiCommentVerdict, CiStatus, Finding, MergeVerdict, ReviewCategory,
    ReviewSeverity, StructuralIssue,
};

pub const BRANCH_BEHIND_BLOCKER: &str =
    "Branch Behind: PR branch is behind the base branch and should be updated";
const BRANCH_BEHIND_REASONING: &str =
    "Branch is behind the base branch. Update the branch before merge.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub verdict: MergeVerdict,
    pub reasoning: String,
    pub blockers: Vec<String>,
}

pub struct VerdictInput<'a> {
    pub findings: &'a [Finding],
    pub structural_issues: &'a [StructuralIssue],
    pub ai_triages: &'a [AiCommentTriage],
    pub ci: &'a CiStatus,
    pub has_merge_conflicts: bool,
    pub merge_state_status: &'a str,
}

/// True for blockers produced by the CI overlay rather than code review.
/// Used by follow-ups to refresh stale CI verdicts.
pub fn is_ci_blocker(blocker: &str) -> bool {
    blocker.starts_with("CI Failed:") || blocker.starts_with("Workflows Pending:")
}

/// Shared verdict derivation for initial and follow-up reviews. Blockers
/// are collected in evaluation priority: merge conflicts, CI failures,
/// workflows awaiting approval, verification failures, redundancy,
/// security/critical findings, structural issues, critical AI comments.
pub fn derive_verdict(input: &VerdictInput<'_>) -> Verdict {
    let mut blockers = Vec::new();
    let is_branch_behind = input.merge_state_status == "BEHIND";

    if input.has_merge_conflicts {
        blockers.push(
            "Merge Conflicts: PR has conflicts with base branch that must be resolved"
                .to_string(),
        );
    } else if is_branch_behind {
        blockers.push(BRANCH_BEHIND_BLOCKER.to_string());
    }

    for check in &input.ci.failed_checks {
        blockers.push(format!("CI Failed: {check}"));
    }
    if input.ci.awaiting_approval > 0 {
        blockers.push(format!(
            "Workflows Pending: {} workflow(s) awaiting maintainer approval",
            input.ci.awaiting_approval
        ));
    }

    let critical: Vec<&Finding> = input
        .findings
        .iter()
        .filter(|f| f.severity == ReviewSeverity::Critical)
        .collect();
    let high = count_severity(input.findings, ReviewSeverity::High);
    let medium = count_severity(input.findings, ReviewSeverity::Medium);
    let low = count_severity(input.findings, ReviewSeverity::Low);

    let verification_failures: Vec<&Finding> = input
        .findings
        .iter()
        .filter(|f| f.category == ReviewCategory::VerificationFailed)
        .collect();
    let redundancy_issues: Vec<&Finding> = input
        .findings
        .iter()
        .filter(|f| {
            f.category == ReviewCategory::Redundancy
                && matches!(f.severity, ReviewSeverity::High | ReviewSeverity::Critical)
        })
        .collect();
    let security_critical: Vec<&Finding> = critical
        .iter()
        .copied()
        .filter(|f| f.category == ReviewCategory::Security)
        .collect();
    let structural_blockers: Vec<&StructuralIssue> = input
        .structural_issues
        .iter()
        .filter(|s| matches!(s.severity, ReviewSeverity::High | ReviewSeverity::Critical))
        .collect();
    let ai_critical: Vec<&AiCommentTriage> = input
        .ai_triages
        .iter()
        .filter(|t| t.verdict == AiCommentVerdict::Critical)
        .collect();

    for f in &verification_failures {
        blockers.push(format!(
            "Verification Failed: {} ({}:{})",
            f.title,
            f.file,
            f.line.unwrap_or(0)
        ));
    }
    for f in &redundancy_issues {
        blockers.push(format!(
            "Redundancy: {} ({}:{})",
            f.title,
            f.file,
            f.line.unwrap_or(0)
        ));
    }
    for f in &security_critical {
        blockers.push(format!(
            "Security: {} ({}:{})",
            f.title,
            f.file,
            f.line.unwrap_or(0)
        ));
    }
    for f in &critical {
        if f.category != ReviewCategory::Security
            && f.category != ReviewCategory::VerificationFailed
            && f.category != ReviewCategory::Redundancy
        {
            blockers.push(format!(
                "Critical: {} ({}:{})",
                f.title,
                f.file,
                f.line.unwrap_or(0)
            ));
        }
    }
    for s in &structural_blockers {
        blockers.push(format!("Structure: {}", s.title));
    }
    for t in &ai_critical {
        let summary: String = t.original_comment.chars().take(50).collect();
        blockers.push(format!("{}: {summary}", t.tool_name));
    }

    // Only the branch-behind entry present means no hard blocker.
    let hard_blockers = blockers.iter().any(|b| b != BRANCH_BEHIND_BLOCKER);

    let (verdict, reasoning) = if hard_blockers {
        if input.has_merge_conflicts {
            (
                MergeVerdict::Blocked,
                "Blocked: PR has merge conflicts with base branch. Resolve conflicts before merge."
                    .to_string(),
            )
        } else if !input.ci.failed_checks.is_empty() {
            (
                MergeVerdict::Blocked,
                format!(
                    "Blocked: {} CI check(s) failing. Fix CI before merge.",
                    input.ci.failed_checks.len()
                ),
            )
        } else if input.ci.awaiting_approval > 0 {
            (
                MergeVerdict::Blocked,
                format!(
                    "Blocked: {} workflow(s) awaiting approval. Approve workflows on GitHub to run CI checks.",
                    input.ci.awaiting_approval
                ),
            )
        } else if !verification_failures.is_empty() {
            (
                MergeVerdict::Blocked,
                format!(
                    "Blocked: Cannot verify {} claim(s) in PR. Evidence required before merge.",
                    verification_failures.len()
                ),
            )
        } else if !security_critical.is_empty() {
            (
                MergeVerdict::Blocked,
                format!(
                    "Blocked by {} security vulnerabilities",
                    security_critical.len()
                ),
            )
        } else if !redundancy_issues.is_empty() {
            (
                MergeVerdict::Blocked,
                format!(
                    "Blocked: {} redundant implementation(s) detected. Remove duplicates before merge.",
                    redundancy_issues.len()
                ),
            )
        } else if !critical.is_empty() {
            (
                MergeVerdict::Blocked,
                format!("Blocked by {} critical issues", critical.len()),
            )
        } else {
            (
                MergeVerdict::NeedsRevision,
                format!("{} issues must be addressed", blockers.len()),
            )
        }
    } else if is_branch_behind {
        let mut reasoning = BRANCH_BEHIND_REASONING.to_string();
        if high + medium > 0 {
            reasoning.push_str(&format!(
                " {} issue(s) must be addressed ({high} required, {medium} recommended).",
                high + medium
            ));
        }
        if low > 0 {
            reasoning.push_str(&format!(" {low} non-blocking suggestion(s) to consider."));
        }
        (MergeVerdict::NeedsRevision, reasoning)
    } else if high + medium > 0 {
        let mut reasoning = format!(
            "{} issue(s) must be addressed ({high} required, {medium} recommended)",
            high + medium
        );
        if low > 0 {
            reasoning.push_str(&format!(", {low} suggestions"));
        }
        (MergeVerdict::NeedsRevision, reasoning)
    } else if low > 0 {
        (
            MergeVerdict::ReadyToMerge,
            format!("No blocking issues. {low} non-blocking suggestion(s) to consider"),
        )
    } else {
        (
            MergeVerdict::ReadyToMerge,
            "No blocking issues found".to_string(),
        )
    };

    Verdict {
        verdict,
        reasoning,
        blockers,
    }
}

/// One-line summary, deterministic from verdict, CI, and issue counts.
/// "Ready once CI passes" only ever appears when nothing in the code
/// blocks the merge.
pub fn bottom_line(verdict: &Verdict, ci: &CiStatus, findings: &[Finding]) -> String {
    let code_blocking = findings
        .iter()
        .any(|f| matches!(f.severity, ReviewSeverity::High | ReviewSeverity::Critical));
    let ci_only_blockers =
        !verdict.blockers.is_empty() && verdict.blockers.iter().all(|b| is_ci_blocker(b));

    match verdict.verdict {
        MergeVerdict::ReadyToMerge => "Ready to merge".to_string(),
        MergeVerdict::Blocked if ci_only_blockers && !code_blocking => {
            "Ready once CI passes".to_string()
        }
        MergeVerdict::Blocked => match verdict.blockers.first() {
            Some(first) => format!("Blocked: {first}"),
            None => "Blocked".to_string(),
        },
        MergeVerdict::MergeWithChanges | MergeVerdict::NeedsRevision => {
            let required = findings
                .iter()
                .filter(|f| {
                    matches!(f.severity, ReviewSeverity::High | ReviewSeverity::Medium)
                })
                .count();
            if required > 0 {
                format!("Needs revision: {required} issue(s) to address")
            } else if ci.is_green() {
                "Needs revision".to_string()
            } else {
                "Needs revision; CI not green".to_string()
            }
        }
    }
}

fn count_severity(findings: &[Finding], severity: ReviewSeverity) -> usize {
    findings.iter().filter(|f| f.severity == severity).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CiState;

    fn finding(severity: ReviewSeverity, category: ReviewCategory) -> Finding {
        Finding {
            id: Finding::make_id("src/x.rs", Some(1), "issue"),
            severity,
            category,
            title: "issue".into(),
            description: String::new(),
            file: "src/x.rs".into(),
            line: Some(1),
            suggested_fix: None,
            evidence: None,
            validation_status: None,
            confidence: 0.9,
            source_agents: vec![],
            cross_validated: false,
        }
    }

    fn input<'a>(
        findings: &'a [Finding],
        ci: &'a CiStatus,
        conflicts: bool,
        merge_state: &'a str,
    ) -> VerdictInput<'a> {
        VerdictInput {
            findings,
            structural_issues: &[],
            ai_triages: &[],
            ci,
            has_merge_conflicts: conflicts,
            merge_state_status: merge_state,
        }
    }

    #[test]
    fn clean_pr_is_ready() {
        let ci = CiStatus {
            state: Some(CiState::Passing),
            ..Default::default()
        };
        let verdict = derive_verdict(&input(&[], &ci, false, "CLEAN"));
        assert_eq!(verdict.verdict, MergeVerdict::ReadyToMerge);
        assert!(verdict.blockers.is_empty());
    }

    #[test]
    fn low_findings_do_not_block() {
        let findings = vec![finding(ReviewSeverity::Low, ReviewCategory::Style)];
        let verdict = derive_verdict(&input(&findings, &CiStatus::default(), false, "CLEAN"));
        assert_eq!(verdict.verdict, MergeVerdict::ReadyToMerge);
    }

    #[test]
    fn medium_findings_need_revision() {
        let findings = vec![finding(ReviewSeverity::Medium, ReviewCategory::Quality)];
        let verdict = derive_verdict(&input(&findings, &CiStatus::default(), false, "CLEAN"));
        assert_eq!(verdict.verdict, MergeVerdict::NeedsRevision);
    }

    #[test]
    fn merge_conflicts_block_first() {
        let findings = vec![finding(ReviewSeverity::Low, ReviewCategory::Style)];
        let verdict = derive_verdict(&input(&findings, &CiStatus::default(), true, "DIRTY"));
        assert_eq!(verdict.verdict, MergeVerdict::Blocked);
        assert!(verdict.blockers[0].starts_with("Merge Conflicts"));
    }

    #[test]
    fn failing_ci_blocks_with_one_blocker_per_check() {
        let ci = CiStatus {
            state: Some(CiState::Failing),
            failed_checks: vec!["unit-tests".into(), "lint".into()],
            awaiting_approval: 0,
        };
        let verdict = derive_verdict(&input(&[], &ci, false, "CLEAN"));
        assert_eq!(verdict.verdict, MergeVerdict::Blocked);
        assert!(verdict.blockers.contains(&"CI Failed: unit-tests".to_string()));
        assert!(verdict.blockers.contains(&"CI Failed: lint".to_string()));
    }

    #[test]
    fn workflows_awaiting_approval_block() {
        let ci = CiStatus {
            state: Some(CiState::AwaitingApproval),
            failed_checks: vec![],
            awaiting_approval: 2,
        };
        let verdict = derive_verdict(&input(&[], &ci, false, "CLEAN"));
        assert_eq!(verdict.verdict, MergeVerdict::Blocked);
        assert!(verdict.blockers[0].starts_with("Workflows Pending"));
    }

    #[test]
    fn branch_behind_is_needs_revision_not_blocked() {
        let verdict = derive_verdict(&input(&[], &CiStatus::default(), false, "BEHIND"));
        assert_eq!(verdict.verdict, MergeVerdict::NeedsRevision);
        assert_eq!(verdict.blockers, vec![BRANCH_BEHIND_BLOCKER.to_string()]);
    }

    #[test]
    fn critical_security_blocks() {
        let findings = vec![finding(ReviewSeverity::Critical, ReviewCategory::Security)];
        let verdict = derive_verdict(&input(&findings, &CiStatus::default(), false, "CLEAN"));
        assert_eq!(verdict.verdict, MergeVerdict::Blocked);
        assert!(verdict.blockers[0].starts_with("Security:"));
        assert!(verdict.reasoning.contains("security"));
    }

    #[test]
    fn verification_failure_blocks_at_any_severity() {
        let findings = vec![finding(
            ReviewSeverity::Low,
            ReviewCategory::VerificationFailed,
        )];
        let verdict = derive_verdict(&input(&findings, &CiStatus::default(), false, "CLEAN"));
        assert_eq!(verdict.verdict, MergeVerdict::Blocked);
        assert!(verdict.blockers[0].starts_with("Verification Failed"));
    }

    #[test]
    fn high_redundancy_blocks_low_does_not() {
        let high = vec![finding(ReviewSeverity::High, ReviewCategory::Redundancy)];
        let verdict = derive_verdict(&input(&high, &CiStatus::default(), false, "CLEAN"));
        assert_eq!(verdict.verdict, MergeVerdict::Blocked);

        let low = vec![finding(ReviewSeverity::Low, ReviewCategory::Redundancy)];
        let verdict = derive_verdict(&input(&low, &CiStatus::default(), false, "CLEAN"));
        assert_eq!(verdict.verdict, MergeVerdict::ReadyToMerge);
    }

    #[test]
    fn adding_blockers_never_improves_verdict() {
        let base_findings = vec![finding(ReviewSeverity::Medium, ReviewCategory::Quality)];
        let base = derive_verdict(&input(&base_findings, &CiStatus::default(), false, "CLEAN"));

        let ci = CiStatus {
            state: Some(CiState::Failing),
            failed_checks: vec!["build".into()],
            awaiting_approval: 0,
        };
        let with_ci = derive_verdict(&input(&base_findings, &ci, false, "CLEAN"));
        assert!(with_ci.verdict.rank() >= base.verdict.rank());

        let with_conflicts = derive_verdict(&input(&base_findings, &ci, true, "DIRTY"));
        assert!(with_conflicts.verdict.rank() >= with_ci.verdict.rank());
    }

    #[test]
    fn bottom_line_ready_once_ci_passes_only_without_code_blockers() {
        let ci = CiStatus {
            state: Some(CiState::Failing),
            failed_checks: vec!["unit-tests".into()],
            awaiting_approval: 0,
        };
        let verdict = derive_verdict(&input(&[], &ci, false, "CLEAN"));
        assert_eq!(bottom_line(&verdict, &ci, &[]), "Ready once CI passes");

        let findings = vec![finding(ReviewSeverity::Critical, ReviewCategory::Logic)];
        let verdict = derive_verdict(&input(&findings, &ci, false, "CLEAN"));
        assert_ne!(bottom_line(&verdict, &ci, &findings), "Ready once CI passes");
    }
}
