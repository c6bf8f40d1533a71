use crate::models::{PrContext, ReviewPass};

/// System-style briefing for one specialist pass.
pub fn specialist_prompt(pass: ReviewPass) -> String {
    let focus = match pass {
        ReviewPass::QuickScan => {
            "Skim the whole diff quickly. Flag anything that obviously needs deeper \
             attention and say whether a deep-analysis pass is warranted."
        }
        ReviewPass::Security => {
            "Hunt for vulnerabilities: injection, authn/authz gaps, secrets in code, \
             unsafe deserialization, path traversal, SSRF. Report only real exposure."
        }
        ReviewPass::Quality => {
            "Judge code quality: error handling, naming, duplication, dead code, \
             missing tests for changed behavior."
        }
        ReviewPass::Logic => {
            "Trace the changed logic for correctness: off-by-one, inverted conditions, \
             unhandled edge cases, race conditions, broken invariants."
        }
        ReviewPass::CodebaseFit => {
            "Compare the changes against the surrounding codebase: inconsistent \
             patterns, APIs that already exist, conventions being violated."
        }
        ReviewPass::AiCommentTriage => {
            "Other AI tools left review comments on this PR. Verify each one against \
             the code: classify as critical, important, nice_to_have, trivial, \
             false_positive, or addressed."
        }
        ReviewPass::Structural => {
            "Assess PR structure: feature creep, scope creep, unrelated changes mixed \
             in, architecture concerns, PR size."
        }
        ReviewPass::DeepAnalysis => {
            "Take the time to read every changed file in full, including surrounding \
             context. Look for subtle interactions the quick passes would miss."
        }
    };
    format!(
        "You are the {} reviewer for a pull request. {focus} \
         Report findings with file, line, severity (critical/high/medium/low), a short \
         title, and concrete evidence. Do not report style nits as high severity.",
        pass.as_str()
    )
}

/// Prompt for the standalone quick-scan pass that runs before the
/// orchestrated specialists and decides whether deep analysis is needed.
pub fn quick_scan_prompt(context: &PrContext) -> String {
    let mut prompt = format!(
        "Quick scan of pull request #{} in {} ({} changed files, +{} -{}).\n\n{}\n\n",
        context.pr_number,
        context.repo,
        context.changed_files.len(),
        context.total_additions,
        context.total_deletions,
        specialist_prompt(ReviewPass::QuickScan),
    );
    prompt.push_str("Changed files:\n");
    for file in &context.changed_files {
        prompt.push_str(&format!(
            "- {} (+{} -{})\n",
            file.path, file.additions, file.deletions
        ));
    }
    prompt.push_str(
        "\nRespond in structured output with `complexity` (high, medium, or low), \
         `risk_areas` (files or subsystems that deserve a deeper look; empty when \
         nothing stands out), and any immediately visible `findings`.",
    );
    prompt
}

pub fn quick_scan_output_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["complexity"],
        "properties": {
            "complexity": {"type": "string"},
            "risk_areas": {"type": "array", "items": {"type": "string"}},
            "findings": {"type": "array", "items": {
                "type": "object",
                "required": ["title", "file", "severity", "category"],
                "properties": {
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "file": {"type": "string"},
                    "line": {"type": "integer"},
                    "severity": {"type": "string"},
                    "category": {"type": "string"},
                    "evidence": {"type": "string"},
                    "confidence": {"type": "number"}
                }
            }}
        }
    })
}

/// Prompt for the orchestrating review agent that delegates to the
/// specialist sub-agents and assembles the structured result.
pub fn orchestrator_prompt(
    context: &PrContext,
    passes: &[ReviewPass],
    quick_scan_summary: &str,
) -> String {
    let mut prompt = format!(
        "Review pull request #{} in {}.\n\n\
         Title: {}\n\
         Author: {}\n\
         Branch: {} -> {}\n\
         Changed files ({}):\n",
        context.pr_number,
        context.repo,
        context.title,
        context.author,
        context.head_branch,
        context.base_branch,
        context.changed_files.len(),
    );
    for file in &context.changed_files {
        prompt.push_str(&format!(
            "- {} (+{} -{})\n",
            file.path, file.additions, file.deletions
        ));
    }
    if context.diff_truncated {
        prompt.push_str(
            "\nThe full diff was too large to attach; read the files in the worktree \
             directly.\n",
        );
    }
    if !context.description.is_empty() {
        prompt.push_str(&format!("\nPR description:\n{}\n", context.description));
    }
    if !context.ai_bot_comments.is_empty() {
        prompt.push_str(&format!(
            "\n{} comments from other AI review tools are attached for triage.\n",
            context.ai_bot_comments.len()
        ));
    }

    if !quick_scan_summary.is_empty() {
        prompt.push_str(&format!(
            "\nA quick scan already ran:\n{quick_scan_summary}\n"
        ));
    }

    prompt.push_str(
        "\nThe working directory is a checkout of the PR head commit. Delegate to \
         the specialist sub-agents: ",
    );
    prompt.push_str(
        &passes
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    );
    prompt.push_str(
        ".\n\nAssemble every specialist's verified findings into the structured \
         output: `findings`, `structural_issues`, and `ai_comment_triages`. Merge \
         duplicates and drop anything a specialist could not substantiate.",
    );
    prompt
}

/// Prompt for re-checking one unresolved finding during a follow-up.
pub fn finding_validator_prompt(
    title: &str,
    file: &str,
    line: Option<u32>,
    description: &str,
) -> String {
    format!(
        "A previous review reported this finding:\n\n\
         {title}\n\
         Location: {file}:{}\n\
         {description}\n\n\
         Re-examine the current code at that location. Respond in structured output \
         with `status`: \"valid\" if the problem still exists, \"false_positive\" if \
         the original finding was wrong, or \"needs_human\" if you cannot decide. \
         Include one sentence of `reasoning`.",
        line.unwrap_or(0)
    )
}

/// JSON schema for the orchestrated review's structured output.
pub fn review_output_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["findings"],
        "properties": {
            "findings": {"type": "array", "items": {
                "type": "object",
                "required": ["title", "file", "severity", "category"],
                "properties": {
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "file": {"type": "string"},
                    "line": {"type": "integer"},
                    "severity": {"type": "string"},
                    "category": {"type": "string"},
                    "suggested_fix": {"type": "string"},
                    "evidence": {"type": "string"},
                    "confidence": {"type": "number"},
                    "source_agent": {"type": "string"}
                }
            }},
            "structural_issues": {"type": "array", "items": {
                "type": "object",
                "required": ["issue_type", "severity", "title"],
                "properties": {
                    "issue_type": {"type": "string"},
                    "severity": {"type": "string"},
                    "title": {"type": "string"},
                    "description": {"type": "string"}
                }
            }},
            "ai_comment_triages": {"type": "array", "items": {
                "type": "object",
                "required": ["tool_name", "original_comment", "verdict"],
                "properties": {
                    "tool_name": {"type": "string"},
                    "original_comment": {"type": "string"},
                    "verdict": {"type": "string"},
                    "reasoning": {"type": "string"}
                }
            }}
        }
    })
}

pub fn validator_output_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["status"],
        "properties": {
            "status": {"type": "string"},
            "reasoning": {"type": "string"}
        }
    })
}
