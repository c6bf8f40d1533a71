use crate::plan::{Phase, Subtask};

/// Prompt for a planning session: analyze the spec and write the
/// implementation plan file.
pub fn build_planner_prompt(spec_content: &str, retry_context: Option<&str>) -> String {
    let mut prompt = format!(
        "You are the planning agent for an autonomous build. Analyze the following \
         specification and write `implementation_plan.json` in the current spec directory.\n\n\
         Specification:\n{spec_content}\n\n\
         The plan must be a JSON object with:\n\
         - `feature`: one-line summary of what is being built\n\
         - `workflow_type`: one of feature, refactor, investigation, migration, simple\n\
         - `phases`: ordered array; each phase has `id`, `name`, and `subtasks`\n\
         - each subtask has `id` (unique), `description` (specific and actionable), \
         and `status` set to \"pending\"\n\n\
         Subtasks must be independently completable and ordered by dependency. \
         Prefer few, well-scoped subtasks over many fragments."
    );
    if let Some(errors) = retry_context {
        prompt.push_str(&format!(
            "\n\nYour previous plan failed validation. Fix these issues:\n{errors}"
        ));
    }
    prompt
}

/// Prompt for one coding session bound to a single subtask.
pub fn build_coder_prompt(
    spec_content: &str,
    phase: &Phase,
    subtask: &Subtask,
    attempt: u32,
    attempt_hints: &[String],
    memory_hints: Option<&str>,
    human_input: Option<&str>,
) -> String {
    let mut prompt = format!(
        "You are the coding agent for an autonomous build. Work on exactly one subtask, \
         then commit your changes with a descriptive message.\n\n\
         Specification:\n{spec_content}\n\n\
         Current phase: {} ({})\n\
         Subtask {}: {}\n\n\
         Rules:\n\
         - Implement only this subtask; do not start other subtasks.\n\
         - Run the project's tests or checks for the code you touched.\n\
         - Finish with a git commit. A session that ends without a commit counts as a \
         failed attempt.",
        phase.name, phase.id, subtask.id, subtask.description
    );

    if attempt > 1 {
        prompt.push_str(&format!(
            "\n\nThis is attempt {attempt} for this subtask. Earlier attempts failed."
        ));
        if !attempt_hints.is_empty() {
            prompt.push_str("\nWhat went wrong before:");
            for hint in attempt_hints {
                prompt.push_str(&format!("\n- {hint}"));
            }
            prompt.push_str("\nTry a different approach this time.");
        }
    }

    if let Some(hints) = memory_hints {
        prompt.push_str(&format!(
            "\n\nNotes from earlier sessions in this codebase:\n{hints}"
        ));
    }

    if let Some(input) = human_input {
        prompt.push_str(&format!(
            "\n\nAdditional instructions from a human reviewer:\n{input}"
        ));
    }

    prompt
}

/// Prompt for the QA review pass over a completed build.
pub fn build_qa_prompt(spec_content: &str) -> String {
    format!(
        "You are the QA agent. Verify the implementation against the specification below.\n\n\
         Specification:\n{spec_content}\n\n\
         Checks:\n\
         1. Run the test suite and report failures.\n\
         2. Run lint/type checks if the project has them.\n\
         3. Verify each acceptance criterion in the spec.\n\n\
         Write your findings to `qa_report.md`: a PASS/FAIL verdict first, then one \
         section per failed check with reproduction steps. If everything passes, say so \
         explicitly."
    )
}

/// Prompt for a QA fix session driven by an existing fix request.
pub fn build_qa_fixer_prompt(fix_request: &str) -> String {
    format!(
        "You are the fix agent. Address every issue in the QA fix request below, then \
         commit.\n\n{fix_request}\n\n\
         Fix only what the report names; do not refactor unrelated code."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SubtaskStatus;

    fn phase_and_subtask() -> (Phase, Subtask) {
        (
            Phase {
                id: "phase-1".into(),
                name: "Backend".into(),
                subtasks: vec![],
            },
            Subtask {
                id: "1.1".into(),
                description: "add endpoint".into(),
                status: SubtaskStatus::Pending,
                extra: Default::default(),
            },
        )
    }

    #[test]
    fn coder_prompt_names_subtask() {
        let (phase, subtask) = phase_and_subtask();
        let prompt = build_coder_prompt("spec body", &phase, &subtask, 1, &[], None, None);
        assert!(prompt.contains("Subtask 1.1: add endpoint"));
        assert!(!prompt.contains("attempt"));
    }

    #[test]
    fn retry_prompt_carries_hints() {
        let (phase, subtask) = phase_and_subtask();
        let hints = vec!["tests failed".to_string()];
        let prompt = build_coder_prompt("spec", &phase, &subtask, 2, &hints, None, None);
        assert!(prompt.contains("attempt 2"));
        assert!(prompt.contains("tests failed"));
    }

    #[test]
    fn memory_hints_are_included() {
        let (phase, subtask) = phase_and_subtask();
        let prompt = build_coder_prompt(
            "spec",
            &phase,
            &subtask,
            1,
            &[],
            Some("Known gotchas:\n- auth tests need the fixture DB"),
            None,
        );
        assert!(prompt.contains("fixture DB"));
    }

    #[test]
    fn planner_retry_context_appended() {
        let prompt = build_planner_prompt("spec", Some("missing `status`"));
        assert!(prompt.contains("failed validation"));
        assert!(prompt.contains("missing `status`"));
    }
}
