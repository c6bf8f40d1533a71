use serde::{Deserialize, Serialize};

/// Closed set of agent roles. Each role maps to a fixed tool table; the
/// session advertises exactly that surface to the external agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Coder,
    QaReviewer,
    QaFixer,
    ReviewOrchestrator,
    FindingValidator,
    Triage,
    Merger,
}

const READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep"];

const PLANNER_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Write"];

const CODER_TOOLS: &[&str] = &["Read", "Write", "Edit", "Glob", "Grep", "Bash"];

const QA_REVIEWER_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash"];

const REVIEW_ORCHESTRATOR_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash", "Task"];

const MERGER_TOOLS: &[&str] = &["Read"];

impl AgentRole {
    /// Permitted tool set, as a static table.
    pub fn allowed_tools(&self) -> &'static [&'static str] {
        match self {
            AgentRole::Planner => PLANNER_TOOLS,
            AgentRole::Coder | AgentRole::QaFixer => CODER_TOOLS,
            AgentRole::QaReviewer => QA_REVIEWER_TOOLS,
            AgentRole::ReviewOrchestrator => REVIEW_ORCHESTRATOR_TOOLS,
            AgentRole::FindingValidator | AgentRole::Triage => READ_ONLY_TOOLS,
            AgentRole::Merger => MERGER_TOOLS,
        }
    }

    /// Roles that never mutate the working tree.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            AgentRole::FindingValidator | AgentRole::Triage | AgentRole::Merger
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Coder => "coder",
            AgentRole::QaReviewer => "qa_reviewer",
            AgentRole::QaFixer => "qa_fixer",
            AgentRole::ReviewOrchestrator => "review_orchestrator",
            AgentRole::FindingValidator => "finding_validator",
            AgentRole::Triage => "triage",
            AgentRole::Merger => "merger",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coder_can_run_bash() {
        assert!(AgentRole::Coder.allowed_tools().contains(&"Bash"));
    }

    #[test]
    fn validator_is_read_only() {
        assert!(AgentRole::FindingValidator.is_read_only());
        for tool in AgentRole::FindingValidator.allowed_tools() {
            assert!(!matches!(*tool, "Write" | "Edit" | "Bash"));
        }
    }

    #[test]
    fn only_orchestrator_delegates() {
        for role in [
            AgentRole::Planner,
            AgentRole::Coder,
            AgentRole::QaReviewer,
            AgentRole::QaFixer,
            AgentRole::FindingValidator,
            AgentRole::Triage,
            AgentRole::Merger,
        ] {
            assert!(!role.allowed_tools().contains(&"Task"));
        }
        assert!(AgentRole::ReviewOrchestrator.allowed_tools().contains(&"Task"));
    }
}
