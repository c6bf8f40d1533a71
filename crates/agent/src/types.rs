use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::roles::AgentRole;

/// One message on an agent session's event stream.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    AssistantText(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        is_error: bool,
        content: String,
    },
    /// Schema-validated payload; emitted at most once per session.
    StructuredOutput(serde_json::Value),
    Result {
        subtype: ResultSubtype,
        is_error: bool,
        duration_ms: u64,
        num_turns: u32,
        total_cost_usd: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    ErrorMaxTurns,
    ErrorDuringExecution,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for ResultSubtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultSubtype::Success => write!(f, "success"),
            ResultSubtype::ErrorMaxTurns => write!(f, "error_max_turns"),
            ResultSubtype::ErrorDuringExecution => write!(f, "error_during_execution"),
            ResultSubtype::Other => write!(f, "other"),
        }
    }
}

/// A specialist sub-agent the orchestrating agent may delegate to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentDefinition {
    pub name: String,
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Per-session parameters. Each session gets a fresh context; nothing
/// carries over between sessions.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model: String,
    pub role: AgentRole,
    /// Filesystem surface for the session; the agent may not read or
    /// write outside this root.
    pub project_root: PathBuf,
    pub thinking_budget: Option<u32>,
    pub max_turns: Option<u32>,
    /// Overrides the role's tool table when set.
    pub allowed_tools: Option<Vec<String>>,
    /// JSON schema the final output must validate against.
    pub output_schema: Option<serde_json::Value>,
    pub sub_agents: Vec<SubAgentDefinition>,
}

impl SessionOptions {
    pub fn new(model: impl Into<String>, role: AgentRole, project_root: PathBuf) -> Self {
        Self {
            model: model.into(),
            role,
            project_root,
            thinking_budget: None,
            max_turns: None,
            allowed_tools: None,
            output_schema: None,
            sub_agents: Vec::new(),
        }
    }

    pub fn effective_tools(&self) -> Vec<String> {
        match &self.allowed_tools {
            Some(tools) => tools.clone(),
            None => self.role.allowed_tools().iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Final accounting for a completed session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub subtype: Option<ResultSubtype>,
    pub is_error: bool,
    pub num_turns: u32,
    pub duration_ms: u64,
    pub total_cost_usd: f64,
    pub final_text: String,
    pub structured_output: Option<serde_json::Value>,
}

impl SessionOutcome {
    pub fn succeeded(&self) -> bool {
        !self.is_error && matches!(self.subtype, Some(ResultSubtype::Success))
    }
}
