#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent stream closed before a result message")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session timed out after {0}s")]
    Timeout(u64),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Agent session failed: {subtype}")]
    SessionFailed { subtype: String },

    #[error("error_max_structured_output_retries: no schema-valid output after {attempts} attempts")]
    MaxStructuredOutputRetries { attempts: u32 },
}

impl AgentError {
    /// Transient failures the orchestrator may retry with a fresh session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::StreamClosed
                | AgentError::Timeout(_)
                | AgentError::SessionFailed { .. }
        )
    }
}
