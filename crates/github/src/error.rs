#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("gh {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("gh {command} timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("GitHub rate limit exceeded")]
    RateLimitExceeded,

    #[error("Model cost budget exhausted: spent ${spent:.2} of ${limit:.2}")]
    CostLimitExceeded { spent: f64, limit: f64 },

    #[error("Unexpected response shape: {0}")]
    Parse(String),

    #[error("Failed to run gh: {0}")]
    Io(#[from] std::io::Error),
}

impl GitHubError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GitHubError::Timeout { .. } | GitHubError::RateLimitExceeded => true,
            GitHubError::CommandFailed {
                exit_code, stderr, ..
            } => {
                let s = stderr.to_lowercase();
                // Transient signatures; 4xx validation errors are not.
                s.contains("http 5")
                    || s.contains("timeout")
                    || s.contains("connection reset")
                    || *exit_code == -1
            }
            // Cost exhaustion is a hard stop, never retried.
            GitHubError::CostLimitExceeded { .. } => false,
            _ => false,
        }
    }

    /// Rate-limit language in stderr maps 403/429 responses onto the
    /// typed error the caller backs off on.
    pub fn from_gh_failure(command: String, exit_code: i32, stderr: String) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("rate limit")
            || lower.contains("http 403")
            || lower.contains("http 429")
        {
            return GitHubError::RateLimitExceeded;
        }
        GitHubError::CommandFailed {
            command,
            exit_code,
            stderr,
        }
    }
}
