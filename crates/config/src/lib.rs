use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the state directory kept at the root of a managed repository.
pub const STATE_DIR: &str = ".autoforge";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub git: GitSettings,
    #[serde(default)]
    pub worktrees: WorktreeSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub review: ReviewSettings,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_planning_retries() -> u32 {
    3
}

fn default_iteration_delay_secs() -> u64 {
    2
}

fn default_status_debounce_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Failed attempts before a subtask is marked stuck.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_planning_retries")]
    pub max_planning_retries: u32,
    /// Hard cap on loop iterations; None for unlimited.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default = "default_iteration_delay_secs")]
    pub iteration_delay_secs: u64,
    #[serde(default = "default_status_debounce_ms")]
    pub status_debounce_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_planning_retries: default_max_planning_retries(),
            max_iterations: None,
            iteration_delay_secs: default_iteration_delay_secs(),
            status_debounce_ms: default_status_debounce_ms(),
        }
    }
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_max_structured_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// External agent binary spawned per session.
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-phase model overrides keyed by phase name (planning, coding, ...).
    #[serde(default)]
    pub phase_models: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    #[serde(default)]
    pub phase_thinking_budgets: std::collections::HashMap<String, u32>,
    #[serde(default = "default_max_structured_retries")]
    pub max_structured_output_retries: u32,
    /// Upper wall-clock bound for one agent session, in seconds.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

fn default_agent_binary() -> String {
    "claude".to_string()
}

fn default_session_timeout_secs() -> u64 {
    3600
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            model: default_model(),
            phase_models: Default::default(),
            thinking_budget: None,
            phase_thinking_budgets: Default::default(),
            max_structured_output_retries: default_max_structured_retries(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

impl AgentSettings {
    /// Model for a phase, falling back to the session default.
    pub fn model_for_phase(&self, phase: &str) -> &str {
        self.phase_models
            .get(phase)
            .map(String::as_str)
            .unwrap_or(&self.model)
    }

    pub fn thinking_budget_for_phase(&self, phase: &str) -> Option<u32> {
        self.phase_thinking_budgets
            .get(phase)
            .copied()
            .or(self.thinking_budget)
    }
}

fn default_git_timeout_secs() -> u64 {
    30
}

fn default_git_network_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSettings {
    #[serde(default = "default_git_timeout_secs")]
    pub timeout_secs: u64,
    /// Operations that may touch the network (fetch, worktree add of a
    /// remote sha) get a longer bound.
    #[serde(default = "default_git_network_timeout_secs")]
    pub network_timeout_secs: u64,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_git_timeout_secs(),
            network_timeout_secs: default_git_network_timeout_secs(),
        }
    }
}

fn default_max_worktrees() -> usize {
    10
}

fn default_worktree_max_age_days() -> f64 {
    7.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSettings {
    #[serde(default = "default_max_worktrees")]
    pub max_count: usize,
    #[serde(default = "default_worktree_max_age_days")]
    pub max_age_days: f64,
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        Self {
            max_count: default_max_worktrees(),
            max_age_days: default_worktree_max_age_days(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetrySettings {
    /// Exponential backoff for the given 1-based attempt, capped at the max.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        self.initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_backoff_ms)
    }
}

fn default_github_capacity() -> u32 {
    5000
}

fn default_github_refill_rate() -> f64 {
    1.4
}

fn default_cost_limit_usd() -> f64 {
    10.0
}

fn default_lock_wait_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// GitHub authenticated quota: 5000 requests/hour.
    #[serde(default = "default_github_capacity")]
    pub github_capacity: u32,
    #[serde(default = "default_github_refill_rate")]
    pub github_refill_rate: f64,
    /// Hard dollar cap for model usage per run.
    #[serde(default = "default_cost_limit_usd")]
    pub cost_limit_usd: f64,
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            github_capacity: default_github_capacity(),
            github_refill_rate: default_github_refill_rate(),
            cost_limit_usd: default_cost_limit_usd(),
            lock_wait_secs: default_lock_wait_secs(),
        }
    }
}

fn default_diff_truncation_lines() -> usize {
    20_000
}

fn default_archive_keep_per_pr() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSettings {
    /// Review PRs authored by the reviewing bot itself.
    #[serde(default)]
    pub review_own_prs: bool,
    /// Changed-line volume above which the deep-analysis pass joins the
    /// review regardless of the quick scan's assessment. A scan that
    /// reports medium/high complexity or risk areas triggers it below
    /// this ceiling too.
    #[serde(default = "default_deep_analysis_threshold")]
    pub deep_analysis_threshold: usize,
    #[serde(default = "default_diff_truncation_lines")]
    pub diff_truncation_lines: usize,
    #[serde(default = "default_archive_keep_per_pr")]
    pub archive_keep_per_pr: usize,
    /// Run the finding-validator agent on unresolved findings during
    /// follow-up reviews.
    #[serde(default)]
    pub validate_findings: bool,
}

fn default_deep_analysis_threshold() -> usize {
    200
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            review_own_prs: false,
            deep_analysis_threshold: default_deep_analysis_threshold(),
            diff_truncation_lines: default_diff_truncation_lines(),
            archive_keep_per_pr: default_archive_keep_per_pr(),
            validate_findings: false,
        }
    }
}

impl Config {
    /// User-level config directory (`~/.config/autoforge` on Linux).
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("autoforge")
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("autoforge")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load user config; a project-local file, when present, takes
    /// precedence wholesale. Missing files yield defaults; malformed
    /// files are an error.
    pub fn load(project_root: Option<&Path>) -> Result<Self> {
        let mut config = Self::load_file(&Self::config_path())?.unwrap_or_default();

        if let Some(root) = project_root {
            let local = root.join(STATE_DIR).join("config.toml");
            if let Some(overlay) = Self::load_file(&local)? {
                config = overlay;
            }
        }

        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Invalid config at {}", path.display()))?;
        Ok(Some(config))
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
