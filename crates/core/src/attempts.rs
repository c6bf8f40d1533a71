use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

const HISTORY_FILE: &str = "attempt_history.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempted_at: DateTime<Utc>,
    pub session_number: u32,
    pub outcome: String,
    /// Short description of what went wrong, fed back into the next
    /// attempt's prompt as a hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_summary: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskAttempts {
    /// Append-only.
    pub attempts: Vec<AttemptRecord>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckSubtask {
    pub subtask_id: String,
    pub reason: String,
    pub marked_at: DateTime<Utc>,
}

/// Per-spec record of how many times each subtask was attempted and which
/// ones exhausted their budget. Stuck entries never auto-clear.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptHistory {
    #[serde(default)]
    pub subtasks: BTreeMap<String, SubtaskAttempts>,
    #[serde(default)]
    pub stuck_subtasks: Vec<StuckSubtask>,
}

impl AttemptHistory {
    fn path(spec_dir: &Path) -> PathBuf {
        spec_dir.join("memory").join(HISTORY_FILE)
    }

    pub fn load(spec_dir: &Path) -> Result<Self> {
        let path = Self::path(spec_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid attempt history at {}", path.display()))
    }

    pub fn save(&self, spec_dir: &Path) -> Result<()> {
        let path = Self::path(spec_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn attempt_count(&self, subtask_id: &str) -> u32 {
        self.subtasks
            .get(subtask_id)
            .map(|s| s.attempts.len() as u32)
            .unwrap_or(0)
    }

    /// Record one failed attempt. Returns the new attempt count.
    pub fn record_failure(
        &mut self,
        subtask_id: &str,
        session_number: u32,
        failure_summary: Option<String>,
    ) -> u32 {
        let entry = self.subtasks.entry(subtask_id.to_string()).or_default();
        entry.attempts.push(AttemptRecord {
            attempted_at: Utc::now(),
            session_number,
            outcome: "failed".to_string(),
            failure_summary,
        });
        entry.status = "failing".to_string();
        entry.attempts.len() as u32
    }

    pub fn record_success(&mut self, subtask_id: &str, session_number: u32) {
        let entry = self.subtasks.entry(subtask_id.to_string()).or_default();
        entry.attempts.push(AttemptRecord {
            attempted_at: Utc::now(),
            session_number,
            outcome: "completed".to_string(),
            failure_summary: None,
        });
        entry.status = "completed".to_string();
    }

    pub fn is_stuck(&self, subtask_id: &str) -> bool {
        self.stuck_subtasks.iter().any(|s| s.subtask_id == subtask_id)
    }

    /// Mark a subtask stuck after exhausting its attempt budget.
    pub fn mark_stuck(&mut self, subtask_id: &str, attempts: u32) {
        if self.is_stuck(subtask_id) {
            return;
        }
        let reason = format!("No commit produced after {attempts} attempts");
        info!(subtask_id, %reason, "subtask marked stuck");
        if let Some(entry) = self.subtasks.get_mut(subtask_id) {
            entry.status = "stuck".to_string();
        }
        self.stuck_subtasks.push(StuckSubtask {
            subtask_id: subtask_id.to_string(),
            reason,
            marked_at: Utc::now(),
        });
    }

    /// Hints for the next attempt's prompt: what earlier sessions tried
    /// and how they failed.
    pub fn attempt_hints(&self, subtask_id: &str) -> Vec<String> {
        self.subtasks
            .get(subtask_id)
            .map(|s| {
                s.attempts
                    .iter()
                    .filter_map(|a| a.failure_summary.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_are_append_only() {
        let mut history = AttemptHistory::default();
        history.record_failure("1.1", 1, Some("no commit".into()));
        history.record_failure("1.1", 2, None);
        assert_eq!(history.attempt_count("1.1"), 2);
        assert_eq!(history.subtasks["1.1"].attempts[0].session_number, 1);
    }

    #[test]
    fn stuck_after_three_attempts_with_reason() {
        let mut history = AttemptHistory::default();
        for session in 1..=3 {
            history.record_failure("1.1", session, None);
        }
        let attempts = history.attempt_count("1.1");
        assert_eq!(attempts, 3);
        history.mark_stuck("1.1", attempts);

        assert!(history.is_stuck("1.1"));
        assert!(history.stuck_subtasks[0].reason.contains("3 attempts"));
    }

    #[test]
    fn mark_stuck_is_idempotent() {
        let mut history = AttemptHistory::default();
        history.record_failure("1.1", 1, None);
        history.mark_stuck("1.1", 3);
        history.mark_stuck("1.1", 4);
        assert_eq!(history.stuck_subtasks.len(), 1);
    }

    #[test]
    fn hints_come_from_failure_summaries() {
        let mut history = AttemptHistory::default();
        history.record_failure("1.1", 1, Some("tests failed".into()));
        history.record_failure("1.1", 2, None);
        history.record_failure("1.1", 3, Some("type error in auth.rs".into()));
        assert_eq!(
            history.attempt_hints("1.1"),
            vec!["tests failed", "type error in auth.rs"]
        );
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = AttemptHistory::default();
        history.record_failure("2.1", 1, None);
        history.mark_stuck("2.1", 3);
        history.save(dir.path()).unwrap();

        let loaded = AttemptHistory::load(dir.path()).unwrap();
        assert_eq!(loaded.attempt_count("2.1"), 1);
        assert!(loaded.is_stuck("2.1"));
    }
}
