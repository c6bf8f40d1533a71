use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::plan::WorkflowType;

pub const PAUSE_FILE: &str = "PAUSE";
pub const HUMAN_INPUT_FILE: &str = "HUMAN_INPUT.md";

/// One unit of build work: a directory holding the natural-language spec
/// and every artifact produced while building it. Never deleted; history
/// is retained.
#[derive(Debug, Clone)]
pub struct Spec {
    pub id: String,
    pub spec_dir: PathBuf,
    /// Canonical copy when the build runs inside a worktree; completed
    /// state is synced back there.
    pub source_spec_dir: Option<PathBuf>,
}

impl Spec {
    pub fn new(id: impl Into<String>, spec_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            spec_dir: spec_dir.into(),
            source_spec_dir: None,
        }
    }

    pub fn with_source(mut self, source_spec_dir: impl Into<PathBuf>) -> Self {
        self.source_spec_dir = Some(source_spec_dir.into());
        self
    }

    pub fn spec_file(&self) -> PathBuf {
        self.spec_dir.join("spec.md")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.spec_dir.join("memory")
    }

    /// Presence of the PAUSE sentinel means a human asked the build to
    /// stop after the current session.
    pub fn is_paused(&self) -> bool {
        self.spec_dir.join(PAUSE_FILE).exists()
    }

    pub fn read_spec(&self) -> Result<String> {
        let path = self.spec_file();
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read spec at {}", path.display()))
    }

    /// Take pending human instructions, renaming the file so they are
    /// injected into exactly one session.
    pub fn consume_human_input(&self) -> Option<String> {
        let path = self.spec_dir.join(HUMAN_INPUT_FILE);
        let content = std::fs::read_to_string(&path).ok()?;
        let consumed = self.spec_dir.join("HUMAN_INPUT.consumed.md");
        if let Err(e) = std::fs::rename(&path, &consumed) {
            warn!(error = %e, "could not mark human input consumed");
        }
        Some(content)
    }

    /// Workflow type, by precedence: user-declared `requirements.json`,
    /// then AI-declared `complexity_assessment.json`, then the plan's own
    /// field (read by the caller).
    pub fn declared_workflow_type(&self) -> Option<WorkflowType> {
        for file in ["requirements.json", "complexity_assessment.json"] {
            let path = self.spec_dir.join(file);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(&content) else {
                continue;
            };
            if let Some(workflow) = value
                .get("workflow_type")
                .cloned()
                .and_then(|v| serde_json::from_value::<WorkflowType>(v).ok())
            {
                debug!(source = file, "workflow type declared");
                return Some(workflow);
            }
        }
        None
    }

    /// Optional per-phase model/thinking overrides.
    pub fn task_metadata(&self) -> Option<TaskMetadata> {
        let path = self.spec_dir.join("task_metadata.json");
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Accumulated memory hints for coding prompts: learned patterns and
    /// known gotchas, capped so they cannot crowd out the task itself.
    pub fn memory_hints(&self) -> Option<String> {
        const MAX_HINT_LINES: usize = 60;
        let mut sections = Vec::new();
        for (file, heading) in [("patterns.md", "Known patterns"), ("gotchas.md", "Known gotchas")]
        {
            let path = self.memory_dir().join(file);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let lines: Vec<&str> = content.lines().take(MAX_HINT_LINES).collect();
            if !lines.is_empty() {
                sections.push(format!("{heading}:\n{}", lines.join("\n")));
            }
        }
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    /// Append a line to the free-form build log.
    pub fn log_progress(&self, message: &str) {
        let path = self.spec_dir.join("build-progress.txt");
        let line = format!("[{}] {message}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(error = %e, "could not append build progress");
        }
    }

    /// Persist a per-session insight record under memory/session_insights.
    pub fn record_session_insight(&self, insight: &SessionInsight) -> Result<()> {
        let dir = self.memory_dir().join("session_insights");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("session_{:03}.json", insight.session_number));
        std::fs::write(&path, serde_json::to_string_pretty(insight)?)?;
        Ok(())
    }

    /// Mirror plan and memory artifacts back to the canonical spec dir
    /// when the build runs in a worktree.
    pub fn sync_to_source(&self) -> Result<()> {
        let Some(source) = &self.source_spec_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(source)?;
        for name in [
            "implementation_plan.json",
            "build-progress.txt",
            "qa_report.md",
        ] {
            let from = self.spec_dir.join(name);
            if from.exists() {
                std::fs::copy(&from, source.join(name))
                    .with_context(|| format!("Failed to sync {name}"))?;
            }
        }
        let memory_from = self.memory_dir();
        if memory_from.exists() {
            copy_dir(&memory_from, &source.join("memory"))?;
        }
        debug!(source = %source.display(), "synced spec artifacts to source");
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub phase_models: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub phase_thinking_budgets: std::collections::HashMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInsight {
    pub session_number: u32,
    pub subtask_id: Option<String>,
    pub outcome: String,
    pub commits_added: u64,
    pub duration_secs: u64,
    pub cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path) -> Spec {
        Spec::new("demo", dir)
    }

    #[test]
    fn pause_sentinel_detection() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path());
        assert!(!spec.is_paused());
        std::fs::write(dir.path().join(PAUSE_FILE), "").unwrap();
        assert!(spec.is_paused());
    }

    #[test]
    fn human_input_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path());
        std::fs::write(dir.path().join(HUMAN_INPUT_FILE), "prefer small commits").unwrap();

        assert_eq!(
            spec.consume_human_input().as_deref(),
            Some("prefer small commits")
        );
        assert!(spec.consume_human_input().is_none());
        assert!(dir.path().join("HUMAN_INPUT.consumed.md").exists());
    }

    #[test]
    fn requirements_beats_complexity_assessment() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path());
        std::fs::write(
            dir.path().join("complexity_assessment.json"),
            r#"{"workflow_type": "migration"}"#,
        )
        .unwrap();
        assert_eq!(spec.declared_workflow_type(), Some(WorkflowType::Migration));

        std::fs::write(
            dir.path().join("requirements.json"),
            r#"{"workflow_type": "simple"}"#,
        )
        .unwrap();
        assert_eq!(spec.declared_workflow_type(), Some(WorkflowType::Simple));
    }

    #[test]
    fn sync_copies_plan_to_source() {
        let work = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let spec = Spec::new("demo", work.path()).with_source(source.path());

        std::fs::write(work.path().join("implementation_plan.json"), "{}").unwrap();
        std::fs::create_dir_all(work.path().join("memory")).unwrap();
        std::fs::write(work.path().join("memory/attempt_history.json"), "{}").unwrap();

        spec.sync_to_source().unwrap();
        assert!(source.path().join("implementation_plan.json").exists());
        assert!(source.path().join("memory/attempt_history.json").exists());
    }

    #[test]
    fn memory_hints_concatenate_patterns_and_gotchas() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path());
        assert!(spec.memory_hints().is_none());

        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/patterns.md"), "- use the repo helper").unwrap();
        std::fs::write(dir.path().join("memory/gotchas.md"), "- tests need fixtures").unwrap();

        let hints = spec.memory_hints().unwrap();
        assert!(hints.contains("use the repo helper"));
        assert!(hints.contains("tests need fixtures"));
    }

    #[test]
    fn progress_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path());
        spec.log_progress("session 1 started");
        spec.log_progress("session 1 finished");
        let log = std::fs::read_to_string(dir.path().join("build-progress.txt")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("session 1 started"));
    }
}
