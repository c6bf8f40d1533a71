use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const PLAN_FILE: &str = "implementation_plan.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Feature,
    Refactor,
    Investigation,
    Migration,
    Simple,
}

impl Default for WorkflowType {
    fn default() -> Self {
        WorkflowType::Feature
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Stuck,
    Skipped,
}

impl SubtaskStatus {
    /// Legal forward transitions. Completed is terminal except through an
    /// explicit reopen.
    pub fn can_transition_to(&self, next: SubtaskStatus) -> bool {
        use SubtaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Stuck)
                | (InProgress, InProgress)
                | (Stuck, InProgress)
        )
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskStatus::Pending => write!(f, "pending"),
            SubtaskStatus::InProgress => write!(f, "in_progress"),
            SubtaskStatus::Completed => write!(f, "completed"),
            SubtaskStatus::Stuck => write!(f, "stuck"),
            SubtaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub status: SubtaskStatus,
    /// Agent-provided extras (notes, file hints) are preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub feature: String,
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub phases: Vec<Phase>,
}

impl ImplementationPlan {
    pub fn path(spec_dir: &Path) -> PathBuf {
        spec_dir.join(PLAN_FILE)
    }

    pub fn exists(spec_dir: &Path) -> bool {
        Self::path(spec_dir).exists()
    }

    pub fn load(spec_dir: &Path) -> Result<Self> {
        let path = Self::path(spec_dir);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid implementation plan at {}", path.display()))
    }

    pub fn save(&self, spec_dir: &Path) -> Result<()> {
        let path = Self::path(spec_dir);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// First pending subtask, walking phases in order. Ordering is
    /// significant: earlier phases drain completely first.
    pub fn next_pending(&self) -> Option<(&Phase, &Subtask)> {
        for phase in &self.phases {
            for subtask in &phase.subtasks {
                if subtask.status == SubtaskStatus::Pending {
                    return Some((phase, subtask));
                }
            }
        }
        None
    }

    pub fn find_subtask_mut(&mut self, subtask_id: &str) -> Option<&mut Subtask> {
        self.phases
            .iter_mut()
            .flat_map(|p| p.subtasks.iter_mut())
            .find(|s| s.id == subtask_id)
    }

    /// Monotonic status update; illegal transitions are rejected.
    pub fn set_status(&mut self, subtask_id: &str, status: SubtaskStatus) -> Result<()> {
        let subtask = self
            .find_subtask_mut(subtask_id)
            .with_context(|| format!("Unknown subtask: {subtask_id}"))?;
        if subtask.status == status {
            return Ok(());
        }
        if !subtask.status.can_transition_to(status) {
            anyhow::bail!(
                "Illegal status transition for {subtask_id}: {} -> {}",
                subtask.status,
                status
            );
        }
        subtask.status = status;
        Ok(())
    }

    /// Explicit follow-up operation: the one sanctioned way back from
    /// completed.
    pub fn reopen(&mut self, subtask_id: &str) -> Result<()> {
        let subtask = self
            .find_subtask_mut(subtask_id)
            .with_context(|| format!("Unknown subtask: {subtask_id}"))?;
        subtask.status = SubtaskStatus::Pending;
        Ok(())
    }

    pub fn counts(&self) -> PlanCounts {
        let mut counts = PlanCounts::default();
        for subtask in self.phases.iter().flat_map(|p| &p.subtasks) {
            counts.total += 1;
            match subtask.status {
                SubtaskStatus::Completed => counts.completed += 1,
                SubtaskStatus::InProgress => counts.in_progress += 1,
                SubtaskStatus::Stuck => counts.failed += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn is_complete(&self) -> bool {
        self.phases.iter().flat_map(|p| &p.subtasks).all(|s| {
            matches!(
                s.status,
                SubtaskStatus::Completed | SubtaskStatus::Skipped | SubtaskStatus::Stuck
            )
        })
    }

    /// Phase position of a subtask, 1-based, for status reporting.
    pub fn phase_position(&self, subtask_id: &str) -> Option<(usize, &Phase)> {
        self.phases
            .iter()
            .enumerate()
            .find(|(_, p)| p.subtasks.iter().any(|s| s.id == subtask_id))
            .map(|(i, p)| (i + 1, p))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PlanCounts {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub failed: usize,
}

const VALID_STATUSES: &[&str] = &["pending", "in_progress", "completed", "stuck", "skipped"];
const VALID_WORKFLOW_TYPES: &[&str] =
    &["feature", "refactor", "investigation", "migration", "simple"];

/// Schema check over the raw JSON, so agent output can be diagnosed
/// before strict deserialization. Returns every violation found.
pub fn validate_plan_value(value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(obj) = value.as_object() else {
        return vec!["plan must be a JSON object".to_string()];
    };

    match obj.get("feature").and_then(|v| v.as_str()) {
        Some(f) if !f.trim().is_empty() => {}
        _ => errors.push("missing or empty top-level `feature`".to_string()),
    }

    match obj.get("workflow_type").and_then(|v| v.as_str()) {
        Some(w) if VALID_WORKFLOW_TYPES.contains(&w) => {}
        Some(w) => errors.push(format!("invalid workflow_type `{w}`")),
        None => errors.push("missing `workflow_type`".to_string()),
    }

    let Some(phases) = obj.get("phases").and_then(|v| v.as_array()) else {
        errors.push("missing `phases` array".to_string());
        return errors;
    };
    if phases.is_empty() {
        errors.push("`phases` must not be empty".to_string());
    }

    let mut seen_ids = std::collections::HashSet::new();
    for (pi, phase) in phases.iter().enumerate() {
        let Some(phase_obj) = phase.as_object() else {
            errors.push(format!("phase {pi} is not an object"));
            continue;
        };
        if phase_obj.get("id").and_then(|v| v.as_str()).is_none() {
            errors.push(format!("phase {pi} missing `id`"));
        }
        if phase_obj.get("name").and_then(|v| v.as_str()).is_none() {
            errors.push(format!("phase {pi} missing `name`"));
        }
        let Some(subtasks) = phase_obj.get("subtasks").and_then(|v| v.as_array()) else {
            errors.push(format!("phase {pi} missing `subtasks` array"));
            continue;
        };
        for (si, subtask) in subtasks.iter().enumerate() {
            let Some(subtask_obj) = subtask.as_object() else {
                errors.push(format!("phase {pi} subtask {si} is not an object"));
                continue;
            };
            match subtask_obj.get("id").and_then(|v| v.as_str()) {
                Some(id) => {
                    if !seen_ids.insert(id.to_string()) {
                        errors.push(format!("duplicate subtask id `{id}`"));
                    }
                }
                None => errors.push(format!("phase {pi} subtask {si} missing `id`")),
            }
            if subtask_obj
                .get("description")
                .and_then(|v| v.as_str())
                .map(|d| d.trim().is_empty())
                .unwrap_or(true)
            {
                errors.push(format!("phase {pi} subtask {si} missing `description`"));
            }
            match subtask_obj.get("status").and_then(|v| v.as_str()) {
                Some(s) if VALID_STATUSES.contains(&s) => {}
                Some(s) => errors.push(format!("phase {pi} subtask {si} invalid status `{s}`")),
                None => errors.push(format!("phase {pi} subtask {si} missing `status`")),
            }
        }
    }

    errors
}

/// One conservative repair pass over minor shape issues: fill a missing
/// subtask `status` with `pending`, and a missing phase or subtask `id`
/// from its position. Anything else is left for a planning retry.
/// Returns true when the value was modified.
pub fn auto_fix_plan_value(value: &mut Value) -> bool {
    let mut fixed = false;
    let Some(phases) = value
        .get_mut("phases")
        .and_then(|v| v.as_array_mut())
    else {
        return false;
    };

    for (pi, phase) in phases.iter_mut().enumerate() {
        let Some(phase_obj) = phase.as_object_mut() else {
            continue;
        };
        if phase_obj.get("id").and_then(|v| v.as_str()).is_none() {
            phase_obj.insert("id".to_string(), Value::String(format!("phase-{}", pi + 1)));
            fixed = true;
        }
        let Some(subtasks) = phase_obj
            .get_mut("subtasks")
            .and_then(|v| v.as_array_mut())
        else {
            continue;
        };
        for (si, subtask) in subtasks.iter_mut().enumerate() {
            let Some(subtask_obj) = subtask.as_object_mut() else {
                continue;
            };
            if subtask_obj.get("id").and_then(|v| v.as_str()).is_none() {
                subtask_obj.insert(
                    "id".to_string(),
                    Value::String(format!("{}.{}", pi + 1, si + 1)),
                );
                fixed = true;
            }
            if subtask_obj.get("status").and_then(|v| v.as_str()).is_none() {
                subtask_obj.insert("status".to_string(), Value::String("pending".to_string()));
                fixed = true;
            }
        }
    }

    if fixed {
        debug!("auto-fixed implementation plan shape");
    }
    fixed
}

/// Load the plan, attempting one auto-fix pass when the raw JSON has
/// minor shape issues. Returns the remaining validation errors on
/// failure.
pub fn load_validated(spec_dir: &Path) -> std::result::Result<ImplementationPlan, Vec<String>> {
    let path = ImplementationPlan::path(spec_dir);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| vec![format!("cannot read {}: {e}", path.display())])?;
    let mut value: Value =
        serde_json::from_str(&content).map_err(|e| vec![format!("invalid JSON: {e}")])?;

    let mut errors = validate_plan_value(&value);
    if !errors.is_empty() && auto_fix_plan_value(&mut value) {
        errors = validate_plan_value(&value);
        if errors.is_empty() {
            if let Err(e) = std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap_or_default()) {
                return Err(vec![format!("cannot persist fixed plan: {e}")]);
            }
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value(value).map_err(|e| vec![format!("plan deserialization failed: {e}")])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_plan() -> ImplementationPlan {
        serde_json::from_value(json!({
            "feature": "add login",
            "workflow_type": "feature",
            "phases": [
                {"id": "phase-1", "name": "Backend", "subtasks": [
                    {"id": "1.1", "description": "add endpoint", "status": "pending"},
                    {"id": "1.2", "description": "add tests", "status": "pending"}
                ]},
                {"id": "phase-2", "name": "Frontend", "subtasks": [
                    {"id": "2.1", "description": "add form", "status": "pending"}
                ]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn next_pending_walks_phases_in_order() {
        let mut plan = sample_plan();
        assert_eq!(plan.next_pending().unwrap().1.id, "1.1");
        plan.set_status("1.1", SubtaskStatus::InProgress).unwrap();
        plan.set_status("1.1", SubtaskStatus::Completed).unwrap();
        assert_eq!(plan.next_pending().unwrap().1.id, "1.2");
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let mut plan = sample_plan();
        plan.set_status("1.1", SubtaskStatus::InProgress).unwrap();
        plan.set_status("1.1", SubtaskStatus::Completed).unwrap();
        // Completed is terminal without an explicit reopen.
        assert!(plan.set_status("1.1", SubtaskStatus::Pending).is_err());
        assert!(plan.set_status("1.1", SubtaskStatus::InProgress).is_err());

        plan.reopen("1.1").unwrap();
        assert_eq!(plan.next_pending().unwrap().1.id, "1.1");
    }

    #[test]
    fn pending_cannot_jump_to_completed() {
        let mut plan = sample_plan();
        assert!(plan.set_status("1.2", SubtaskStatus::Completed).is_err());
    }

    #[test]
    fn validates_complete_plan() {
        let value = serde_json::to_value(sample_plan()).unwrap();
        assert!(validate_plan_value(&value).is_empty());
    }

    #[test]
    fn reports_missing_fields() {
        let value = json!({"phases": [{"subtasks": [{"description": "x"}]}]});
        let errors = validate_plan_value(&value);
        assert!(errors.iter().any(|e| e.contains("feature")));
        assert!(errors.iter().any(|e| e.contains("workflow_type")));
        assert!(errors.iter().any(|e| e.contains("missing `id`")));
        assert!(errors.iter().any(|e| e.contains("missing `status`")));
    }

    #[test]
    fn rejects_duplicate_subtask_ids() {
        let value = json!({
            "feature": "x", "workflow_type": "simple",
            "phases": [{"id": "p1", "name": "P", "subtasks": [
                {"id": "a", "description": "one", "status": "pending"},
                {"id": "a", "description": "two", "status": "pending"}
            ]}]
        });
        let errors = validate_plan_value(&value);
        assert!(errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn auto_fix_fills_status_and_id() {
        let mut value = json!({
            "feature": "x", "workflow_type": "simple",
            "phases": [{"name": "P", "subtasks": [
                {"description": "one"},
                {"id": "b", "description": "two", "status": "pending"}
            ]}]
        });
        assert!(auto_fix_plan_value(&mut value));
        assert!(validate_plan_value(&value)
            .iter()
            .all(|e| !e.contains("status") && !e.contains("missing `id`")));
        assert_eq!(value["phases"][0]["id"], "phase-1");
        assert_eq!(value["phases"][0]["subtasks"][0]["id"], "1.1");
        assert_eq!(value["phases"][0]["subtasks"][0]["status"], "pending");
    }

    #[test]
    fn auto_fix_does_not_invent_descriptions() {
        let mut value = json!({
            "feature": "x", "workflow_type": "simple",
            "phases": [{"id": "p", "name": "P", "subtasks": [{"id": "a", "status": "pending"}]}]
        });
        auto_fix_plan_value(&mut value);
        assert!(validate_plan_value(&value)
            .iter()
            .any(|e| e.contains("description")));
    }

    #[test]
    fn load_validated_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        sample_plan().save(dir.path()).unwrap();
        let plan = load_validated(dir.path()).unwrap();
        assert_eq!(plan.counts().total, 3);
    }

    #[test]
    fn is_complete_counts_stuck_as_terminal() {
        let mut plan = sample_plan();
        for id in ["1.1", "1.2", "2.1"] {
            plan.set_status(id, SubtaskStatus::InProgress).unwrap();
        }
        plan.set_status("1.1", SubtaskStatus::Completed).unwrap();
        plan.set_status("1.2", SubtaskStatus::Stuck).unwrap();
        plan.set_status("2.1", SubtaskStatus::Completed).unwrap();
        assert!(plan.is_complete());
        assert_eq!(plan.counts().failed, 1);
    }
}
