use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Semantic category of a single change within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    AddImport,
    AddFunction,
    ModifyRegion,
    ModifyOther,
    RemoveImport,
    RemoveFunction,
    RemoveOther,
}

impl ChangeType {
    pub fn is_modify(&self) -> bool {
        matches!(self, ChangeType::ModifyRegion | ChangeType::ModifyOther)
    }

    pub fn is_remove(&self) -> bool {
        matches!(
            self,
            ChangeType::RemoveImport | ChangeType::RemoveFunction | ChangeType::RemoveOther
        )
    }
}

/// One categorized (before, after) pair derived from a textual diff.
/// `content_before`/`content_after` are verbatim excerpts, normalized to
/// LF regardless of the source file's line-ending style; they serve as
/// the match anchors during merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticChange {
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl SemanticChange {
    pub fn added(change_type: ChangeType, content: impl Into<String>) -> Self {
        Self {
            change_type,
            content_before: None,
            content_after: Some(content.into()),
            location: None,
        }
    }

    pub fn removed(change_type: ChangeType, content: impl Into<String>) -> Self {
        Self {
            change_type,
            content_before: Some(content.into()),
            content_after: None,
            location: None,
        }
    }

    pub fn modified(before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::ModifyRegion,
            content_before: Some(before.into()),
            content_after: Some(after.into()),
            location: None,
        }
    }

    /// A change with no usable anchors (binary or undecodable content).
    /// Such changes cannot be auto-merged.
    pub fn opaque() -> Self {
        Self {
            change_type: ChangeType::ModifyOther,
            content_before: None,
            content_after: None,
            location: None,
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.content_before.as_deref().unwrap_or("").is_empty()
            && self.content_after.as_deref().unwrap_or("").is_empty()
    }
}

/// What one task did to one file: hashes around the edit plus the
/// semantic changes extracted from the textual diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub task_intent: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub content_hash_before: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash_after: Option<String>,
    #[serde(default)]
    pub semantic_changes: Vec<SemanticChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_diff: Option<String>,
}

impl TaskSnapshot {
    pub fn new(task_id: impl Into<String>, intent: impl Into<String>, hash_before: String) -> Self {
        Self {
            task_id: task_id.into(),
            task_intent: intent.into(),
            started_at: Utc::now(),
            completed_at: None,
            content_hash_before: hash_before,
            content_hash_after: None,
            semantic_changes: Vec::new(),
            raw_diff: None,
        }
    }

    /// A snapshot is open until its task completes.
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }

    pub fn has_changes(&self) -> bool {
        !self.semantic_changes.is_empty()
    }
}

/// Full history of one tracked file across a build: the immutable
/// baseline plus one snapshot per task that touched it, in capture order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvolution {
    /// Relative, POSIX-style path.
    pub file_path: String,
    pub baseline_commit: String,
    pub baseline_captured_at: DateTime<Utc>,
    pub baseline_content_hash: String,
    pub baseline_snapshot_path: String,
    #[serde(default)]
    pub task_snapshots: Vec<TaskSnapshot>,
}

impl FileEvolution {
    pub fn task_snapshot(&self, task_id: &str) -> Option<&TaskSnapshot> {
        self.task_snapshots.iter().find(|s| s.task_id == task_id)
    }

    pub fn task_snapshot_mut(&mut self, task_id: &str) -> Option<&mut TaskSnapshot> {
        self.task_snapshots
            .iter_mut()
            .find(|s| s.task_id == task_id)
    }

    /// Insert or replace the snapshot for a task. Order of first capture
    /// is preserved; prior tasks' snapshots are never rewritten.
    pub fn upsert_snapshot(&mut self, snapshot: TaskSnapshot) {
        match self.task_snapshot_mut(&snapshot.task_id) {
            Some(existing) => *existing = snapshot,
            None => self.task_snapshots.push(snapshot),
        }
    }

    /// Snapshots that recorded an actual modification.
    pub fn modified_snapshots(&self) -> impl Iterator<Item = &TaskSnapshot> {
        self.task_snapshots
            .iter()
            .filter(|s| s.content_hash_after.is_some() && s.has_changes())
    }
}

/// Normalize text to LF line endings.
pub fn normalize_lf(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\r', "\n")
}

/// Content hash over LF-normalized bytes: SHA-256 truncated to 128 bits,
/// hex-encoded. The algorithm is fixed for a build generation.
pub fn compute_content_hash(content: &str) -> String {
    let normalized = normalize_lf(content);
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..16])
}

/// Flatten a relative path into a filesystem-safe single name for the
/// baselines directory.
pub fn sanitize_path_for_storage(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_line_ending_insensitive() {
        let lf = "line one\nline two\n";
        let crlf = "line one\r\nline two\r\n";
        let cr = "line one\rline two\r";
        assert_eq!(compute_content_hash(lf), compute_content_hash(crlf));
        assert_eq!(compute_content_hash(lf), compute_content_hash(cr));
        assert_eq!(compute_content_hash(lf).len(), 32);
    }

    #[test]
    fn hash_differs_on_content() {
        assert_ne!(compute_content_hash("a"), compute_content_hash("b"));
    }

    #[test]
    fn sanitized_paths_are_flat() {
        assert_eq!(
            sanitize_path_for_storage("src/app/main.py"),
            "src_app_main.py"
        );
        assert!(!sanitize_path_for_storage("a/../b").contains('/'));
    }

    #[test]
    fn upsert_replaces_only_matching_task() {
        let mut evolution = FileEvolution {
            file_path: "a.py".into(),
            baseline_commit: "c0".into(),
            baseline_captured_at: Utc::now(),
            baseline_content_hash: "h0".into(),
            baseline_snapshot_path: "baselines/t1/a.py.baseline".into(),
            task_snapshots: vec![],
        };
        evolution.upsert_snapshot(TaskSnapshot::new("t1", "first", "h0".into()));
        evolution.upsert_snapshot(TaskSnapshot::new("t2", "second", "h0".into()));
        let mut updated = TaskSnapshot::new("t1", "first (updated)", "h0".into());
        updated.content_hash_after = Some("h1".into());
        evolution.upsert_snapshot(updated);

        assert_eq!(evolution.task_snapshots.len(), 2);
        assert_eq!(evolution.task_snapshots[0].task_intent, "first (updated)");
        assert_eq!(evolution.task_snapshots[1].task_id, "t2");
    }

    #[test]
    fn opaque_change_detection() {
        assert!(SemanticChange::opaque().is_opaque());
        assert!(!SemanticChange::modified("a", "b").is_opaque());
    }
}
