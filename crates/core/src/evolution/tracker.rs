use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::analyzer::SemanticAnalyzer;
use crate::git::{GitAdapter, GitError};

use super::storage::EvolutionStorage;
use super::types::{compute_content_hash, FileEvolution, TaskSnapshot};

/// Records what tasks did to tracked files, either live or
/// retroactively from a worktree's git state.
pub struct ModificationTracker {
    analyzer: SemanticAnalyzer,
}

impl ModificationTracker {
    pub fn new() -> Self {
        Self {
            analyzer: SemanticAnalyzer::new(),
        }
    }

    /// Record a modification. The file must already be under tracking;
    /// the baseline is never rewritten here. Returns false when the path
    /// has no evolution entry.
    pub fn record_modification(
        &self,
        storage: &EvolutionStorage,
        task_id: &str,
        file_path: &Path,
        old_content: &str,
        new_content: &str,
        raw_diff: Option<String>,
        evolutions: &mut BTreeMap<String, FileEvolution>,
    ) -> bool {
        let rel_path = storage.relative_path(file_path);
        let Some(evolution) = evolutions.get_mut(&rel_path) else {
            warn!(file = %rel_path, "file not being tracked, modification dropped");
            return false;
        };

        let semantic_changes = self.analyzer.analyze(&rel_path, old_content, new_content);

        let mut snapshot = match evolution.task_snapshot(task_id) {
            Some(existing) => existing.clone(),
            None => TaskSnapshot::new(task_id, "", compute_content_hash(old_content)),
        };
        snapshot.completed_at = Some(Utc::now());
        snapshot.content_hash_after = Some(compute_content_hash(new_content));
        snapshot.semantic_changes = semantic_changes;
        snapshot.raw_diff = raw_diff;

        debug!(
            file = %rel_path,
            task_id,
            changes = snapshot.semantic_changes.len(),
            "recorded modification"
        );
        evolution.upsert_snapshot(snapshot);
        true
    }

    /// Retroactively analyze what a task changed by diffing its worktree
    /// against the base ref. Used when real-time capture was unavailable.
    pub async fn refresh_from_git(
        &self,
        storage: &EvolutionStorage,
        git: &GitAdapter,
        task_id: &str,
        worktree_path: &Path,
        base_ref: &str,
        evolutions: &mut BTreeMap<String, FileEvolution>,
    ) {
        let changed = match git.diff_name_only(worktree_path, base_ref, "HEAD").await {
            Ok(files) => files,
            Err(e) => {
                error!(error = %e, "failed to refresh from git");
                return;
            }
        };
        debug!(task_id, files = changed.len(), "refreshing from worktree");

        for file in &changed {
            let old_content = match git.read_blob(worktree_path, base_ref, file).await {
                Ok(content) => content,
                Err(GitError::NotFound(_)) => String::new(),
                Err(e) => {
                    warn!(file, error = %e, "could not read base content");
                    continue;
                }
            };

            let on_disk = worktree_path.join(file);
            let new_content = if on_disk.exists() {
                std::fs::read(&on_disk)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default()
            } else {
                String::new()
            };

            let raw_diff = git
                .diff(worktree_path, base_ref, "HEAD", Some(file))
                .await
                .ok();

            self.record_modification(
                storage,
                task_id,
                Path::new(file),
                &old_content,
                &new_content,
                raw_diff,
                evolutions,
            );
        }
    }

    /// Close every open snapshot belonging to a task.
    pub fn mark_task_completed(
        &self,
        task_id: &str,
        evolutions: &mut BTreeMap<String, FileEvolution>,
    ) {
        let now = Utc::now();
        for evolution in evolutions.values_mut() {
            if let Some(snapshot) = evolution.task_snapshot_mut(task_id) {
                if snapshot.completed_at.is_none() {
                    snapshot.completed_at = Some(now);
                }
            }
        }
    }
}

impl Default for ModificationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked_evolution(path: &str, baseline: &str) -> (String, FileEvolution) {
        (
            path.to_string(),
            FileEvolution {
                file_path: path.to_string(),
                baseline_commit: "c0".into(),
                baseline_captured_at: Utc::now(),
                baseline_content_hash: compute_content_hash(baseline),
                baseline_snapshot_path: format!("baselines/t1/{path}.baseline"),
                task_snapshots: vec![TaskSnapshot::new(
                    "t1",
                    "test",
                    compute_content_hash(baseline),
                )],
            },
        )
    }

    #[test]
    fn record_updates_snapshot_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let storage = EvolutionStorage::new(dir.path(), &dir.path().join(".autoforge")).unwrap();
        let tracker = ModificationTracker::new();
        let mut evolutions: BTreeMap<_, _> =
            [tracked_evolution("a.py", "x = 1\n")].into_iter().collect();

        let recorded = tracker.record_modification(
            &storage,
            "t1",
            Path::new("a.py"),
            "x = 1\n",
            "x = 2\n",
            None,
            &mut evolutions,
        );
        assert!(recorded);

        let snapshot = evolutions["a.py"].task_snapshot("t1").unwrap();
        assert!(snapshot.completed_at.is_some());
        assert_eq!(
            snapshot.content_hash_after.as_deref(),
            Some(compute_content_hash("x = 2\n").as_str())
        );
        assert_eq!(snapshot.semantic_changes.len(), 1);
    }

    #[test]
    fn untracked_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = EvolutionStorage::new(dir.path(), &dir.path().join(".autoforge")).unwrap();
        let tracker = ModificationTracker::new();
        let mut evolutions = BTreeMap::new();

        let recorded = tracker.record_modification(
            &storage,
            "t1",
            Path::new("ghost.py"),
            "",
            "x",
            None,
            &mut evolutions,
        );
        assert!(!recorded);
        assert!(evolutions.is_empty());
    }

    #[test]
    fn record_does_not_touch_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let storage = EvolutionStorage::new(dir.path(), &dir.path().join(".autoforge")).unwrap();
        let tracker = ModificationTracker::new();
        let mut evolutions: BTreeMap<_, _> =
            [tracked_evolution("a.py", "x = 1\n")].into_iter().collect();
        let baseline_hash = evolutions["a.py"].baseline_content_hash.clone();

        tracker.record_modification(
            &storage,
            "t1",
            Path::new("a.py"),
            "x = 1\n",
            "x = 99\n",
            None,
            &mut evolutions,
        );
        assert_eq!(evolutions["a.py"].baseline_content_hash, baseline_hash);
    }

    #[test]
    fn mark_completed_closes_open_snapshots() {
        let tracker = ModificationTracker::new();
        let mut evolutions: BTreeMap<_, _> = [
            tracked_evolution("a.py", "a\n"),
            tracked_evolution("b.py", "b\n"),
        ]
        .into_iter()
        .collect();

        tracker.mark_task_completed("t1", &mut evolutions);
        for evolution in evolutions.values() {
            assert!(evolution.task_snapshot("t1").unwrap().completed_at.is_some());
        }
    }
}
