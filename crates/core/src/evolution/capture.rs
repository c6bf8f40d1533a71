use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, warn};

use crate::git::GitAdapter;

use super::storage::EvolutionStorage;
use super::types::{compute_content_hash, FileEvolution, TaskSnapshot};

/// Extensions tracked for baselines by default.
const DEFAULT_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "tsx", "jsx", "json", "yaml", "yml", "toml", "md", "txt", "html",
    "css", "scss", "go", "rs", "java", "kt", "swift",
];

/// Captures the verbatim state of tracked files at task start and seeds
/// each task's snapshots.
pub struct BaselineCapture {
    extensions: HashSet<String>,
}

impl BaselineCapture {
    pub fn new() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    /// Tracked files from `git ls-files`, filtered by extension. A git
    /// failure yields an empty list rather than aborting.
    pub async fn discover_trackable_files(
        &self,
        storage: &EvolutionStorage,
        git: &GitAdapter,
    ) -> Vec<PathBuf> {
        let files = match git.ls_files(storage.project_dir()).await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "failed to list git files");
                return Vec::new();
            }
        };
        files
            .into_iter()
            .filter(|f| {
                std::path::Path::new(f)
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| self.extensions.contains(e))
                    .unwrap_or(false)
            })
            .map(|f| storage.project_dir().join(f))
            .collect()
    }

    /// Capture baselines for a task. For files already under tracking the
    /// existing baseline is left untouched (the baseline is immutable for
    /// a build generation); only a fresh task snapshot is added.
    pub async fn capture_baselines(
        &self,
        storage: &EvolutionStorage,
        git: &GitAdapter,
        task_id: &str,
        files: Option<Vec<PathBuf>>,
        intent: &str,
        evolutions: &mut BTreeMap<String, FileEvolution>,
    ) -> Vec<String> {
        let commit = match git.head_sha(storage.project_dir()).await {
            Ok(sha) => sha,
            Err(_) => "unknown".to_string(),
        };
        let captured_at = Utc::now();
        let mut captured = Vec::new();

        let files = match files {
            Some(files) => files,
            None => self.discover_trackable_files(storage, git).await,
        };
        debug!(task_id, files = files.len(), "capturing baselines");

        for file_path in files {
            let rel_path = storage.relative_path(&file_path);
            let Some(content) = storage.read_file_content(&file_path) else {
                continue;
            };
            let content_hash = compute_content_hash(&content);

            if !evolutions.contains_key(&rel_path) {
                let baseline_path =
                    match storage.store_baseline_content(&rel_path, &content, task_id) {
                        Ok(path) => path,
                        Err(e) => {
                            warn!(file = %rel_path, error = %e, "failed to store baseline");
                            continue;
                        }
                    };
                evolutions.insert(
                    rel_path.clone(),
                    FileEvolution {
                        file_path: rel_path.clone(),
                        baseline_commit: commit.clone(),
                        baseline_captured_at: captured_at,
                        baseline_content_hash: content_hash.clone(),
                        baseline_snapshot_path: baseline_path,
                        task_snapshots: Vec::new(),
                    },
                );
            }

            if let Some(evolution) = evolutions.get_mut(&rel_path) {
                if evolution.task_snapshot(task_id).is_none() {
                    evolution.upsert_snapshot(TaskSnapshot::new(task_id, intent, content_hash));
                }
            }
            captured.push(rel_path);
        }

        debug!(task_id, captured = captured.len(), "baselines captured");
        captured
    }
}

impl Default for BaselineCapture {
    fn default() -> Self {
        Self::new()
    }
}
