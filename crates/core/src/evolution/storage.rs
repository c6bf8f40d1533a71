use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::types::{sanitize_path_for_storage, FileEvolution};

/// On-disk persistence for evolution data: the `file_evolution.json` index
/// plus verbatim baseline copies under `baselines/<task_id>/`.
pub struct EvolutionStorage {
    project_dir: PathBuf,
    storage_dir: PathBuf,
    baselines_dir: PathBuf,
    evolution_file: PathBuf,
}

impl EvolutionStorage {
    pub fn new(project_dir: &Path, storage_dir: &Path) -> Result<Self> {
        let storage_dir = storage_dir.to_path_buf();
        let baselines_dir = storage_dir.join("baselines");
        std::fs::create_dir_all(&baselines_dir)
            .with_context(|| format!("Failed to create {}", baselines_dir.display()))?;
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            evolution_file: storage_dir.join("file_evolution.json"),
            storage_dir,
            baselines_dir,
        })
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Load the index. A missing file is an empty map; a corrupt file is
    /// logged and treated as empty rather than aborting the build.
    pub fn load_evolutions(&self) -> BTreeMap<String, FileEvolution> {
        if !self.evolution_file.exists() {
            return BTreeMap::new();
        }
        match std::fs::read_to_string(&self.evolution_file)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str(&content).map_err(Into::into))
        {
            Ok(evolutions) => {
                let evolutions: BTreeMap<String, FileEvolution> = evolutions;
                debug!(files = evolutions.len(), "loaded evolution data");
                evolutions
            }
            Err(e) => {
                warn!(error = %e, "failed to load evolution data, starting empty");
                BTreeMap::new()
            }
        }
    }

    /// Atomic whole-file replacement: write to a temp file in the same
    /// directory, then rename over the index.
    pub fn save_evolutions(&self, evolutions: &BTreeMap<String, FileEvolution>) -> Result<()> {
        let json = serde_json::to_string_pretty(evolutions)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.storage_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.evolution_file)
            .with_context(|| format!("Failed to persist {}", self.evolution_file.display()))?;
        debug!(files = evolutions.len(), "saved evolution data");
        Ok(())
    }

    /// Write a baseline copy. Returns its path relative to the storage
    /// dir, as recorded in `FileEvolution::baseline_snapshot_path`.
    pub fn store_baseline_content(
        &self,
        rel_path: &str,
        content: &str,
        task_id: &str,
    ) -> Result<String> {
        let safe_name = sanitize_path_for_storage(rel_path);
        let baseline_path = self
            .baselines_dir
            .join(task_id)
            .join(format!("{safe_name}.baseline"));
        if let Some(parent) = baseline_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&baseline_path, content)?;
        let rel = baseline_path
            .strip_prefix(&self.storage_dir)
            .unwrap_or(&baseline_path);
        Ok(rel.to_string_lossy().replace('\\', "/"))
    }

    pub fn read_baseline_content(&self, baseline_snapshot_path: &str) -> Option<String> {
        let path = self.storage_dir.join(baseline_snapshot_path);
        match std::fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read baseline");
                None
            }
        }
    }

    pub fn read_file_content(&self, file_path: &Path) -> Option<String> {
        let path = if file_path.is_absolute() {
            file_path.to_path_buf()
        } else {
            self.project_dir.join(file_path)
        };
        match std::fs::read(&path) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(_) => None,
        }
    }

    /// Path relative to the project root, POSIX-style. Paths outside the
    /// project are returned as-is.
    pub fn relative_path(&self, file_path: &Path) -> String {
        let path = if file_path.is_absolute() {
            file_path
                .canonicalize()
                .unwrap_or_else(|_| file_path.to_path_buf())
        } else {
            return file_path.to_string_lossy().replace('\\', "/");
        };
        let root = self
            .project_dir
            .canonicalize()
            .unwrap_or_else(|_| self.project_dir.clone());
        match path.strip_prefix(&root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => path.to_string_lossy().replace('\\', "/"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::types::{compute_content_hash, TaskSnapshot};
    use chrono::Utc;

    fn storage(dir: &Path) -> EvolutionStorage {
        EvolutionStorage::new(dir, &dir.join(".autoforge")).unwrap()
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        let mut evolutions = BTreeMap::new();
        let mut evolution = FileEvolution {
            file_path: "src/app.py".into(),
            baseline_commit: "abc123".into(),
            baseline_captured_at: Utc::now(),
            baseline_content_hash: compute_content_hash("x = 1\n"),
            baseline_snapshot_path: "baselines/t1/src_app.py.baseline".into(),
            task_snapshots: vec![],
        };
        evolution.upsert_snapshot(TaskSnapshot::new("t1", "add y", "h".into()));
        evolutions.insert(evolution.file_path.clone(), evolution);

        storage.save_evolutions(&evolutions).unwrap();
        let loaded = storage.load_evolutions();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["src/app.py"].baseline_commit, "abc123");
        assert_eq!(loaded["src/app.py"].task_snapshots.len(), 1);
    }

    #[test]
    fn missing_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(storage(dir.path()).load_evolutions().is_empty());
    }

    #[test]
    fn corrupt_index_is_empty_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        std::fs::write(
            dir.path().join(".autoforge").join("file_evolution.json"),
            "{not json",
        )
        .unwrap();
        assert!(storage.load_evolutions().is_empty());
    }

    #[test]
    fn baseline_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let rel = storage
            .store_baseline_content("src/main.rs", "fn main() {}\n", "task-1")
            .unwrap();
        assert!(rel.starts_with("baselines/task-1/"));
        assert_eq!(
            storage.read_baseline_content(&rel).unwrap(),
            "fn main() {}\n"
        );
    }

    #[test]
    fn relative_path_is_posix() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/x.rs"), "").unwrap();
        let rel = storage.relative_path(&dir.path().join("src/x.rs"));
        assert_eq!(rel, "src/x.rs");
    }
}
