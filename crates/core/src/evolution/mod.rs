pub mod capture;
pub mod storage;
pub mod tracker;
pub mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::git::GitAdapter;

use capture::BaselineCapture;
use storage::EvolutionStorage;
use tracker::ModificationTracker;
use types::FileEvolution;

/// Persistent per-file evolution store for one build. Single-writer:
/// owned and serialized by the build's orchestrator loop.
pub struct FileEvolutionStore {
    storage: EvolutionStorage,
    capture: BaselineCapture,
    tracker: ModificationTracker,
    git: GitAdapter,
    evolutions: BTreeMap<String, FileEvolution>,
}

impl FileEvolutionStore {
    pub fn open(project_dir: &Path, storage_dir: &Path, git: GitAdapter) -> Result<Self> {
        let storage = EvolutionStorage::new(project_dir, storage_dir)?;
        let evolutions = storage.load_evolutions();
        Ok(Self {
            storage,
            capture: BaselineCapture::new(),
            tracker: ModificationTracker::new(),
            git,
            evolutions,
        })
    }

    pub fn evolutions(&self) -> &BTreeMap<String, FileEvolution> {
        &self.evolutions
    }

    pub fn get(&self, rel_path: &str) -> Option<&FileEvolution> {
        self.evolutions.get(rel_path)
    }

    pub fn baseline_content(&self, evolution: &FileEvolution) -> Option<String> {
        self.storage
            .read_baseline_content(&evolution.baseline_snapshot_path)
    }

    /// Capture baselines for the given files (or all trackable files)
    /// before a task starts mutating them.
    pub async fn capture_baselines(
        &mut self,
        task_id: &str,
        files: Option<Vec<PathBuf>>,
        intent: &str,
    ) -> Result<Vec<String>> {
        let captured = self
            .capture
            .capture_baselines(
                &self.storage,
                &self.git,
                task_id,
                files,
                intent,
                &mut self.evolutions,
            )
            .await;
        self.save()?;
        Ok(captured)
    }

    pub fn record_modification(
        &mut self,
        task_id: &str,
        file_path: &Path,
        old_content: &str,
        new_content: &str,
        raw_diff: Option<String>,
    ) -> Result<bool> {
        let recorded = self.tracker.record_modification(
            &self.storage,
            task_id,
            file_path,
            old_content,
            new_content,
            raw_diff,
            &mut self.evolutions,
        );
        if recorded {
            self.save()?;
        }
        Ok(recorded)
    }

    pub async fn refresh_from_git(
        &mut self,
        task_id: &str,
        worktree_path: &Path,
        base_ref: &str,
    ) -> Result<()> {
        self.tracker
            .refresh_from_git(
                &self.storage,
                &self.git,
                task_id,
                worktree_path,
                base_ref,
                &mut self.evolutions,
            )
            .await;
        self.save()
    }

    pub fn mark_task_completed(&mut self, task_id: &str) -> Result<()> {
        self.tracker
            .mark_task_completed(task_id, &mut self.evolutions);
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        self.storage.save_evolutions(&self.evolutions)
    }
}
