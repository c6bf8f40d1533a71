use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use autoforge_config::WorktreeSettings;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::git::GitAdapter;

/// Subdirectory of the state root where task worktrees live.
pub const WORKTREE_SUBDIR: &str = "worktrees";

#[derive(Debug, Clone)]
pub struct ManagedWorktree {
    pub name: String,
    pub path: PathBuf,
    pub head_commit_sha: String,
}

#[derive(Debug, Clone)]
pub struct WorktreeAge {
    pub path: PathBuf,
    pub age_days: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    pub orphaned: usize,
    pub expired: usize,
    pub excess: usize,
}

impl CleanupStats {
    pub fn total(&self) -> usize {
        self.orphaned + self.expired + self.excess
    }
}

/// Provisions detached per-task worktrees and reclaims stale ones.
/// A worktree is owned by the task that created it until completion or
/// cleanup; this manager is the sole authority on their lifecycle.
pub struct WorktreeManager {
    git: GitAdapter,
    project_dir: PathBuf,
    base_dir: PathBuf,
    settings: WorktreeSettings,
}

impl WorktreeManager {
    pub fn new(
        git: GitAdapter,
        project_dir: &Path,
        state_dir: &Path,
        settings: WorktreeSettings,
    ) -> Self {
        Self {
            git,
            project_dir: project_dir.to_path_buf(),
            base_dir: state_dir.join(WORKTREE_SUBDIR),
            settings,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a detached worktree at `head_sha`. The name embeds a
    /// millisecond timestamp so rapid successive creations never collide.
    /// Any previous worktree for the same (id, sha) pair is reclaimed
    /// first.
    pub async fn create(
        &self,
        prefix: &str,
        id: &str,
        head_sha: &str,
    ) -> Result<ManagedWorktree> {
        let cleanup = self.cleanup().await;
        if cleanup.total() > 0 {
            debug!(
                orphaned = cleanup.orphaned,
                expired = cleanup.expired,
                excess = cleanup.excess,
                "pre-create worktree cleanup"
            );
        }

        let sha_short: String = head_sha.chars().take(8).collect();
        self.remove_stale_for(prefix, id, &sha_short).await;

        let timestamp = Utc::now().timestamp_millis();
        let name = format!("{prefix}-{id}-{sha_short}-{timestamp}");
        std::fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("Failed to create {}", self.base_dir.display()))?;
        let path = self.base_dir.join(&name);

        // Fork refs are only reachable after a fetch; failure is
        // non-fatal because local shas resolve without one.
        if let Err(e) = self.git.fetch(&self.project_dir, "origin", &[head_sha]).await {
            warn!(sha = head_sha, error = %e, "could not fetch from origin, continuing");
        }

        if let Err(e) = self
            .git
            .worktree_add(&self.project_dir, &path, head_sha, true)
            .await
        {
            if path.exists() {
                let _ = std::fs::remove_dir_all(&path);
            }
            return Err(e).with_context(|| format!("Failed to create worktree {name}"));
        }

        if !path.exists() {
            anyhow::bail!("Worktree {} reported created but missing on disk", name);
        }

        info!(worktree = %name, sha = head_sha, "created worktree");
        Ok(ManagedWorktree {
            name,
            path,
            head_commit_sha: head_sha.to_string(),
        })
    }

    /// Remove a worktree: `git worktree remove --force`, falling back to
    /// deleting the directory and pruning the registry.
    pub async fn remove(&self, path: &Path) {
        match self.git.worktree_remove(&self.project_dir, path, true).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed worktree");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "worktree remove failed, using fallback");
                if path.exists() {
                    let _ = std::fs::remove_dir_all(path);
                }
                let _ = self.git.worktree_prune(&self.project_dir).await;
            }
        }
    }

    /// Cleanup pass, run before each creation and idempotent:
    /// 1. delete on-disk directories not registered with git (orphans);
    /// 2. delete worktrees older than the age bound;
    /// 3. if still over the count bound, delete oldest first.
    pub async fn cleanup(&self) -> CleanupStats {
        let mut stats = CleanupStats::default();
        if !self.base_dir.exists() {
            return stats;
        }

        let registered = self.registered_paths().await;
        for entry in self.on_disk() {
            if !registered.contains(&entry.path) {
                debug!(path = %entry.path.display(), "removing orphaned worktree");
                let _ = std::fs::remove_dir_all(&entry.path);
                stats.orphaned += 1;
            }
        }
        let _ = self.git.worktree_prune(&self.project_dir).await;

        // Registry may have changed after the prune.
        let registered = self.registered_paths().await;
        let mut live: Vec<WorktreeAge> = self
            .on_disk()
            .into_iter()
            .filter(|w| registered.contains(&w.path))
            .collect();
        // Oldest first.
        live.sort_by(|a, b| {
            b.age_days
                .partial_cmp(&a.age_days)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut remaining = Vec::new();
        for worktree in live {
            if worktree.age_days > self.settings.max_age_days {
                debug!(
                    path = %worktree.path.display(),
                    age_days = worktree.age_days,
                    "removing expired worktree"
                );
                self.remove(&worktree.path).await;
                stats.expired += 1;
            } else {
                remaining.push(worktree);
            }
        }

        while remaining.len() > self.settings.max_count {
            let oldest = remaining.remove(0);
            debug!(path = %oldest.path.display(), "removing excess worktree");
            self.remove(&oldest.path).await;
            stats.excess += 1;
        }

        stats
    }

    /// Worktree directories currently on disk under the managed root,
    /// with their modification age.
    pub fn on_disk(&self) -> Vec<WorktreeAge> {
        let mut result = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.base_dir) else {
            return result;
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                continue;
            }
            let age_days = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .map(|d| d.as_secs_f64() / 86_400.0)
                .unwrap_or(0.0);
            result.push(WorktreeAge {
                path: entry.path(),
                age_days,
            });
        }
        result
    }

    async fn registered_paths(&self) -> Vec<PathBuf> {
        match self.git.worktree_list(&self.project_dir).await {
            Ok(entries) => entries.into_iter().map(|e| e.path).collect(),
            Err(e) => {
                warn!(error = %e, "could not list registered worktrees");
                Vec::new()
            }
        }
    }

    /// Enforce at most one live worktree per (id, sha).
    async fn remove_stale_for(&self, prefix: &str, id: &str, sha_short: &str) {
        let marker = format!("{prefix}-{id}-{sha_short}-");
        for entry in self.on_disk() {
            let name = entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if name.starts_with(&marker) {
                debug!(worktree = %name, "replacing prior worktree for same task and sha");
                self.remove(&entry.path).await;
            }
        }
    }
}
