use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{AutoFixState, MergeVerdict, PrReviewResult, TriageResult};

const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIndexEntry {
    pub review_id: String,
    pub reviewed_commit_sha: Option<String>,
    pub verdict: MergeVerdict,
    pub success: bool,
    pub reviewed_at: DateTime<Utc>,
}

/// Repository-level persistence for review, triage, and auto-fix records
/// under `<state>/github/`. Multi-writer JSON files take an advisory
/// lock with a bounded wait; writes are temp-file + rename.
pub struct GitHubStore {
    root: PathBuf,
    archive_keep_per_pr: usize,
}

impl GitHubStore {
    pub fn open(state_dir: &Path, archive_keep_per_pr: usize) -> Result<Self> {
        let root = state_dir.join("github");
        for sub in ["pr", "issues", "archive"] {
            std::fs::create_dir_all(root.join(sub))
                .with_context(|| format!("Failed to create {}", root.join(sub).display()))?;
        }
        Ok(Self {
            root,
            archive_keep_per_pr,
        })
    }

    pub fn pr_dir(&self) -> PathBuf {
        self.root.join("pr")
    }

    pub fn worktree_dir(&self) -> PathBuf {
        self.root.join("pr").join("worktrees")
    }

    fn review_path(&self, pr_number: u64) -> PathBuf {
        self.pr_dir().join(format!("review_{pr_number}.json"))
    }

    /// Persist a review result. The previous record for the PR, if any,
    /// moves to the archive so history is append-only.
    pub fn save_review(&self, result: &PrReviewResult) -> Result<()> {
        let path = self.review_path(result.pr_number);
        let _lock = IndexLock::acquire(&self.index_lock_path())?;

        if path.exists() {
            let archived = self.root.join("archive").join(format!(
                "review_{}_{}.json",
                result.pr_number,
                Utc::now().timestamp_millis()
            ));
            if let Err(e) = std::fs::rename(&path, &archived) {
                warn!(error = %e, "could not archive previous review");
            }
            self.prune_archive(result.pr_number);
        }

        write_json_atomic(&path, result)?;
        self.update_index(result)?;
        debug!(pr = result.pr_number, id = %result.id, "saved review result");
        Ok(())
    }

    pub fn load_latest_review(&self, pr_number: u64) -> Option<PrReviewResult> {
        let path = self.review_path(pr_number);
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(pr = pr_number, error = %e, "corrupt review record");
                None
            }
        }
    }

    fn index_path(&self) -> PathBuf {
        self.pr_dir().join("index.json")
    }

    fn index_lock_path(&self) -> PathBuf {
        self.pr_dir().join("index.json.lock")
    }

    pub fn load_index(&self) -> BTreeMap<u64, ReviewIndexEntry> {
        let Ok(content) = std::fs::read_to_string(self.index_path()) else {
            return BTreeMap::new();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    fn update_index(&self, result: &PrReviewResult) -> Result<()> {
        let mut index = self.load_index();
        index.insert(
            result.pr_number,
            ReviewIndexEntry {
                review_id: result.id.clone(),
                reviewed_commit_sha: result.reviewed_commit_sha.clone(),
                verdict: result.verdict,
                success: result.success,
                reviewed_at: result.reviewed_at,
            },
        );
        write_json_atomic(&self.index_path(), &index)
    }

    /// Has this exact head sha already been reviewed successfully?
    pub fn was_reviewed(&self, pr_number: u64, head_sha: &str) -> bool {
        self.load_index()
            .get(&pr_number)
            .map(|entry| {
                entry.success && entry.reviewed_commit_sha.as_deref() == Some(head_sha)
            })
            .unwrap_or(false)
    }

    fn prune_archive(&self, pr_number: u64) {
        let prefix = format!("review_{pr_number}_");
        let archive = self.root.join("archive");
        let Ok(entries) = std::fs::read_dir(&archive) else {
            return;
        };
        let mut matching: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        // Timestamped names sort chronologically.
        matching.sort();
        while matching.len() > self.archive_keep_per_pr {
            let oldest = matching.remove(0);
            let _ = std::fs::remove_file(oldest);
        }
    }

    pub fn save_triage(&self, result: &TriageResult) -> Result<()> {
        let path = self
            .root
            .join("issues")
            .join(format!("triage_{}.json", result.issue_number));
        write_json_atomic(&path, result)
    }

    pub fn save_autofix(&self, state: &AutoFixState) -> Result<()> {
        let _lock = IndexLock::acquire(&self.root.join("issues").join("index.json.lock"))?;
        let path = self
            .root
            .join("issues")
            .join(format!("autofix_{}.json", state.issue_number));
        write_json_atomic(&path, state)
    }

    pub fn load_autofix(&self, issue_number: u64) -> Option<AutoFixState> {
        let path = self
            .root
            .join("issues")
            .join(format!("autofix_{issue_number}.json"));
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}

/// Advisory lock with a bounded wait. Dropping releases the lock.
struct IndexLock {
    file: std::fs::File,
}

impl IndexLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock {}", path.display()))?;
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_RETRY),
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Could not lock {} within {:?}", path.display(), LOCK_WAIT)
                    })
                }
            }
        }
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> GitHubStore {
        GitHubStore::open(dir, 2).unwrap()
    }

    fn result(pr: u64, sha: &str) -> PrReviewResult {
        let mut result = PrReviewResult::failed(pr, "owner/repo", "placeholder");
        result.success = true;
        result.error = None;
        result.verdict = MergeVerdict::ReadyToMerge;
        result.reviewed_commit_sha = Some(sha.to_string());
        result
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save_review(&result(7, "aaa")).unwrap();

        let loaded = store.load_latest_review(7).unwrap();
        assert_eq!(loaded.pr_number, 7);
        assert_eq!(loaded.reviewed_commit_sha.as_deref(), Some("aaa"));
    }

    #[test]
    fn previous_review_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save_review(&result(7, "aaa")).unwrap();
        store.save_review(&result(7, "bbb")).unwrap();

        let archive = dir.path().join("github/archive");
        let archived: Vec<_> = std::fs::read_dir(&archive).unwrap().flatten().collect();
        assert_eq!(archived.len(), 1);
        assert_eq!(
            store
                .load_latest_review(7)
                .unwrap()
                .reviewed_commit_sha
                .as_deref(),
            Some("bbb")
        );
    }

    #[test]
    fn archive_is_pruned_to_keep_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        for (i, sha) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let mut r = result(7, sha);
            r.id = format!("review-{i}");
            store.save_review(&r).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        let archive = dir.path().join("github/archive");
        let archived: Vec<_> = std::fs::read_dir(&archive).unwrap().flatten().collect();
        assert!(archived.len() <= 2);
    }

    #[test]
    fn was_reviewed_requires_success_and_same_sha() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save_review(&result(7, "aaa")).unwrap();
        assert!(store.was_reviewed(7, "aaa"));
        assert!(!store.was_reviewed(7, "bbb"));

        let mut failed = result(8, "ccc");
        failed.success = false;
        store.save_review(&failed).unwrap();
        assert!(!store.was_reviewed(8, "ccc"));
    }
}
