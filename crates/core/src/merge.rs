use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::evolution::types::{ChangeType, FileEvolution, SemanticChange, TaskSnapshot};
use crate::evolution::FileEvolutionStore;

/// Per-file strategy chosen by the decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    KeepBaseline,
    SingleTask,
    AutoCombine,
    AiMerge,
    Manual,
}

/// A change whose anchor no longer occurs in the content. Reported
/// out-of-band, never silently dropped into another region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedChange {
    pub task_id: String,
    pub change_type: ChangeType,
    pub anchor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMergeResult {
    pub file_path: String,
    pub strategy: MergeStrategy,
    /// Merged content; None when the baseline was kept (no snapshots, or
    /// the file needs manual review).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub needs_manual_review: bool,
    #[serde(default)]
    pub skipped_changes: Vec<SkippedChange>,
    #[serde(default)]
    pub conflicting_tasks: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeStats {
    pub files_processed: usize,
    pub files_auto_merged: usize,
    pub files_ai_merged: usize,
    pub files_need_review: usize,
    pub conflicts_detected: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MergeReport {
    pub tasks_merged: Vec<String>,
    pub file_results: BTreeMap<String, FileMergeResult>,
    pub stats: MergeStats,
}

/// Escalation hook for true conflicts: given the baseline and every
/// conflicting snapshot, produce merged content or decline.
#[async_trait]
pub trait AiMerger: Send + Sync {
    async fn merge(
        &self,
        file_path: &str,
        baseline: &str,
        snapshots: &[&TaskSnapshot],
    ) -> Result<Option<String>>;
}

/// AI merge backed by an agent session: the merger agent sees the
/// baseline and each task's intended change and returns the whole merged
/// file, or declines.
pub struct SessionAiMerger {
    runner: std::sync::Arc<dyn crate::orchestrator::SessionRunner>,
    model: String,
    project_root: std::path::PathBuf,
}

impl SessionAiMerger {
    pub fn new(
        runner: std::sync::Arc<dyn crate::orchestrator::SessionRunner>,
        model: impl Into<String>,
        project_root: std::path::PathBuf,
    ) -> Self {
        Self {
            runner,
            model: model.into(),
            project_root,
        }
    }
}

#[async_trait]
impl AiMerger for SessionAiMerger {
    async fn merge(
        &self,
        file_path: &str,
        baseline: &str,
        snapshots: &[&TaskSnapshot],
    ) -> Result<Option<String>> {
        use autoforge_agent::{AgentRole, SessionOptions};

        let mut prompt = format!(
            "Two or more tasks edited overlapping regions of `{file_path}`. Produce a \
             single merged version that preserves every task's intent, or decline if \
             the intents genuinely contradict.\n\nBaseline content:\n```\n{baseline}\n```\n"
        );
        for snapshot in snapshots {
            prompt.push_str(&format!(
                "\nTask {} ({}):\n",
                snapshot.task_id, snapshot.task_intent
            ));
            for change in &snapshot.semantic_changes {
                if let (Some(before), Some(after)) =
                    (change.content_before.as_deref(), change.content_after.as_deref())
                {
                    prompt.push_str(&format!("replace:\n{before}\nwith:\n{after}\n"));
                } else if let Some(after) = change.content_after.as_deref() {
                    prompt.push_str(&format!("add:\n{after}\n"));
                }
            }
        }
        prompt.push_str(
            "\nRespond in structured output: `merged_content` with the full merged \
             file, or `declined` set to true.",
        );

        let mut options = SessionOptions::new(
            self.model.clone(),
            AgentRole::Merger,
            self.project_root.clone(),
        );
        options.output_schema = Some(serde_json::json!({
            "type": "object",
            "properties": {
                "merged_content": {"type": "string"},
                "declined": {"type": "boolean"}
            }
        }));

        let outcome = self
            .runner
            .run(&options, &prompt, tokio_util::sync::CancellationToken::new())
            .await?;
        let Some(payload) = outcome.structured_output else {
            return Ok(None);
        };
        if payload
            .get("declined")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Ok(None);
        }
        Ok(payload
            .get("merged_content")
            .and_then(|v| v.as_str())
            .map(String::from))
    }
}

pub struct MergeEngine {
    ai: Option<Box<dyn AiMerger>>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self { ai: None }
    }

    pub fn with_ai_merger(ai: Box<dyn AiMerger>) -> Self {
        Self { ai: Some(ai) }
    }

    /// Decide the strategy for one file given the snapshots of the tasks
    /// being applied.
    pub fn decide_strategy(
        &self,
        evolution: &FileEvolution,
        task_ids: &[String],
        baseline: &str,
    ) -> MergeStrategy {
        let snapshots = select_snapshots(evolution, task_ids);
        match snapshots.len() {
            0 => return MergeStrategy::KeepBaseline,
            1 => return MergeStrategy::SingleTask,
            _ => {}
        }

        // An opaque snapshot alongside others cannot be reconciled.
        let any_opaque = snapshots
            .iter()
            .any(|s| s.semantic_changes.iter().any(|c| c.is_opaque()));
        if any_opaque {
            return MergeStrategy::Manual;
        }

        if snapshots_conflict(&snapshots, baseline) {
            if self.ai.is_some() {
                MergeStrategy::AiMerge
            } else {
                MergeStrategy::Manual
            }
        } else {
            MergeStrategy::AutoCombine
        }
    }

    /// Merge one file. On conflict with no AI merger (or an AI decline),
    /// the baseline is left unchanged and the file is flagged for manual
    /// review; the build continues with other files.
    pub async fn merge_file(
        &self,
        evolution: &FileEvolution,
        task_ids: &[String],
        baseline: &str,
    ) -> FileMergeResult {
        let strategy = self.decide_strategy(evolution, task_ids, baseline);
        let snapshots = select_snapshots(evolution, task_ids);

        match strategy {
            MergeStrategy::KeepBaseline => FileMergeResult {
                file_path: evolution.file_path.clone(),
                strategy,
                content: None,
                needs_manual_review: false,
                skipped_changes: Vec::new(),
                conflicting_tasks: Vec::new(),
            },
            MergeStrategy::SingleTask | MergeStrategy::AutoCombine => {
                let (content, skipped) =
                    combine_changes(baseline, &snapshots, &evolution.file_path);
                FileMergeResult {
                    file_path: evolution.file_path.clone(),
                    strategy,
                    content: Some(content),
                    needs_manual_review: false,
                    skipped_changes: skipped,
                    conflicting_tasks: Vec::new(),
                }
            }
            MergeStrategy::AiMerge => {
                let merged = match &self.ai {
                    Some(ai) => ai
                        .merge(&evolution.file_path, baseline, &snapshots)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(file = %evolution.file_path, error = %e, "ai merge failed");
                            None
                        }),
                    None => None,
                };
                let conflicting: Vec<String> =
                    snapshots.iter().map(|s| s.task_id.clone()).collect();
                match merged {
                    Some(content) => FileMergeResult {
                        file_path: evolution.file_path.clone(),
                        strategy,
                        content: Some(content),
                        needs_manual_review: false,
                        skipped_changes: Vec::new(),
                        conflicting_tasks: conflicting,
                    },
                    None => FileMergeResult {
                        file_path: evolution.file_path.clone(),
                        strategy: MergeStrategy::Manual,
                        content: None,
                        needs_manual_review: true,
                        skipped_changes: Vec::new(),
                        conflicting_tasks: conflicting,
                    },
                }
            }
            MergeStrategy::Manual => FileMergeResult {
                file_path: evolution.file_path.clone(),
                strategy,
                content: None,
                needs_manual_review: true,
                skipped_changes: Vec::new(),
                conflicting_tasks: snapshots.iter().map(|s| s.task_id.clone()).collect(),
            },
        }
    }

    /// Merge every tracked file touched by the given tasks.
    pub async fn merge_tasks(
        &self,
        store: &FileEvolutionStore,
        task_ids: &[String],
    ) -> MergeReport {
        let mut report = MergeReport {
            tasks_merged: task_ids.to_vec(),
            ..Default::default()
        };

        for (path, evolution) in store.evolutions() {
            if !task_ids
                .iter()
                .any(|t| evolution.task_snapshot(t).is_some())
            {
                continue;
            }
            let Some(baseline) = store.baseline_content(evolution) else {
                warn!(file = %path, "baseline missing, skipping file");
                continue;
            };

            let result = self.merge_file(evolution, task_ids, &baseline).await;
            report.stats.files_processed += 1;
            match result.strategy {
                MergeStrategy::AutoCombine | MergeStrategy::SingleTask => {
                    report.stats.files_auto_merged += 1
                }
                MergeStrategy::AiMerge => report.stats.files_ai_merged += 1,
                MergeStrategy::Manual => {
                    report.stats.files_need_review += 1;
                    report.stats.conflicts_detected += 1;
                }
                MergeStrategy::KeepBaseline => {}
            }
            debug!(file = %path, strategy = ?result.strategy, "merged file");
            report.file_results.insert(path.clone(), result);
        }

        info!(
            files = report.stats.files_processed,
            auto = report.stats.files_auto_merged,
            review = report.stats.files_need_review,
            "merge complete"
        );
        report
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn select_snapshots<'a>(
    evolution: &'a FileEvolution,
    task_ids: &[String],
) -> Vec<&'a TaskSnapshot> {
    // Sorted by task id so the combined output does not depend on the
    // order the caller listed the tasks in.
    let mut snapshots: Vec<&TaskSnapshot> = evolution
        .task_snapshots
        .iter()
        .filter(|s| task_ids.contains(&s.task_id))
        .filter(|s| s.content_hash_after.is_some() && s.has_changes())
        .collect();
    snapshots.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    snapshots
}

/// Two modify anchors overlap when they are equal or one encloses the
/// other; an anchor that is not unique in the baseline is also unsafe to
/// substitute.
fn snapshots_conflict(snapshots: &[&TaskSnapshot], baseline: &str) -> bool {
    let normalized = crate::evolution::types::normalize_lf(baseline);
    let mut anchors: Vec<(&str, &str)> = Vec::new();

    for snapshot in snapshots {
        for change in &snapshot.semantic_changes {
            if !change.change_type.is_modify() {
                continue;
            }
            let Some(before) = change.content_before.as_deref() else {
                continue;
            };
            if before.is_empty() {
                continue;
            }
            if normalized.matches(before).count() != 1 {
                return true;
            }
            anchors.push((snapshot.task_id.as_str(), before));
        }
    }

    for (i, (task_a, a)) in anchors.iter().enumerate() {
        for (task_b, b) in &anchors[i + 1..] {
            if task_a == task_b {
                continue;
            }
            if a == b || a.contains(b) || b.contains(a) {
                return true;
            }
        }
    }
    false
}

/// Line-ending style detection, by priority: CRLF, then lone CR, then LF.
fn detect_line_ending(content: &str) -> &'static str {
    if content.contains("\r\n") {
        "\r\n"
    } else if content.contains('\r') {
        "\r"
    } else {
        "\n"
    }
}

fn restore_line_ending(content: String, ending: &str) -> String {
    match ending {
        "\r\n" => content.replace('\n', "\r\n"),
        "\r" => content.replace('\n', "\r"),
        _ => content,
    }
}

/// Where new imports go: immediately after the last existing import-like
/// line for the file's language.
fn find_import_end(lines: &[&str], file_path: &str) -> usize {
    let extension = Path::new(file_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let mut last_import = 0;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let is_import = match extension.as_str() {
            "py" => trimmed.starts_with("import ") || trimmed.starts_with("from "),
            "js" | "jsx" | "ts" | "tsx" | "mjs" => trimmed.starts_with("import "),
            "rs" => trimmed.starts_with("use "),
            _ => false,
        };
        if is_import {
            last_import = i + 1;
        }
    }
    last_import
}

/// Apply snapshots onto the baseline in the fixed order imports →
/// modifications → functions → other. Idempotent: imports are deduped
/// against current content, and a modification whose anchor equals its
/// replacement target is a no-op on reapplication. The output keeps the
/// baseline's line-ending style.
fn combine_changes(
    baseline: &str,
    snapshots: &[&TaskSnapshot],
    file_path: &str,
) -> (String, Vec<SkippedChange>) {
    let original_ending = detect_line_ending(baseline);
    let mut content = crate::evolution::types::normalize_lf(baseline);
    let mut skipped = Vec::new();

    let mut imports: Vec<(&str, &SemanticChange)> = Vec::new();
    let mut modifications: Vec<(&str, &SemanticChange)> = Vec::new();
    let mut functions: Vec<(&str, &SemanticChange)> = Vec::new();
    let mut other: Vec<(&str, &SemanticChange)> = Vec::new();

    for snapshot in snapshots {
        for change in &snapshot.semantic_changes {
            let slot = match change.change_type {
                ChangeType::AddImport => &mut imports,
                ChangeType::AddFunction => &mut functions,
                ChangeType::ModifyRegion | ChangeType::ModifyOther => &mut modifications,
                _ => &mut other,
            };
            slot.push((snapshot.task_id.as_str(), change));
        }
    }

    if !imports.is_empty() {
        let has_trailing_newline = content.ends_with('\n');
        let mut lines: Vec<String> = content.lines().map(String::from).collect();
        let mut insert_at = {
            let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
            find_import_end(&line_refs, file_path)
        };
        for (_, change) in &imports {
            let import_line = change
                .content_after
                .as_deref()
                .unwrap_or("")
                .trim_end_matches(['\n', '\r']);
            if import_line.is_empty() || lines.iter().any(|l| l == import_line) {
                continue;
            }
            lines.insert(insert_at, import_line.to_string());
            insert_at += 1;
        }
        content = lines.join("\n");
        if has_trailing_newline {
            content.push('\n');
        }
    }

    for (task_id, change) in &modifications {
        match (change.content_before.as_deref(), change.content_after.as_deref()) {
            (Some(before), Some(after)) if !before.is_empty() => {
                if content.contains(before) {
                    content = content.replace(before, after);
                } else if !content.contains(after) {
                    // Anchor gone and the replacement is not already
                    // present: report, do not guess a location.
                    skipped.push(SkippedChange {
                        task_id: task_id.to_string(),
                        change_type: change.change_type,
                        anchor: before.to_string(),
                    });
                }
            }
            (None, Some(after)) if !after.is_empty() => {
                if !content.contains(after) {
                    content.push('\n');
                    content.push_str(after);
                }
            }
            _ => {}
        }
    }

    for (_, change) in &functions {
        if let Some(after) = change.content_after.as_deref() {
            if !after.is_empty() && !content.contains(after) {
                content.push_str("\n\n");
                content.push_str(after);
            }
        }
    }

    for (task_id, change) in &other {
        match (change.content_before.as_deref(), change.content_after.as_deref()) {
            (Some(before), None) if !before.is_empty() => {
                // Removal: drop the anchored region when present.
                if content.contains(before) {
                    content = content.replace(before, "");
                } else {
                    skipped.push(SkippedChange {
                        task_id: task_id.to_string(),
                        change_type: change.change_type,
                        anchor: before.to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    (restore_line_ending(content, original_ending), skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::types::compute_content_hash;
    use chrono::Utc;

    const BASELINE: &str = "import a\ndef main():\n    return 1\n";

    fn evolution_with(snapshots: Vec<TaskSnapshot>) -> FileEvolution {
        FileEvolution {
            file_path: "app.py".into(),
            baseline_commit: "c0".into(),
            baseline_captured_at: Utc::now(),
            baseline_content_hash: compute_content_hash(BASELINE),
            baseline_snapshot_path: "baselines/t/app.py.baseline".into(),
            task_snapshots: snapshots,
        }
    }

    fn snapshot(task_id: &str, changes: Vec<SemanticChange>) -> TaskSnapshot {
        let mut snapshot = TaskSnapshot::new(task_id, "", compute_content_hash(BASELINE));
        snapshot.content_hash_after = Some("after".into());
        snapshot.semantic_changes = changes;
        snapshot
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn no_snapshots_keeps_baseline() {
        let engine = MergeEngine::new();
        let evolution = evolution_with(vec![]);
        let result = engine.merge_file(&evolution, &ids(&["t1"]), BASELINE).await;
        assert_eq!(result.strategy, MergeStrategy::KeepBaseline);
        assert!(result.content.is_none());
    }

    #[tokio::test]
    async fn auto_combine_import_and_modification() {
        let engine = MergeEngine::new();
        let t1 = snapshot(
            "t1",
            vec![SemanticChange::added(ChangeType::AddImport, "import b")],
        );
        let t2 = snapshot("t2", vec![SemanticChange::modified("return 1", "return 2")]);
        let evolution = evolution_with(vec![t1, t2]);

        let result = engine
            .merge_file(&evolution, &ids(&["t1", "t2"]), BASELINE)
            .await;
        assert_eq!(result.strategy, MergeStrategy::AutoCombine);
        assert_eq!(
            result.content.as_deref(),
            Some("import a\nimport b\ndef main():\n    return 2\n")
        );
        assert!(result.skipped_changes.is_empty());
    }

    #[tokio::test]
    async fn combine_is_order_independent() {
        let engine = MergeEngine::new();
        let t1 = snapshot(
            "t1",
            vec![SemanticChange::added(ChangeType::AddImport, "import b")],
        );
        let t2 = snapshot("t2", vec![SemanticChange::modified("return 1", "return 2")]);

        let forward = evolution_with(vec![t1.clone(), t2.clone()]);
        let reverse = evolution_with(vec![t2, t1]);

        let a = engine
            .merge_file(&forward, &ids(&["t1", "t2"]), BASELINE)
            .await;
        let b = engine
            .merge_file(&reverse, &ids(&["t2", "t1"]), BASELINE)
            .await;
        assert_eq!(a.content, b.content);
    }

    #[tokio::test]
    async fn combine_is_idempotent() {
        let engine = MergeEngine::new();
        let t1 = snapshot(
            "t1",
            vec![
                SemanticChange::added(ChangeType::AddImport, "import b"),
                SemanticChange::modified("return 1", "return 2"),
            ],
        );
        let evolution = evolution_with(vec![t1]);

        let once = engine
            .merge_file(&evolution, &ids(&["t1"]), BASELINE)
            .await
            .content
            .unwrap();
        let twice = engine
            .merge_file(&evolution, &ids(&["t1"]), &once)
            .await
            .content
            .unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn crlf_baseline_keeps_crlf_output() {
        let engine = MergeEngine::new();
        let crlf_baseline = BASELINE.replace('\n', "\r\n");
        let t1 = snapshot(
            "t1",
            vec![SemanticChange::added(ChangeType::AddImport, "import b")],
        );
        let t2 = snapshot("t2", vec![SemanticChange::modified("return 1", "return 2")]);
        let evolution = evolution_with(vec![t1, t2]);

        let result = engine
            .merge_file(&evolution, &ids(&["t1", "t2"]), &crlf_baseline)
            .await;
        let content = result.content.unwrap();
        assert!(content.contains("import b\r\n"));
        assert!(!content.replace("\r\n", "").contains('\n'));
        assert!(content.ends_with("\r\n"));
    }

    #[tokio::test]
    async fn same_anchor_conflict_escalates_to_manual() {
        let engine = MergeEngine::new();
        let t1 = snapshot("t1", vec![SemanticChange::modified("return 1", "return 2")]);
        let t2 = snapshot("t2", vec![SemanticChange::modified("return 1", "return 3")]);
        let evolution = evolution_with(vec![t1, t2]);

        let result = engine
            .merge_file(&evolution, &ids(&["t1", "t2"]), BASELINE)
            .await;
        assert_eq!(result.strategy, MergeStrategy::Manual);
        assert!(result.needs_manual_review);
        assert!(result.content.is_none());
        assert_eq!(result.conflicting_tasks, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn opaque_snapshot_with_others_is_manual() {
        let engine = MergeEngine::new();
        let t1 = snapshot("t1", vec![SemanticChange::opaque()]);
        let t2 = snapshot("t2", vec![SemanticChange::modified("return 1", "return 2")]);
        let evolution = evolution_with(vec![t1, t2]);

        assert_eq!(
            engine.decide_strategy(&evolution, &ids(&["t1", "t2"]), BASELINE),
            MergeStrategy::Manual
        );
    }

    #[tokio::test]
    async fn missing_anchor_is_skipped_and_reported() {
        let engine = MergeEngine::new();
        let t1 = snapshot(
            "t1",
            vec![SemanticChange::modified("return 42", "return 43")],
        );
        let evolution = evolution_with(vec![t1]);

        let result = engine.merge_file(&evolution, &ids(&["t1"]), BASELINE).await;
        let content = result.content.unwrap();
        assert_eq!(content, BASELINE);
        assert_eq!(result.skipped_changes.len(), 1);
        assert_eq!(result.skipped_changes[0].anchor, "return 42");
    }

    struct TakeFirst;

    #[async_trait]
    impl AiMerger for TakeFirst {
        async fn merge(
            &self,
            _file_path: &str,
            baseline: &str,
            snapshots: &[&TaskSnapshot],
        ) -> Result<Option<String>> {
            let first = snapshots.first().and_then(|s| {
                s.semantic_changes
                    .first()
                    .and_then(|c| c.content_after.clone())
            });
            Ok(first.map(|after| baseline.replace("return 1", &after)))
        }
    }

    #[tokio::test]
    async fn conflict_with_ai_merger_resolves() {
        let engine = MergeEngine::with_ai_merger(Box::new(TakeFirst));
        let t1 = snapshot("t1", vec![SemanticChange::modified("return 1", "return 2")]);
        let t2 = snapshot("t2", vec![SemanticChange::modified("return 1", "return 3")]);
        let evolution = evolution_with(vec![t1, t2]);

        let result = engine
            .merge_file(&evolution, &ids(&["t1", "t2"]), BASELINE)
            .await;
        assert_eq!(result.strategy, MergeStrategy::AiMerge);
        assert!(!result.needs_manual_review);
        assert!(result.content.unwrap().contains("return 2"));
    }

    #[tokio::test]
    async fn ambiguous_anchor_counts_as_conflict() {
        let baseline = "def a():\n    return 1\n\ndef b():\n    return 1\n";
        let engine = MergeEngine::new();
        let t1 = snapshot("t1", vec![SemanticChange::modified("    return 1", "    return 2")]);
        let t2 = snapshot(
            "t2",
            vec![SemanticChange::added(ChangeType::AddImport, "import x")],
        );
        let evolution = evolution_with(vec![t1, t2]);

        assert_eq!(
            engine.decide_strategy(&evolution, &ids(&["t1", "t2"]), baseline),
            MergeStrategy::Manual
        );
    }
}
