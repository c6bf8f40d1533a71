use std::sync::Arc;

use autoforge_agent::{AgentRole, SessionOptions};
use autoforge_core::orchestrator::SessionRunner;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::GitHubError;
use crate::gh::GhClient;
use crate::models::{TriageCategory, TriageResult};
use crate::store::GitHubStore;

fn triage_output_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["category", "priority", "response"],
        "properties": {
            "category": {"type": "string"},
            "priority": {"type": "string"},
            "labels": {"type": "array", "items": {"type": "string"}},
            "response": {"type": "string"}
        }
    })
}

/// Classifies open issues and posts the triage outcome back as labels
/// and a comment.
pub struct TriageEngine {
    client: Arc<GhClient>,
    runner: Arc<dyn SessionRunner>,
    store: Arc<GitHubStore>,
    model: String,
    project_root: std::path::PathBuf,
}

impl TriageEngine {
    pub fn new(
        client: Arc<GhClient>,
        runner: Arc<dyn SessionRunner>,
        store: Arc<GitHubStore>,
        model: String,
        project_root: std::path::PathBuf,
    ) -> Self {
        Self {
            client,
            runner,
            store,
            model,
            project_root,
        }
    }

    pub async fn triage_issue(
        &self,
        issue_number: u64,
        cancel: CancellationToken,
    ) -> Result<TriageResult, GitHubError> {
        let issue = self.client.issue_view(issue_number).await?;
        let title = issue.get("title").and_then(|v| v.as_str()).unwrap_or("");
        let body = issue.get("body").and_then(|v| v.as_str()).unwrap_or("");

        let mut options = SessionOptions::new(
            self.model.clone(),
            AgentRole::Triage,
            self.project_root.clone(),
        );
        options.output_schema = Some(triage_output_schema());
        let prompt = format!(
            "Triage this GitHub issue against the repository in the working \
             directory.\n\nIssue #{issue_number}: {title}\n\n{body}\n\n\
             Classify it (bug, feature, documentation, question, duplicate, spam, \
             feature_creep), assign a priority (high, medium, low), suggest labels, \
             and draft a short response to the author."
        );

        let outcome = self
            .runner
            .run(&options, &prompt, cancel)
            .await
            .map_err(|e| GitHubError::Parse(format!("triage session failed: {e}")))?;
        let payload = outcome
            .structured_output
            .ok_or_else(|| GitHubError::Parse("triage produced no structured output".into()))?;

        let result = parse_triage_payload(issue_number, &payload);
        if let Err(e) = self.store.save_triage(&result) {
            warn!(issue_number, error = %e, "could not persist triage result");
        }

        if let Err(e) = self
            .client
            .add_issue_labels(issue_number, &result.labels)
            .await
        {
            warn!(issue_number, error = %e, "could not apply labels");
        }
        if !result.response.is_empty() {
            if let Err(e) = self
                .client
                .post_issue_comment(issue_number, &result.response)
                .await
            {
                warn!(issue_number, error = %e, "could not post triage comment");
            }
        }

        info!(issue_number, category = ?result.category, "issue triaged");
        Ok(result)
    }
}

fn parse_triage_payload(issue_number: u64, payload: &Value) -> TriageResult {
    let category = match payload
        .get("category")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase()
        .as_str()
    {
        "bug" => TriageCategory::Bug,
        "feature" => TriageCategory::Feature,
        "documentation" => TriageCategory::Documentation,
        "duplicate" => TriageCategory::Duplicate,
        "spam" => TriageCategory::Spam,
        "feature_creep" => TriageCategory::FeatureCreep,
        _ => TriageCategory::Question,
    };
    TriageResult {
        issue_number,
        category,
        priority: payload
            .get("priority")
            .and_then(|v| v.as_str())
            .unwrap_or("medium")
            .to_string(),
        labels: payload
            .get("labels")
            .and_then(|v| v.as_array())
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|l| l.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
        response: payload
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        triaged_at: Utc::now(),
    }
}
