use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use autoforge_config::AgentSettings;

use crate::error::AgentError;
use crate::gate::{CommandGate, PermissiveGate};
use crate::types::{AgentMessage, ResultSubtype, SessionOptions, SessionOutcome};

const CHANNEL_CAPACITY: usize = 256;

/// Client for the external coding agent. One client serves one task at a
/// time; concurrent tasks use independent instances.
pub struct AgentClient {
    settings: AgentSettings,
    gate: Arc<dyn CommandGate>,
}

impl AgentClient {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            gate: Arc::new(PermissiveGate),
        }
    }

    pub fn with_gate(settings: AgentSettings, gate: Arc<dyn CommandGate>) -> Self {
        Self { settings, gate }
    }

    /// Open a streaming session with a fresh context. The returned session
    /// yields typed messages until the agent's result message or an error.
    pub async fn open_session(
        &self,
        options: &SessionOptions,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<AgentSession, AgentError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(%session_id, model = %options.model, role = %options.role, "opening agent session");

        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&options.model);

        let tools = options.effective_tools();
        if !tools.is_empty() {
            cmd.arg("--allowed-tools").arg(tools.join(","));
        }
        if let Some(turns) = options.max_turns {
            cmd.arg("--max-turns").arg(turns.to_string());
        }
        if let Some(budget) = options.thinking_budget {
            cmd.env("MAX_THINKING_TOKENS", budget.to_string());
        }
        if !options.sub_agents.is_empty() {
            let defs = serde_json::to_string(&options.sub_agents)
                .map_err(|e| AgentError::Protocol(e.to_string()))?;
            cmd.arg("--agents").arg(defs);
        }
        if options.output_schema.is_some() {
            cmd.arg("--output-format-schema").arg(
                serde_json::to_string(options.output_schema.as_ref().unwrap_or(&Value::Null))
                    .map_err(|e| AgentError::Protocol(e.to_string()))?,
            );
        }

        cmd.current_dir(&options.project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
            binary: self.settings.binary.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let gate = self.gate.clone();
        let timeout = Duration::from_secs(self.settings.session_timeout_secs);
        let schema = options.output_schema.clone();

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            stream_child(child, tx, gate, schema, timeout, reader_cancel).await;
        });

        Ok(AgentSession { rx, cancel })
    }

    /// Run a session to completion and return its outcome. Structured
    /// output, when requested, is retried with fresh sessions up to the
    /// configured bound.
    pub async fn run_to_completion(
        &self,
        options: &SessionOptions,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome, AgentError> {
        let wants_schema = options.output_schema.is_some();
        let max_attempts = if wants_schema {
            self.settings.max_structured_output_retries.max(1)
        } else {
            1
        };

        for attempt in 1..=max_attempts {
            let mut session = self.open_session(options, prompt, cancel.clone()).await?;
            let outcome = session.collect().await?;

            if !wants_schema || outcome.structured_output.is_some() {
                return Ok(outcome);
            }
            debug!(attempt, "session produced no schema-valid output, retrying");
        }

        Err(AgentError::MaxStructuredOutputRetries {
            attempts: max_attempts,
        })
    }
}

/// A live session. Messages arrive in stream order; dropping the session
/// (or cancelling its token) aborts the child process. Files the agent
/// already wrote persist; cleanup is the caller's concern.
pub struct AgentSession {
    rx: mpsc::Receiver<Result<AgentMessage, AgentError>>,
    cancel: CancellationToken,
}

impl AgentSession {
    pub async fn next_message(&mut self) -> Option<Result<AgentMessage, AgentError>> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream, accumulating assistant text and the structured
    /// payload, until the result message arrives.
    pub async fn collect(&mut self) -> Result<SessionOutcome, AgentError> {
        let mut outcome = SessionOutcome::default();
        let mut saw_result = false;

        while let Some(message) = self.next_message().await {
            match message? {
                AgentMessage::AssistantText(text) => {
                    if !outcome.final_text.is_empty() {
                        outcome.final_text.push('\n');
                    }
                    outcome.final_text.push_str(&text);
                }
                AgentMessage::StructuredOutput(value) => {
                    // First validated payload wins; later ones are duplicates.
                    if outcome.structured_output.is_none() {
                        outcome.structured_output = Some(value);
                    }
                }
                AgentMessage::Result {
                    subtype,
                    is_error,
                    duration_ms,
                    num_turns,
                    total_cost_usd,
                } => {
                    outcome.subtype = Some(subtype);
                    outcome.is_error = is_error;
                    outcome.duration_ms = duration_ms;
                    outcome.num_turns = num_turns;
                    outcome.total_cost_usd = total_cost_usd;
                    saw_result = true;
                }
                _ => {}
            }
        }

        if !saw_result {
            return Err(AgentError::StreamClosed);
        }
        Ok(outcome)
    }
}

async fn stream_child(
    mut child: Child,
    tx: mpsc::Sender<Result<AgentMessage, AgentError>>,
    gate: Arc<dyn CommandGate>,
    schema: Option<Value>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let Some(stdout) = child.stdout.take() else {
        let _ = tx.send(Err(AgentError::StreamClosed)).await;
        return;
    };
    let mut lines = BufReader::new(stdout).lines();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut structured_seen = false;

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = tx.send(Err(AgentError::Cancelled)).await;
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.kill().await;
                let _ = tx.send(Err(AgentError::Timeout(timeout.as_secs()))).await;
                return;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(AgentError::Protocol(e.to_string()))).await;
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }
        let event: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping unparseable agent event");
                continue;
            }
        };

        for message in parse_event(&event, schema.as_ref(), &mut structured_seen) {
            if let AgentMessage::ToolUse { name, input, .. } = &message {
                if name == "Bash" {
                    let command = input
                        .get("command")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    let decision = gate.evaluate(command);
                    if !decision.allowed {
                        let _ = child.kill().await;
                        let _ = tx
                            .send(Err(AgentError::Protocol(format!(
                                "command denied by policy: {}",
                                decision.reason
                            ))))
                            .await;
                        return;
                    }
                }
            }
            if tx.send(Ok(message)).await.is_err() {
                let _ = child.kill().await;
                return;
            }
        }
    }

    let _ = child.wait().await;
}

/// Translate one wire event into zero or more typed messages.
fn parse_event(
    event: &Value,
    schema: Option<&Value>,
    structured_seen: &mut bool,
) -> Vec<AgentMessage> {
    let mut out = Vec::new();
    let kind = event.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match kind {
        "assistant" | "user" => {
            let content = event
                .pointer("/message/content")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for part in content {
                match part.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                            out.push(AgentMessage::AssistantText(text.to_string()));
                        }
                    }
                    "thinking" => {
                        if let Some(text) = part.get("thinking").and_then(|v| v.as_str()) {
                            out.push(AgentMessage::Thinking(text.to_string()));
                        }
                    }
                    "tool_use" => {
                        out.push(AgentMessage::ToolUse {
                            id: string_field(&part, "id"),
                            name: string_field(&part, "name"),
                            input: part.get("input").cloned().unwrap_or(Value::Null),
                        });
                    }
                    "tool_result" => {
                        let content = match part.get("content") {
                            Some(Value::String(s)) => s.clone(),
                            Some(other) => other.to_string(),
                            None => String::new(),
                        };
                        out.push(AgentMessage::ToolResult {
                            id: string_field(&part, "tool_use_id"),
                            is_error: part
                                .get("is_error")
                                .and_then(|v| v.as_bool())
                                .unwrap_or(false),
                            content,
                        });
                    }
                    _ => {}
                }
            }
        }
        "structured_output" => {
            if let Some(payload) = event.get("output") {
                if !*structured_seen && validates(payload, schema) {
                    *structured_seen = true;
                    out.push(AgentMessage::StructuredOutput(payload.clone()));
                }
            }
        }
        "result" => {
            // The result may itself carry the structured payload.
            if let Some(payload) = event.get("structured_output") {
                if !*structured_seen && validates(payload, schema) {
                    *structured_seen = true;
                    out.push(AgentMessage::StructuredOutput(payload.clone()));
                }
            }
            let subtype: ResultSubtype = event
                .get("subtype")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or(ResultSubtype::Other);
            out.push(AgentMessage::Result {
                subtype,
                is_error: event
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                duration_ms: event
                    .get("duration_ms")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                num_turns: event
                    .get("num_turns")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                total_cost_usd: event
                    .get("total_cost_usd")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0),
            });
        }
        _ => {}
    }

    out
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Shallow structural validation: the payload must be an object carrying
/// every property the schema marks required.
fn validates(payload: &Value, schema: Option<&Value>) -> bool {
    let Some(schema) = schema else {
        return true;
    };
    let Some(required) = schema.get("required").and_then(|v| v.as_array()) else {
        return payload.is_object();
    };
    let Some(object) = payload.as_object() else {
        return false;
    };
    required
        .iter()
        .filter_map(|r| r.as_str())
        .all(|key| object.contains_key(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_assistant_content_parts() {
        let event = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "done"},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}
            ]}
        });
        let mut seen = false;
        let messages = parse_event(&event, None, &mut seen);
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], AgentMessage::Thinking(_)));
        assert!(matches!(messages[1], AgentMessage::AssistantText(_)));
        assert!(
            matches!(&messages[2], AgentMessage::ToolUse { name, .. } if name == "Bash")
        );
    }

    #[test]
    fn structured_output_deduplicated() {
        let event = json!({"type": "structured_output", "output": {"verdict": "ok"}});
        let mut seen = false;
        assert_eq!(parse_event(&event, None, &mut seen).len(), 1);
        assert_eq!(parse_event(&event, None, &mut seen).len(), 0);
    }

    #[test]
    fn schema_required_keys_enforced() {
        let schema = json!({"required": ["verdict", "findings"]});
        assert!(validates(&json!({"verdict": "ok", "findings": []}), Some(&schema)));
        assert!(!validates(&json!({"verdict": "ok"}), Some(&schema)));
        assert!(!validates(&json!("bare string"), Some(&schema)));
    }

    #[test]
    fn result_event_parses_accounting() {
        let event = json!({
            "type": "result", "subtype": "success", "is_error": false,
            "duration_ms": 1200, "num_turns": 4, "total_cost_usd": 0.05
        });
        let mut seen = false;
        let messages = parse_event(&event, None, &mut seen);
        match &messages[0] {
            AgentMessage::Result {
                subtype, num_turns, ..
            } => {
                assert_eq!(*subtype, ResultSubtype::Success);
                assert_eq!(*num_turns, 4);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
