use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

pub const STATUS_FILE: &str = ".autoforge-status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Idle,
    Planning,
    Building,
    Qa,
    Complete,
    Paused,
    Error,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SubtaskCounts {
    pub completed: usize,
    pub total: usize,
    pub in_progress: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseStatus {
    pub current: String,
    pub id: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub active: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub number: u32,
    pub started_at: DateTime<Utc>,
}

/// Snapshot written to `.autoforge-status` for UIs to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub active: bool,
    pub spec: String,
    pub state: BuildState,
    pub subtasks: SubtaskCounts,
    pub phase: PhaseStatus,
    pub workers: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionStatus>,
    pub last_update: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn idle(spec: impl Into<String>) -> Self {
        Self {
            active: false,
            spec: spec.into(),
            state: BuildState::Idle,
            subtasks: SubtaskCounts::default(),
            phase: PhaseStatus::default(),
            workers: WorkerStatus::default(),
            session: None,
            last_update: Utc::now(),
        }
    }
}

enum Command {
    Update(Box<StatusSnapshot>),
    Flush(oneshot::Sender<()>),
}

/// Debounced, atomic status writer. Updates are coalesced over a short
/// window so rapid progress events produce one disk write; each write is
/// temp-file + rename.
pub struct StatusWriter {
    tx: mpsc::Sender<Command>,
}

impl StatusWriter {
    pub fn spawn(path: PathBuf, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(writer_loop(path, debounce, rx));
        Self { tx }
    }

    /// Queue an update. Dropping under backpressure is fine: a newer
    /// snapshot supersedes anything lost.
    pub fn update(&self, mut snapshot: StatusSnapshot) {
        snapshot.last_update = Utc::now();
        let _ = self.tx.try_send(Command::Update(Box::new(snapshot)));
    }

    /// Drain pending updates to disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn writer_loop(path: PathBuf, debounce: Duration, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        let mut pending = match command {
            Command::Update(snapshot) => Some(*snapshot),
            Command::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };

        // Coalesce everything that arrives inside the debounce window.
        let deadline = tokio::time::Instant::now() + debounce;
        let mut acks = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Command::Update(snapshot))) => pending = Some(*snapshot),
                Ok(Some(Command::Flush(ack))) => {
                    acks.push(ack);
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }

        if let Some(snapshot) = pending.take() {
            write_atomic(&path, &snapshot);
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }
}

fn write_atomic(path: &PathBuf, snapshot: &StatusSnapshot) {
    let Ok(json) = serde_json::to_string_pretty(snapshot) else {
        return;
    };
    let dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let result = tempfile::NamedTempFile::new_in(&dir).and_then(|mut tmp| {
        tmp.write_all(json.as_bytes())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    });
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "status write failed");
    }
}
