use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use autoforge_agent::{
    AgentClient, AgentError, AgentRole, SessionOptions, SessionOutcome,
};
use autoforge_config::Config;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::attempts::AttemptHistory;
use crate::evolution::FileEvolutionStore;
use crate::git::GitAdapter;
use crate::plan::{self, ImplementationPlan, SubtaskStatus};
use crate::prompts;
use crate::specs::{SessionInsight, Spec};
use crate::status::{
    BuildState, PhaseStatus, SessionStatus, StatusSnapshot, StatusWriter, SubtaskCounts,
    WorkerStatus, STATUS_FILE,
};

/// Terminal state of one build run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Every subtask completed.
    Complete,
    /// At least one subtask exhausted its attempts; the rest may have
    /// completed.
    Stuck,
    /// Stopped by the PAUSE sentinel or a cancellation request.
    Paused,
    Error(String),
}

/// Seam for driving agent sessions, so the loop can be exercised against
/// a stub without the external binary.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn run(
        &self,
        options: &SessionOptions,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome, AgentError>;
}

#[async_trait]
impl SessionRunner for AgentClient {
    async fn run(
        &self,
        options: &SessionOptions,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome, AgentError> {
        self.run_to_completion(options, prompt, cancel).await
    }
}

/// Drives the planner-then-coder loop for one spec. One orchestrator per
/// spec; multiple specs run as independent orchestrators with disjoint
/// worktrees. Every piece of persistent state lives in files and git, so
/// any iteration boundary is a safe restart point.
pub struct SessionOrchestrator {
    spec: Spec,
    project_dir: PathBuf,
    config: Config,
    runner: Arc<dyn SessionRunner>,
    git: GitAdapter,
    status: StatusWriter,
    evolution: tokio::sync::Mutex<FileEvolutionStore>,
    /// Soft stop: finish the current session, then exit cleanly. Set by
    /// a first Ctrl-C; only a second one fires the hard `cancel` token.
    pause: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SessionOrchestrator {
    pub fn new(
        spec: Spec,
        project_dir: PathBuf,
        config: Config,
        runner: Arc<dyn SessionRunner>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let git = GitAdapter::new(config.git.clone());
        let status = StatusWriter::spawn(
            spec.spec_dir.join(STATUS_FILE),
            Duration::from_millis(config.orchestrator.status_debounce_ms),
        );
        let evolution = tokio::sync::Mutex::new(FileEvolutionStore::open(
            &project_dir,
            &project_dir.join(autoforge_config::STATE_DIR),
            git.clone(),
        )?);
        Ok(Self {
            spec,
            project_dir,
            config,
            runner,
            git,
            status,
            evolution,
            pause: Arc::new(AtomicBool::new(false)),
            cancel,
        })
    }

    /// Share an externally owned pause flag (the signal handler's).
    pub fn with_pause_flag(mut self, pause: Arc<AtomicBool>) -> Self {
        self.pause = pause;
        self
    }

    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        self.pause.clone()
    }

    /// Run iterations until the build reaches a terminal state.
    pub async fn run(&self) -> BuildOutcome {
        let mut session_number: u32 = 0;
        let mut planning_failures: u32 = 0;
        let mut planning_retry_context: Option<String> = None;

        let outcome = loop {
            // Checked between sessions only: a pause request lets the
            // in-flight session finish; the cancel token does not.
            if self.spec.is_paused()
                || self.pause.load(Ordering::SeqCst)
                || self.cancel.is_cancelled()
            {
                info!(spec = %self.spec.id, "build paused");
                break BuildOutcome::Paused;
            }
            if let Some(max) = self.config.orchestrator.max_iterations {
                if session_number >= max {
                    info!(max, "reached max iterations");
                    break self.settle_outcome();
                }
            }
            session_number += 1;

            let planning = !ImplementationPlan::exists(&self.spec.spec_dir)
                || plan::load_validated(&self.spec.spec_dir).is_err();

            let step = if planning {
                self.run_planning_session(session_number, planning_retry_context.take())
                    .await
            } else {
                self.run_coding_session(session_number).await
            };

            match step {
                IterationStep::Continue => {}
                IterationStep::PlanInvalid(errors) => {
                    planning_failures += 1;
                    if planning_failures >= self.config.orchestrator.max_planning_retries {
                        break BuildOutcome::Error(format!(
                            "plan failed validation after {planning_failures} attempts: {}",
                            errors.join("; ")
                        ));
                    }
                    planning_retry_context = Some(errors.join("\n"));
                }
                IterationStep::SessionError(e) if e.is_retryable() => {
                    // Jitter keeps parallel spec loops from retrying in
                    // lockstep against the same backend.
                    use rand::Rng;
                    let jitter_ms = rand::rng().random_range(0u64..500);
                    warn!(error = %e, "session failed, retrying after delay");
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
                IterationStep::SessionError(e) => {
                    break BuildOutcome::Error(e.to_string());
                }
                IterationStep::Done => break self.settle_outcome(),
            }

            tokio::time::sleep(Duration::from_secs(
                self.config.orchestrator.iteration_delay_secs,
            ))
            .await;
        };

        self.publish_terminal_status(&outcome, session_number).await;
        outcome
    }

    async fn run_planning_session(
        &self,
        session_number: u32,
        retry_context: Option<String>,
    ) -> IterationStep {
        let spec_content = match self.spec.read_spec() {
            Ok(content) => content,
            Err(e) => return IterationStep::SessionError(wrap_io(e)),
        };
        self.spec.log_progress("planning session started");
        self.publish_status(BuildState::Planning, session_number, None);

        let prompt = prompts::build_planner_prompt(&spec_content, retry_context.as_deref());
        let options = self.session_options(AgentRole::Planner, "planning");

        let started = Utc::now();
        let result = self
            .runner
            .run(&options, &prompt, self.cancel.child_token())
            .await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return IterationStep::SessionError(e),
        };

        let validated = plan::load_validated(&self.spec.spec_dir);
        let insight = SessionInsight {
            session_number,
            subtask_id: None,
            outcome: if validated.is_ok() {
                "plan_created".to_string()
            } else {
                "plan_invalid".to_string()
            },
            commits_added: 0,
            duration_secs: (Utc::now() - started).num_seconds().max(0) as u64,
            cost_usd: outcome.total_cost_usd,
        };
        let _ = self.spec.record_session_insight(&insight);

        match validated {
            Ok(plan) => {
                info!(
                    phases = plan.phases.len(),
                    subtasks = plan.counts().total,
                    "implementation plan validated"
                );
                self.spec.log_progress("implementation plan created");
                let _ = self.spec.sync_to_source();
                IterationStep::Continue
            }
            Err(errors) => {
                warn!(errors = errors.len(), "plan failed validation");
                IterationStep::PlanInvalid(errors)
            }
        }
    }

    async fn run_coding_session(&self, session_number: u32) -> IterationStep {
        let mut plan = match plan::load_validated(&self.spec.spec_dir) {
            Ok(plan) => plan,
            Err(errors) => return IterationStep::PlanInvalid(errors),
        };
        let mut history = AttemptHistory::load(&self.spec.spec_dir).unwrap_or_default();

        // First pending subtask not already stuck. In-progress counts as
        // pending so an interrupted or failed session is retried on the
        // next iteration.
        let next = plan
            .phases
            .iter()
            .flat_map(|p| p.subtasks.iter().map(move |s| (p, s)))
            .find(|(_, s)| {
                matches!(s.status, SubtaskStatus::Pending | SubtaskStatus::InProgress)
                    && !history.is_stuck(&s.id)
            });
        let Some((phase, subtask)) = next else {
            return IterationStep::Done;
        };
        let phase = phase.clone();
        let subtask = subtask.clone();

        let attempt = history.attempt_count(&subtask.id) + 1;
        info!(subtask = %subtask.id, attempt, "starting coding session");
        self.spec.log_progress(&format!(
            "coding session for {} (attempt {attempt})",
            subtask.id
        ));
        self.publish_status(
            BuildState::Building,
            session_number,
            Some((&plan, &phase, &subtask.id)),
        );

        if plan.set_status(&subtask.id, SubtaskStatus::InProgress).is_ok() {
            let _ = plan.save(&self.spec.spec_dir);
        }

        let spec_content = match self.spec.read_spec() {
            Ok(content) => content,
            Err(e) => return IterationStep::SessionError(wrap_io(e)),
        };
        let hints = history.attempt_hints(&subtask.id);
        let memory_hints = self.spec.memory_hints();
        let human_input = self.spec.consume_human_input();
        let prompt = prompts::build_coder_prompt(
            &spec_content,
            &phase,
            &subtask,
            attempt,
            &hints,
            memory_hints.as_deref(),
            human_input.as_deref(),
        );

        let commit_count_before = match self.git.commit_count(&self.project_dir).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "cannot read commit count");
                return IterationStep::SessionError(AgentError::SessionFailed {
                    subtype: "git_unavailable".to_string(),
                });
            }
        };
        let commit_before = self.git.head_sha(&self.project_dir).await.ok();

        // Snapshot the pre-session state of tracked files so the merge
        // engine can reconcile this task against overlapping ones.
        {
            let mut evolution = self.evolution.lock().await;
            if let Err(e) = evolution
                .capture_baselines(&subtask.id, None, &subtask.description)
                .await
            {
                warn!(error = %e, "baseline capture failed");
            }
        }

        let options = self.session_options(AgentRole::Coder, "coding");
        let started = Utc::now();
        let result = self
            .runner
            .run(&options, &prompt, self.cancel.child_token())
            .await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return IterationStep::SessionError(e),
        };

        let commit_count_after = self
            .git
            .commit_count(&self.project_dir)
            .await
            .unwrap_or(commit_count_before);
        let commits_added = commit_count_after.saturating_sub(commit_count_before);

        let mut plan = match plan::load_validated(&self.spec.spec_dir) {
            Ok(plan) => plan,
            Err(errors) => return IterationStep::PlanInvalid(errors),
        };

        if commits_added > 0 {
            info!(subtask = %subtask.id, commits_added, "subtask completed");
            let _ = plan.set_status(&subtask.id, SubtaskStatus::Completed);
            history.record_success(&subtask.id, session_number);
            self.spec
                .log_progress(&format!("subtask {} completed", subtask.id));

            // Record what the session actually changed, keyed against the
            // pre-session commit.
            if let Some(base) = &commit_before {
                let mut evolution = self.evolution.lock().await;
                if let Err(e) = evolution
                    .refresh_from_git(&subtask.id, &self.project_dir, base)
                    .await
                {
                    warn!(error = %e, "could not record task modifications");
                }
                let _ = evolution.mark_task_completed(&subtask.id);
            }
        } else {
            let attempts = history.record_failure(
                &subtask.id,
                session_number,
                session_failure_summary(&outcome),
            );
            warn!(subtask = %subtask.id, attempts, "session ended without a commit");
            if attempts >= self.config.orchestrator.max_attempts {
                history.mark_stuck(&subtask.id, attempts);
                let _ = plan.set_status(&subtask.id, SubtaskStatus::Stuck);
                self.spec
                    .log_progress(&format!("subtask {} marked stuck", subtask.id));
            }
        }

        let _ = plan.save(&self.spec.spec_dir);
        let _ = history.save(&self.spec.spec_dir);
        let insight = SessionInsight {
            session_number,
            subtask_id: Some(subtask.id.clone()),
            outcome: if commits_added > 0 {
                "completed".to_string()
            } else {
                "no_commit".to_string()
            },
            commits_added,
            duration_secs: (Utc::now() - started).num_seconds().max(0) as u64,
            cost_usd: outcome.total_cost_usd,
        };
        let _ = self.spec.record_session_insight(&insight);
        let _ = self.spec.sync_to_source();

        IterationStep::Continue
    }

    fn session_options(&self, role: AgentRole, phase: &str) -> SessionOptions {
        // task_metadata.json overrides beat config-level phase defaults.
        let metadata = self.spec.task_metadata().unwrap_or_default();
        let model = metadata
            .phase_models
            .get(phase)
            .cloned()
            .unwrap_or_else(|| self.config.agent.model_for_phase(phase).to_string());
        let thinking_budget = metadata
            .phase_thinking_budgets
            .get(phase)
            .copied()
            .or_else(|| self.config.agent.thinking_budget_for_phase(phase));

        let mut options = SessionOptions::new(model, role, self.project_dir.clone());
        options.thinking_budget = thinking_budget;
        options
    }

    /// Complete when nothing is pending and nothing is stuck; Stuck when
    /// any subtask exhausted its budget; Paused when the iteration cap
    /// stopped the loop with work remaining.
    fn settle_outcome(&self) -> BuildOutcome {
        let history = AttemptHistory::load(&self.spec.spec_dir).unwrap_or_default();
        if !history.stuck_subtasks.is_empty() {
            return BuildOutcome::Stuck;
        }
        if let Ok(plan) = plan::load_validated(&self.spec.spec_dir) {
            if !plan.is_complete() {
                return BuildOutcome::Paused;
            }
        }
        BuildOutcome::Complete
    }

    fn publish_status(
        &self,
        state: BuildState,
        session_number: u32,
        position: Option<(&ImplementationPlan, &crate::plan::Phase, &str)>,
    ) {
        let mut snapshot = StatusSnapshot::idle(&self.spec.id);
        snapshot.active = true;
        snapshot.state = state;
        snapshot.workers = WorkerStatus { active: 1, max: 1 };
        snapshot.session = Some(SessionStatus {
            number: session_number,
            started_at: Utc::now(),
        });
        if let Some((plan, phase, subtask_id)) = position {
            let counts = plan.counts();
            snapshot.subtasks = SubtaskCounts {
                completed: counts.completed,
                total: counts.total,
                in_progress: counts.in_progress,
                failed: counts.failed,
            };
            if let Some((index, _)) = plan.phase_position(subtask_id) {
                snapshot.phase = PhaseStatus {
                    current: phase.name.clone(),
                    id: index,
                    total: plan.phases.len(),
                };
            }
        }
        self.status.update(snapshot);
    }

    async fn publish_terminal_status(&self, outcome: &BuildOutcome, session_number: u32) {
        let mut snapshot = StatusSnapshot::idle(&self.spec.id);
        snapshot.state = match outcome {
            BuildOutcome::Complete => BuildState::Complete,
            BuildOutcome::Stuck => BuildState::Error,
            BuildOutcome::Paused => BuildState::Paused,
            BuildOutcome::Error(_) => BuildState::Error,
        };
        if let Ok(plan) = plan::load_validated(&self.spec.spec_dir) {
            let counts = plan.counts();
            snapshot.subtasks = SubtaskCounts {
                completed: counts.completed,
                total: counts.total,
                in_progress: counts.in_progress,
                failed: counts.failed,
            };
        }
        snapshot.session = Some(SessionStatus {
            number: session_number,
            started_at: Utc::now(),
        });
        self.status.update(snapshot);
        self.status.flush().await;
    }
}

enum IterationStep {
    Continue,
    Done,
    PlanInvalid(Vec<String>),
    SessionError(AgentError),
}

fn wrap_io(e: anyhow::Error) -> AgentError {
    AgentError::SessionFailed {
        subtype: format!("io: {e}"),
    }
}

fn session_failure_summary(outcome: &SessionOutcome) -> Option<String> {
    if outcome.final_text.is_empty() {
        return None;
    }
    let tail: String = outcome
        .final_text
        .chars()
        .rev()
        .take(300)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Some(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::PAUSE_FILE;
    use autoforge_agent::ResultSubtype;
    use std::process::Command;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn init_repo(dir: &std::path::Path) {
        let run = |args: &[&str]| {
            let out = Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed: {out:?}");
        };
        run(&["init", "-q", "-b", "main"]);
        std::fs::write(dir.join("README.md"), "demo\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
    }

    fn success_outcome() -> SessionOutcome {
        SessionOutcome {
            subtype: Some(ResultSubtype::Success),
            is_error: false,
            num_turns: 1,
            duration_ms: 10,
            total_cost_usd: 0.0,
            final_text: "done".to_string(),
            structured_output: None,
        }
    }

    /// Stub agent: writes a plan during planning sessions and commits one
    /// file per coding session.
    struct ScriptedAgent {
        spec_dir: PathBuf,
        project_dir: PathBuf,
        commits: bool,
        sessions: AtomicU32,
    }

    #[async_trait]
    impl SessionRunner for ScriptedAgent {
        async fn run(
            &self,
            options: &SessionOptions,
            _prompt: &str,
            _cancel: CancellationToken,
        ) -> Result<SessionOutcome, AgentError> {
            let n = self.sessions.fetch_add(1, Ordering::SeqCst);
            match options.role {
                AgentRole::Planner => {
                    std::fs::write(
                        self.spec_dir.join("implementation_plan.json"),
                        serde_json::json!({
                            "feature": "demo feature",
                            "workflow_type": "feature",
                            "phases": [{"id": "phase-1", "name": "Build", "subtasks": [
                                {"id": "1.1", "description": "write file", "status": "pending"}
                            ]}]
                        })
                        .to_string(),
                    )
                    .unwrap();
                }
                AgentRole::Coder if self.commits => {
                    let file = self.project_dir.join(format!("work_{n}.txt"));
                    std::fs::write(&file, "content\n").unwrap();
                    for args in [
                        vec!["add", "."],
                        vec!["commit", "-q", "-m", "implement subtask"],
                    ] {
                        let out = Command::new("git")
                            .args(&args)
                            .current_dir(&self.project_dir)
                            .env("GIT_AUTHOR_NAME", "test")
                            .env("GIT_AUTHOR_EMAIL", "test@example.com")
                            .env("GIT_COMMITTER_NAME", "test")
                            .env("GIT_COMMITTER_EMAIL", "test@example.com")
                            .output()
                            .unwrap();
                        assert!(out.status.success());
                    }
                }
                _ => {}
            }
            Ok(success_outcome())
        }
    }

    fn orchestrator(
        spec_dir: &std::path::Path,
        project_dir: &std::path::Path,
        commits: bool,
    ) -> SessionOrchestrator {
        let mut config = Config::default();
        config.orchestrator.iteration_delay_secs = 0;
        config.orchestrator.max_iterations = Some(10);
        let runner = Arc::new(ScriptedAgent {
            spec_dir: spec_dir.to_path_buf(),
            project_dir: project_dir.to_path_buf(),
            commits,
            sessions: AtomicU32::new(0),
        });
        SessionOrchestrator::new(
            Spec::new("demo", spec_dir),
            project_dir.to_path_buf(),
            config,
            runner,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn plan_then_subtask_happy_path() {
        let project = tempfile::tempdir().unwrap();
        let spec_dir = tempfile::tempdir().unwrap();
        init_repo(project.path());
        std::fs::write(spec_dir.path().join("spec.md"), "Build a demo feature.").unwrap();

        let git = GitAdapter::new(Default::default());
        let commits_before = git.commit_count(project.path()).await.unwrap();

        let outcome = orchestrator(spec_dir.path(), project.path(), true)
            .run()
            .await;
        assert_eq!(outcome, BuildOutcome::Complete);

        let plan = plan::load_validated(spec_dir.path()).unwrap();
        assert!(!plan.phases.is_empty());
        assert!(plan.counts().total >= 1);
        assert_eq!(plan.counts().completed, plan.counts().total);

        let commits_after = git.commit_count(project.path()).await.unwrap();
        assert_eq!(commits_after, commits_before + 1);
    }

    #[tokio::test]
    async fn stuck_after_three_attempts_without_commit() {
        let project = tempfile::tempdir().unwrap();
        let spec_dir = tempfile::tempdir().unwrap();
        init_repo(project.path());
        std::fs::write(spec_dir.path().join("spec.md"), "Build a demo feature.").unwrap();

        let outcome = orchestrator(spec_dir.path(), project.path(), false)
            .run()
            .await;
        assert_eq!(outcome, BuildOutcome::Stuck);

        let history = AttemptHistory::load(spec_dir.path()).unwrap();
        assert!(history.is_stuck("1.1"));
        assert_eq!(history.attempt_count("1.1"), 3);
        assert!(history.stuck_subtasks[0].reason.contains("3 attempts"));

        let plan = plan::load_validated(spec_dir.path()).unwrap();
        let subtask_status = plan.phases[0].subtasks[0].status;
        assert_eq!(subtask_status, SubtaskStatus::Stuck);
    }

    #[tokio::test]
    async fn pause_flag_stops_before_the_next_session() {
        let project = tempfile::tempdir().unwrap();
        let spec_dir = tempfile::tempdir().unwrap();
        init_repo(project.path());
        std::fs::write(spec_dir.path().join("spec.md"), "Build a demo feature.").unwrap();

        // Stub that requests a pause from inside the planning session,
        // the way the signal handler would mid-run.
        struct PausingAgent {
            inner: ScriptedAgent,
            pause: Arc<AtomicBool>,
        }

        #[async_trait]
        impl SessionRunner for PausingAgent {
            async fn run(
                &self,
                options: &SessionOptions,
                prompt: &str,
                cancel: CancellationToken,
            ) -> Result<SessionOutcome, AgentError> {
                let outcome = self.inner.run(options, prompt, cancel).await;
                self.pause.store(true, Ordering::SeqCst);
                outcome
            }
        }

        let pause = Arc::new(AtomicBool::new(false));
        let mut config = Config::default();
        config.orchestrator.iteration_delay_secs = 0;
        let runner = Arc::new(PausingAgent {
            inner: ScriptedAgent {
                spec_dir: spec_dir.path().to_path_buf(),
                project_dir: project.path().to_path_buf(),
                commits: true,
                sessions: AtomicU32::new(0),
            },
            pause: pause.clone(),
        });
        let orchestrator = SessionOrchestrator::new(
            Spec::new("demo", spec_dir.path()),
            project.path().to_path_buf(),
            config,
            runner,
            CancellationToken::new(),
        )
        .unwrap()
        .with_pause_flag(pause);

        let outcome = orchestrator.run().await;
        // The planning session completed (plan exists) but no coding
        // session started afterwards.
        assert_eq!(outcome, BuildOutcome::Paused);
        assert!(ImplementationPlan::exists(spec_dir.path()));
        let plan = plan::load_validated(spec_dir.path()).unwrap();
        assert_eq!(plan.counts().completed, 0);
    }

    #[tokio::test]
    async fn pause_file_stops_the_loop() {
        let project = tempfile::tempdir().unwrap();
        let spec_dir = tempfile::tempdir().unwrap();
        init_repo(project.path());
        std::fs::write(spec_dir.path().join("spec.md"), "spec").unwrap();
        std::fs::write(spec_dir.path().join(PAUSE_FILE), "").unwrap();

        let outcome = orchestrator(spec_dir.path(), project.path(), true)
            .run()
            .await;
        assert_eq!(outcome, BuildOutcome::Paused);
        assert!(!ImplementationPlan::exists(spec_dir.path()));
    }
}
