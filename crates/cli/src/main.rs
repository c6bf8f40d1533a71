use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use autoforge_agent::AgentClient;
use autoforge_config::{Config, STATE_DIR};
use autoforge_core::evolution::FileEvolutionStore;
use autoforge_core::merge::MergeEngine;
use autoforge_core::orchestrator::{BuildOutcome, SessionOrchestrator};
use autoforge_core::specs::Spec;
use autoforge_core::worktree::WorktreeManager;
use autoforge_core::GitAdapter;
use autoforge_github::GitHubOrchestrator;

#[derive(Parser)]
#[command(name = "autoforge", about = "Autonomous software engineering orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project repository root (defaults to the current directory)
    #[arg(short = 'C', long)]
    project: Option<PathBuf>,

    /// Model override for agent sessions
    #[arg(short, long)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build loop for a spec directory
    Run {
        /// Directory containing spec.md
        spec_dir: PathBuf,
        /// Stop after this many sessions
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Review a pull request
    Review {
        pr_number: u64,
        /// Repository in owner/name form
        #[arg(short, long)]
        repo: String,
        /// Re-review even if this head commit was already reviewed
        #[arg(long)]
        force: bool,
    },
    /// Follow-up review against the previous review of a pull request
    Followup {
        pr_number: u64,
        #[arg(short, long)]
        repo: String,
    },
    /// Triage open issues (or a single issue)
    Triage {
        #[arg(short, long)]
        repo: String,
        /// Triage only this issue
        #[arg(long)]
        issue: Option<u64>,
        /// Max issues to triage in one run
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Automatically fix an issue: spec, build, QA
    Autofix {
        issue_number: u64,
        #[arg(short, long)]
        repo: String,
    },
    /// Run a QA review session over a completed build, or a fix session
    /// when QA_FIX_REQUEST.md is present
    Qa {
        /// Directory containing spec.md
        spec_dir: PathBuf,
    },
    /// Merge recorded task changes back onto their baselines
    Merge {
        /// Task ids whose snapshots should be combined
        task_ids: Vec<String>,
        /// Write merged content to the working tree instead of just
        /// reporting per-file strategies
        #[arg(long)]
        apply: bool,
    },
    /// List or clean managed worktrees
    Worktrees {
        /// Remove stale and excess worktrees
        #[arg(long)]
        clean: bool,
    },
    /// Print the current build status snapshot for a spec
    Status { spec_dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("autoforge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project_dir = match &cli.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut config = Config::load(Some(&project_dir))?;
    if let Some(model) = &cli.model {
        config.agent.model = model.clone();
    }

    let cancel = CancellationToken::new();
    let pause = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(pause.clone(), cancel.clone());

    match cli.command {
        Commands::Run {
            spec_dir,
            max_iterations,
        } => {
            if let Some(max) = max_iterations {
                config.orchestrator.max_iterations = Some(max);
            }
            let spec_dir = spec_dir
                .canonicalize()
                .with_context(|| format!("spec dir not found: {}", spec_dir.display()))?;
            let id = spec_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "spec".to_string());

            let runner = Arc::new(AgentClient::new(config.agent.clone()));
            let orchestrator = SessionOrchestrator::new(
                Spec::new(id, &spec_dir),
                project_dir,
                config,
                runner,
                cancel,
            )?
            .with_pause_flag(pause);
            let outcome = orchestrator.run().await;
            report_outcome(&outcome);
            if let BuildOutcome::Error(e) = outcome {
                anyhow::bail!(e);
            }
        }
        Commands::Review {
            pr_number,
            repo,
            force,
        } => {
            let orchestrator = github_orchestrator(&repo, &project_dir, config)?;
            let result = orchestrator.review_pr(pr_number, force, cancel).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                anyhow::bail!("review failed: {}", result.error.unwrap_or_default());
            }
        }
        Commands::Followup { pr_number, repo } => {
            let orchestrator = github_orchestrator(&repo, &project_dir, config)?;
            let result = orchestrator.followup_review_pr(pr_number, cancel).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                anyhow::bail!("follow-up failed: {}", result.error.unwrap_or_default());
            }
        }
        Commands::Triage { repo, issue, limit } => {
            let orchestrator = github_orchestrator(&repo, &project_dir, config)?;
            match issue {
                Some(number) => {
                    let result = orchestrator.triage_issue(number, cancel).await?;
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                None => {
                    let results = orchestrator.triage_open_issues(limit, cancel).await;
                    info!(count = results.len(), "issues triaged");
                    println!("{}", serde_json::to_string_pretty(&results)?);
                }
            }
        }
        Commands::Autofix { issue_number, repo } => {
            let orchestrator = github_orchestrator(&repo, &project_dir, config)?;
            let specs_root = project_dir.join(STATE_DIR).join("specs");
            let status = orchestrator
                .autofix_issue(issue_number, &specs_root, cancel)
                .await?;
            println!("auto-fix for issue #{issue_number}: {status:?}");
        }
        Commands::Qa { spec_dir } => {
            let spec_dir = spec_dir
                .canonicalize()
                .with_context(|| format!("spec dir not found: {}", spec_dir.display()))?;
            let spec_content = std::fs::read_to_string(spec_dir.join("spec.md"))
                .with_context(|| "spec.md not found")?;

            // A pending fix request takes precedence over a fresh review.
            let fix_request = std::fs::read_to_string(spec_dir.join("QA_FIX_REQUEST.md")).ok();
            let (role, prompt) = match &fix_request {
                Some(request) => (
                    autoforge_agent::AgentRole::QaFixer,
                    autoforge_core::prompts::build_qa_fixer_prompt(request),
                ),
                None => (
                    autoforge_agent::AgentRole::QaReviewer,
                    autoforge_core::prompts::build_qa_prompt(&spec_content),
                ),
            };

            let client = AgentClient::new(config.agent.clone());
            let mut options = autoforge_agent::SessionOptions::new(
                config.agent.model_for_phase("qa").to_string(),
                role,
                project_dir.clone(),
            );
            options.thinking_budget = config.agent.thinking_budget_for_phase("qa");
            let outcome = client.run_to_completion(&options, &prompt, cancel).await?;

            if fix_request.is_some() && outcome.succeeded() {
                let consumed = spec_dir.join("QA_FIX_REQUEST.consumed.md");
                let _ = std::fs::rename(spec_dir.join("QA_FIX_REQUEST.md"), consumed);
            }
            // The agent runs from the project root; pick up the report
            // from either location.
            let report = [spec_dir.join("qa_report.md"), project_dir.join("qa_report.md")]
                .into_iter()
                .find(|p| p.exists());
            match report {
                Some(path) => println!("{}", std::fs::read_to_string(path)?),
                None => println!("{}", outcome.final_text),
            }
        }
        Commands::Merge { task_ids, apply } => {
            if task_ids.is_empty() {
                anyhow::bail!("at least one task id is required");
            }
            let git = GitAdapter::new(config.git.clone());
            let store = FileEvolutionStore::open(
                &project_dir,
                &project_dir.join(STATE_DIR),
                git,
            )?;
            let engine = MergeEngine::new();
            let report = engine.merge_tasks(&store, &task_ids).await;

            for (path, result) in &report.file_results {
                println!("{path}: {:?}", result.strategy);
                for skipped in &result.skipped_changes {
                    println!("  skipped change from {} (anchor not found)", skipped.task_id);
                }
                if result.needs_manual_review {
                    println!("  needs manual review ({})", result.conflicting_tasks.join(", "));
                }
                if apply {
                    if let Some(content) = &result.content {
                        std::fs::write(project_dir.join(path), content)
                            .with_context(|| format!("failed to write {path}"))?;
                    }
                }
            }
            println!(
                "{} file(s): {} auto-merged, {} need review",
                report.stats.files_processed,
                report.stats.files_auto_merged,
                report.stats.files_need_review
            );
        }
        Commands::Worktrees { clean } => {
            let git = GitAdapter::new(config.git.clone());
            let manager = WorktreeManager::new(
                git,
                &project_dir,
                &project_dir.join(STATE_DIR),
                config.worktrees.clone(),
            );
            if clean {
                let stats = manager.cleanup().await;
                println!(
                    "removed {} worktree(s) ({} orphaned, {} expired, {} excess)",
                    stats.total(),
                    stats.orphaned,
                    stats.expired,
                    stats.excess
                );
            }
            for worktree in manager.on_disk() {
                println!(
                    "{}  ({:.1} days old)",
                    worktree.path.display(),
                    worktree.age_days
                );
            }
        }
        Commands::Status { spec_dir } => {
            let path = spec_dir.join(autoforge_core::status::STATUS_FILE);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("no status at {}", path.display()))?;
            println!("{content}");
        }
    }

    Ok(())
}

fn github_orchestrator(
    repo: &str,
    project_dir: &std::path::Path,
    config: Config,
) -> Result<GitHubOrchestrator> {
    let runner = Arc::new(AgentClient::new(config.agent.clone()));
    GitHubOrchestrator::new(
        repo,
        project_dir.to_path_buf(),
        project_dir.join(STATE_DIR),
        config,
        runner,
        None,
    )
}

/// First Ctrl-C requests a pause: the in-flight agent session finishes
/// and the loop stops before the next one. A second Ctrl-C within two
/// seconds fires the cancellation token, tearing the current session
/// down; one more after that exits the process.
fn spawn_signal_handler(pause: Arc<AtomicBool>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut last: Option<Instant> = None;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if cancel.is_cancelled() {
                eprintln!("exiting");
                std::process::exit(130);
            }
            match last {
                Some(previous) if previous.elapsed() < Duration::from_secs(2) => {
                    eprintln!("aborting the current session");
                    cancel.cancel();
                }
                _ => {
                    eprintln!("pausing after the current session (Ctrl-C again to abort)");
                    pause.store(true, Ordering::SeqCst);
                }
            }
            last = Some(Instant::now());
        }
    });
}

fn report_outcome(outcome: &BuildOutcome) {
    match outcome {
        BuildOutcome::Complete => println!("build complete"),
        BuildOutcome::Stuck => println!("build finished with stuck subtasks"),
        BuildOutcome::Paused => println!("build paused"),
        BuildOutcome::Error(e) => eprintln!("build error: {e}"),
    }
}
