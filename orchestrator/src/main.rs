//! Multi-phase delivery pipeline CLI.
//!
//! Runs a goal through the pipeline phases inside a project directory, resumes an
//! interrupted run from its newest checkpoint and manages `.checkpoints/`.
//!
//! Ctrl-C cancels the run through its [`CancelToken`]: running children are killed, a
//! checkpoint is written and the process exits with [`exit_codes::PAUSED`]. A second
//! Ctrl-C exits at once; `resume` then recovers the interrupted phase.

use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use orchestrator::core::cancel::CancelToken;
use orchestrator::core::types::{AutonomyMode, Phase, PhaseResult};
use orchestrator::exit_codes;
use orchestrator::io::checkpoint::{CheckpointManager, get_checkpoint_age_days};
use orchestrator::io::config::load_config;
use orchestrator::io::layout::ProjectPaths;
use orchestrator::io::model::CommandModelTool;
use orchestrator::io::test_runner::CommandTestRunner;
use orchestrator::io::tracker::BeadsTracker;
use orchestrator::logging;
use orchestrator::phases::StandardPhases;
use orchestrator::pipeline::{
    Decider, FailureDecision, PauseDecision, Pipeline, PipelineOutcome, PipelineRun,
};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Multi-phase delivery pipeline driven by an external model tool"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every phase from a fresh state.
    Run {
        project: PathBuf,
        #[arg(long, default_value = "checkpoint", value_parser = parse_mode)]
        mode: AutonomyMode,
        /// Goal text. Defaults to the goal saved by the previous run.
        #[arg(long, conflicts_with = "goal_file")]
        goal: Option<String>,
        /// Read the goal from a file.
        #[arg(long)]
        goal_file: Option<PathBuf>,
        /// Abort the run after this many minutes.
        #[arg(long)]
        deadline_mins: Option<u64>,
    },
    /// Continue from the newest checkpoint (or `--checkpoint`).
    Resume {
        project: PathBuf,
        #[arg(long, default_value = "checkpoint", value_parser = parse_mode)]
        mode: AutonomyMode,
        /// Phase to run next instead of the first pending one.
        #[arg(long, value_parser = parse_phase)]
        phase: Option<Phase>,
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Abort the run after this many minutes.
        #[arg(long)]
        deadline_mins: Option<u64>,
    },
    /// Inspect or remove checkpoints.
    Checkpoints {
        project: PathBuf,
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print checkpoints newest first.
    List,
    /// Delete checkpoints older than `--days`, or all of them.
    Clean {
        #[arg(long, conflicts_with = "all")]
        days: Option<u32>,
        #[arg(long)]
        all: bool,
    },
}

fn parse_mode(raw: &str) -> Result<AutonomyMode, String> {
    raw.parse()
}

fn parse_phase(raw: &str) -> Result<Phase, String> {
    raw.parse()
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            project,
            mode,
            goal,
            goal_file,
            deadline_mins,
        } => {
            let goal = match goal_file {
                Some(path) => Some(
                    fs::read_to_string(&path)
                        .with_context(|| format!("read goal {}", path.display()))?,
                ),
                None => goal,
            };
            cmd_run(&project, mode, goal, cancel_token(deadline_mins), None)
        }
        Command::Resume {
            project,
            mode,
            phase,
            checkpoint,
            deadline_mins,
        } => cmd_run(
            &project,
            mode,
            None,
            cancel_token(deadline_mins),
            Some((checkpoint, phase)),
        ),
        Command::Checkpoints { project, action } => cmd_checkpoints(&project, action),
    }
}

/// `resume` is `Some((checkpoint, phase))`.
fn cmd_run(
    project: &Path,
    mode: AutonomyMode,
    goal: Option<String>,
    cancel: CancelToken,
    resume: Option<(Option<PathBuf>, Option<Phase>)>,
) -> Result<i32> {
    let root = project_root(project)?;
    let paths = ProjectPaths::new(&root);
    let config = load_config(&paths.config_path)?;
    install_interrupt_handler(cancel.clone())?;

    let model = CommandModelTool::from_config(&config.model);
    let tracker = BeadsTracker::from_config(&config.tracker, &root).with_cancel(cancel.clone());
    let tests = CommandTestRunner::from_config(&config.tests);
    let phases = StandardPhases::new(&model, &tracker, &tests);
    let decider = StdinDecider;

    let mut pipeline = Pipeline::new(&root, config, mode, &phases, &decider)?.with_cancel(cancel);
    if let Some(goal) = goal {
        pipeline = pipeline.with_goal(goal);
    }
    let outcome = match resume {
        None => pipeline.run()?,
        Some((checkpoint, phase)) => pipeline.resume_from_checkpoint(checkpoint.as_deref(), phase)?,
    };
    print_summary(&outcome);
    Ok(exit_code(&outcome))
}

fn cmd_checkpoints(project: &Path, action: CheckpointAction) -> Result<i32> {
    let root = project_root(project)?;
    let manager = CheckpointManager::new(&root)?;
    match action {
        CheckpointAction::List => {
            for located in manager.list()? {
                let cp = &located.checkpoint;
                println!(
                    "{}\t{}\t{}\t{}d\t{}",
                    cp.id,
                    cp.timestamp,
                    cp.phase,
                    get_checkpoint_age_days(cp),
                    located.file_path.display()
                );
            }
        }
        CheckpointAction::Clean { days, all } => {
            let report = match (days, all) {
                (_, true) => manager.cleanup_all()?,
                (Some(days), false) => manager.cleanup_by_age(days)?,
                (None, false) => bail!("pass --days N or --all"),
            };
            println!("deleted {}, failed {}", report.deleted, report.failed);
        }
    }
    Ok(exit_codes::OK)
}

fn cancel_token(deadline_mins: Option<u64>) -> CancelToken {
    match deadline_mins {
        Some(mins) => CancelToken::with_deadline(Instant::now() + Duration::from_secs(mins.saturating_mul(60))),
        None => CancelToken::new(),
    }
}

/// First Ctrl-C cancels `cancel`; the second exits the process.
fn install_interrupt_handler(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    std::thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                eprintln!("interrupted; stopping the run (Ctrl-C again to exit now)");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(exit_codes::INTERRUPTED);
                }
            });
        })
        .context("spawn interrupt handler")?;
    Ok(())
}

fn project_root(project: &Path) -> Result<PathBuf> {
    if !project.is_dir() {
        bail!("project directory {} does not exist", project.display());
    }
    std::path::absolute(project).with_context(|| format!("resolve {}", project.display()))
}

fn print_summary(run: &PipelineRun) {
    for (phase, status) in run.state.statuses() {
        println!("{phase}: {status}");
    }
    if let Some(result) = &run.implementation {
        println!(
            "implementation: {} iterations, {} issues closed",
            result.iterations,
            result.phases_closed.len()
        );
    }
    match run.outcome {
        PipelineOutcome::Finished => {}
        PipelineOutcome::Paused { next_phase } => {
            println!("paused; `orchestrator resume` continues with {next_phase}");
        }
        PipelineOutcome::Cancelled { next_phase } => {
            println!("cancelled before {next_phase}");
        }
    }
    for error in &run.checkpoint_errors {
        eprintln!("checkpoint not written: {error}");
    }
}

fn exit_code(run: &PipelineRun) -> i32 {
    match run.outcome {
        PipelineOutcome::Paused { .. } | PipelineOutcome::Cancelled { .. } => exit_codes::PAUSED,
        PipelineOutcome::Finished if !run.failed_phases().is_empty() => exit_codes::FAILED_PHASES,
        PipelineOutcome::Finished => exit_codes::OK,
    }
}

/// Operator prompts on stderr, answers on stdin. End of input means "continue".
struct StdinDecider;

impl StdinDecider {
    fn ask(&self, question: &str) -> Option<String> {
        eprint!("{question} ");
        std::io::stderr().flush().ok()?;
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_ascii_lowercase()),
        }
    }
}

impl Decider for StdinDecider {
    fn on_failure(&self, phase: Phase, result: &PhaseResult, attempt: u32) -> FailureDecision {
        eprintln!(
            "{phase} failed (attempt {attempt}): {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
        match self.ask("[r]etry or [c]ontinue past?").as_deref() {
            Some("r" | "retry") => FailureDecision::Retry,
            _ => FailureDecision::ContinuePast,
        }
    }

    fn on_pause(&self, completed: Phase) -> PauseDecision {
        match self
            .ask(&format!("{completed} done. [Enter] to continue, [s]top?"))
            .as_deref()
        {
            Some("s" | "stop") => PauseDecision::Stop,
            _ => PauseDecision::Proceed,
        }
    }
}
