//! Pipeline state machine.
//!
//! Drives the six phases in order against a [`PhaseExecutor`], writing a checkpoint
//! after every transition. Operator decisions (retry a failed phase, stop at a pause
//! point) go through a [`Decider`], so headless and scripted runs need no terminal.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::state::PipelineState;
use crate::core::types::{AutonomyMode, ImplementationResult, Phase, PhaseResult, PhaseStatus};
use crate::cwa::ContextStore;
use crate::io::checkpoint::{CheckpointManager, checkpoint_label};
use crate::io::config::PipelineConfig;
use crate::io::iteration_log::IterationMeta;
use crate::io::layout::ProjectPaths;
use crate::phases::{PhaseContext, PhaseExecutor, PhaseReport, restore_artifacts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Run the same phase again.
    Retry,
    /// Leave the phase failed and move on.
    ContinuePast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDecision {
    Proceed,
    Stop,
}

/// Pluggable operator.
pub trait Decider {
    /// Called after failed attempt number `attempt` (1-based) of `phase`.
    fn on_failure(&self, phase: Phase, result: &PhaseResult, attempt: u32) -> FailureDecision;
    /// Called at a pause point after `completed` while phases remain.
    fn on_pause(&self, completed: Phase) -> PauseDecision;
}

/// Decider for unattended runs: never retries, never stops.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDecider;

impl Decider for AutoDecider {
    fn on_failure(&self, _phase: Phase, _result: &PhaseResult, _attempt: u32) -> FailureDecision {
        FailureDecision::ContinuePast
    }

    fn on_pause(&self, _completed: Phase) -> PauseDecision {
        PauseDecision::Proceed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every phase reached a terminal status. Some may have failed.
    Finished,
    /// The operator stopped at a pause point; `next_phase` runs on resume.
    Paused { next_phase: Phase },
    /// Cancelled before `next_phase` started.
    Cancelled { next_phase: Phase },
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub state: PipelineState,
    pub outcome: PipelineOutcome,
    /// Checkpoint writes that failed; the run continued regardless.
    pub checkpoint_errors: Vec<String>,
    pub implementation: Option<ImplementationResult>,
}

impl PipelineRun {
    pub fn failed_phases(&self) -> Vec<Phase> {
        self.state.failed_phases()
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == PipelineOutcome::Finished && self.failed_phases().is_empty()
    }
}

pub struct Pipeline<'a, E: PhaseExecutor, D: Decider> {
    paths: ProjectPaths,
    config: PipelineConfig,
    mode: AutonomyMode,
    goal: Option<String>,
    executor: &'a E,
    decider: &'a D,
    checkpoints: CheckpointManager,
    cancel: CancelToken,
}

impl<'a, E: PhaseExecutor, D: Decider> Pipeline<'a, E, D> {
    pub fn new(
        project_root: &Path,
        config: PipelineConfig,
        mode: AutonomyMode,
        executor: &'a E,
        decider: &'a D,
    ) -> Result<Self> {
        let paths = ProjectPaths::new(project_root);
        let checkpoints = CheckpointManager::new(&paths.root)?;
        Ok(Self {
            paths,
            config,
            mode,
            goal: None,
            executor,
            decider,
            checkpoints,
            cancel: CancelToken::new(),
        })
    }

    /// Goal of the run. Without one, the goal saved by the previous run is used.
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run every phase from a fresh state.
    #[instrument(skip_all, fields(mode = %self.mode, root = %self.paths.root.display()))]
    pub fn run(&self) -> Result<PipelineRun> {
        let goal = self.resolve_goal()?;
        save_goal(&self.paths.goal_path, &goal)?;
        info!("pipeline started");
        let state = PipelineState::new();
        let store = ContextStore::with_limit(self.config.context.max_entries);
        self.drive(state, store, &goal, None)
    }

    /// Continue from `checkpoint`, or the newest checkpoint when `None`.
    ///
    /// A phase left in progress by a crash is marked failed and runs first; asking for a
    /// different `phase` then is an error. Otherwise `phase` (if given) or the first
    /// pending phase is next. Completed phases never run again.
    #[instrument(skip_all, fields(mode = %self.mode, root = %self.paths.root.display()))]
    pub fn resume_from_checkpoint(
        &self,
        checkpoint: Option<&Path>,
        phase: Option<Phase>,
    ) -> Result<PipelineRun> {
        let located = match checkpoint {
            Some(path) => self.checkpoints.load_checkpoint_file(path)?,
            None => self.checkpoints.detect_resumable_checkpoint()?.ok_or_else(|| {
                anyhow!(
                    "no resumable checkpoint in {}",
                    self.checkpoints.dir().display()
                )
            })?,
        };
        info!(
            checkpoint_id = %located.checkpoint.id,
            path = %located.file_path.display(),
            "resuming from checkpoint"
        );

        let mut state = located.checkpoint.state;
        let interrupted = state.mark_interrupted();
        if let Some(requested) = phase
            && state.status(requested) == PhaseStatus::Completed
        {
            return Err(anyhow!("phase {requested} already completed; it will not run again"));
        }
        if let (Some(interrupted), Some(requested)) = (interrupted, phase)
            && interrupted != requested
        {
            return Err(anyhow!(
                "phase {interrupted} was interrupted and must run before {requested}; resume without --phase"
            ));
        }
        let start = interrupted.or(phase);
        if let Some(interrupted) = interrupted {
            warn!(phase = %interrupted, "phase was interrupted; running it again");
        }

        let mut store =
            ContextStore::starting_after(state.max_entry_id(), self.config.context.max_entries);
        restore_artifacts(&mut state, &mut store, self.config.context.artifact_ttl());
        let goal = self.resolve_goal()?;
        self.drive(state, store, &goal, start)
    }

    fn resolve_goal(&self) -> Result<String> {
        if let Some(goal) = &self.goal {
            return Ok(goal.clone());
        }
        match fs::read_to_string(&self.paths.goal_path) {
            Ok(goal) => Ok(goal.trim().to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => {
                Err(err).with_context(|| format!("read {}", self.paths.goal_path.display()))
            }
        }
    }

    fn drive(
        &self,
        mut state: PipelineState,
        mut store: ContextStore,
        goal: &str,
        start: Option<Phase>,
    ) -> Result<PipelineRun> {
        let mut checkpoint_errors = Vec::new();
        let mut implementation = None;
        let mut next = start.or_else(|| state.get_next_phase());

        while let Some(phase) = next {
            if self.cancel.is_cancelled() {
                warn!(phase = %phase, "pipeline cancelled");
                self.checkpoint_phase(&mut state, phase, &mut checkpoint_errors);
                return Ok(PipelineRun {
                    state,
                    outcome: PipelineOutcome::Cancelled { next_phase: phase },
                    checkpoint_errors,
                    implementation,
                });
            }

            let mut attempt = 1;
            loop {
                state.start_phase(phase)?;
                self.checkpoint_phase(&mut state, phase, &mut checkpoint_errors);
                info!(phase = %phase, attempt, "phase started");

                let (report, iteration_checkpoints) =
                    self.execute(phase, &state, &mut store, goal)?;
                checkpoint_errors.extend(iteration_checkpoints.errors);
                if let Some(id) = iteration_checkpoints.last_id {
                    state.set_checkpoint_id(id);
                }
                for id in &report.entries {
                    state.track_entry(phase, *id);
                }
                if let Some(link) = report.beads {
                    state.set_beads_link(link);
                }
                if report.implementation.is_some() {
                    implementation = report.implementation;
                }

                let result = report.result;
                if result.success {
                    state.complete_phase(phase, result)?;
                    self.checkpoint_phase(&mut state, phase, &mut checkpoint_errors);
                    info!(phase = %phase, "phase completed");
                    break;
                }

                warn!(phase = %phase, attempt, error = result.error.as_deref().unwrap_or(""), "phase failed");
                state.fail_phase(phase, result.clone())?;
                self.checkpoint_phase(&mut state, phase, &mut checkpoint_errors);
                match self.failure_decision(phase, &result, attempt) {
                    FailureDecision::Retry => attempt += 1,
                    FailureDecision::ContinuePast => break,
                }
            }

            self.end_turn(&mut store);
            next = state.get_next_phase();
            if let Some(upcoming) = next
                && self.mode.pauses_after(phase)
                && self.decider.on_pause(phase) == PauseDecision::Stop
            {
                info!(completed = %phase, next_phase = %upcoming, "paused by operator");
                return Ok(PipelineRun {
                    state,
                    outcome: PipelineOutcome::Paused {
                        next_phase: upcoming,
                    },
                    checkpoint_errors,
                    implementation,
                });
            }
        }

        let failed = state.failed_phases();
        if failed.is_empty() && !self.config.pipeline.keep_checkpoints_on_success {
            match self.checkpoints.cleanup_all() {
                Ok(report) => debug!(deleted = report.deleted, failed = report.failed, "checkpoints removed"),
                Err(err) => warn!(error = %format!("{err:#}"), "checkpoint cleanup failed"),
            }
        }
        info!(failed = failed.len(), "pipeline finished");
        Ok(PipelineRun {
            state,
            outcome: PipelineOutcome::Finished,
            checkpoint_errors,
            implementation,
        })
    }

    /// Run one phase, checkpointing every `checkpoint_every` loop iterations.
    fn execute(
        &self,
        phase: Phase,
        state: &PipelineState,
        store: &mut ContextStore,
        goal: &str,
    ) -> Result<(PhaseReport, IterationCheckpoints)> {
        let ctx = PhaseContext {
            paths: &self.paths,
            config: &self.config,
            goal,
            state,
            cancel: &self.cancel,
        };
        let every = self.config.implementation.checkpoint_every.max(1);
        let mut written = IterationCheckpoints::default();
        let mut on_iteration = |meta: &IterationMeta| {
            if meta.iteration % every != 0 {
                return;
            }
            let label = format!(
                "{}-iteration-{}",
                checkpoint_label(phase, state.status(phase)),
                meta.iteration
            );
            match self
                .checkpoints
                .write_checkpoint(state, &label, &phase_errors(state))
            {
                Ok(checkpoint) => written.last_id = Some(checkpoint.id),
                Err(err) => {
                    warn!(iteration = meta.iteration, error = %format!("{err:#}"), "iteration checkpoint failed");
                    written.errors.push(format!("{label}: {err:#}"));
                }
            }
        };
        let report = self
            .executor
            .execute(phase, &ctx, store, &mut on_iteration)?;
        Ok((report, written))
    }

    fn failure_decision(&self, phase: Phase, result: &PhaseResult, attempt: u32) -> FailureDecision {
        if !self.mode.is_interactive() {
            return FailureDecision::ContinuePast;
        }
        if attempt >= self.config.pipeline.max_phase_attempts {
            warn!(phase = %phase, attempt, "retry limit reached; continuing past");
            return FailureDecision::ContinuePast;
        }
        self.decider.on_failure(phase, result, attempt)
    }

    /// Age the context store one turn and compress what is about to expire.
    fn end_turn(&self, store: &mut ContextStore) {
        let expired = store.process_turn();
        let expiring: Vec<_> = store
            .get_expiring_soon(self.config.context.compress_threshold)
            .into_iter()
            .map(|entry| entry.id())
            .collect();
        match store.compress(&expiring) {
            Ok(compressed) => debug!(expired = expired.len(), compressed, "context turn processed"),
            Err(err) => warn!(error = %err, "context compression failed"),
        }
    }

    fn checkpoint_phase(&self, state: &mut PipelineState, phase: Phase, errors: &mut Vec<String>) {
        let label = checkpoint_label(phase, state.status(phase));
        self.checkpoint(state, &label, errors);
    }

    /// Write a checkpoint and record its id. Failures are logged and collected.
    fn checkpoint(&self, state: &mut PipelineState, label: &str, errors: &mut Vec<String>) {
        match self
            .checkpoints
            .write_checkpoint(state, label, &phase_errors(state))
        {
            Ok(written) => {
                debug!(checkpoint_id = %written.id, label, "checkpoint recorded");
                state.set_checkpoint_id(written.id);
            }
            Err(err) => {
                warn!(label, error = %format!("{err:#}"), "checkpoint write failed; continuing");
                errors.push(format!("{label}: {err:#}"));
            }
        }
    }
}

#[derive(Debug, Default)]
struct IterationCheckpoints {
    last_id: Option<String>,
    errors: Vec<String>,
}

/// `phase: error` for every failed phase, in canonical order.
fn phase_errors(state: &PipelineState) -> Vec<String> {
    state
        .failed_phases()
        .into_iter()
        .filter_map(|phase| {
            let error = state.result(phase)?.error.as_deref()?;
            Some(format!("{phase}: {error}"))
        })
        .collect()
}

fn save_goal(path: &Path, goal: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, format!("{}\n", goal.trim()))
        .with_context(|| format!("write {}", path.display()))
}
