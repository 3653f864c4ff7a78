//! Autonomous implementation loop.
//!
//! Each iteration prompts the model tool with the open issues and their plan
//! content, waits for side effects to settle, polls the issue tracker and, once
//! every issue is closed, runs the test suite. The loop converges on the first
//! passing test run and is exhausted after `max_iterations`.
//!
//! Tool failures, tracker query failures and failing tests are expected and only
//! move the loop to its next iteration. Context bound violations are programming
//! errors and are returned as `Err`.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::state::TrackedIssue;
use crate::core::types::{ImplementationResult, LoopState};
use crate::cwa::{BatchTask, ContextStore, EntryId, EntryType, NewEntry};
use crate::io::config::PipelineConfig;
use crate::io::iteration_log::{IterationMeta, IterationPaths, IterationWriteRequest, write_iteration};
use crate::io::layout::ProjectPaths;
use crate::io::model::{ModelRequest, ModelTool};
use crate::io::prompt::{ImplementationPromptInputs, PromptBuilder, PromptIssue};
use crate::io::test_runner::{TestRequest, TestRunner};
use crate::io::tracker::IssueTracker;

pub const CANCELLED_ERROR: &str = "cancelled";

/// Knobs of the loop, usually taken from the project config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub settle_interval: Duration,
    pub model_timeout: Duration,
    pub streaming: bool,
    pub test_timeout: Duration,
    pub prompt_budget_bytes: usize,
    /// Ttl of failed-test entries; `None` keeps them until compressed.
    pub command_result_ttl: Option<u32>,
}

impl LoopSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            max_iterations: cfg.implementation.max_iterations,
            settle_interval: Duration::from_secs(cfg.implementation.settle_interval_secs),
            model_timeout: cfg.model.timeout(),
            streaming: cfg.model.streaming,
            test_timeout: Duration::from_secs(cfg.tests.timeout_secs),
            prompt_budget_bytes: cfg.model.prompt_budget_bytes,
            command_result_ttl: (cfg.context.command_result_ttl > 0)
                .then_some(cfg.context.command_result_ttl),
        }
    }
}

/// What the loop works on.
#[derive(Debug, Clone)]
pub struct ImplementationRequest {
    pub project_root: PathBuf,
    pub plan_paths: Vec<PathBuf>,
    pub issues: Vec<TrackedIssue>,
    pub epic_id: Option<String>,
}

impl ImplementationRequest {
    /// Request for bare issue ids, with no per-issue plan document.
    pub fn for_issue_ids(
        project_root: PathBuf,
        plan_paths: Vec<PathBuf>,
        issue_ids: Vec<String>,
        epic_id: Option<String>,
    ) -> Self {
        let issues = issue_ids
            .into_iter()
            .map(|id| TrackedIssue {
                title: id.clone(),
                id,
                plan_path: None,
            })
            .collect();
        Self {
            project_root,
            plan_paths,
            issues,
            epic_id,
        }
    }
}

pub struct ImplementationLoop<'a, M: ModelTool, T: IssueTracker, R: TestRunner> {
    model: &'a M,
    tracker: &'a T,
    tests: &'a R,
    settings: LoopSettings,
    prompts: PromptBuilder,
    cancel: CancelToken,
}

/// Mutable bookkeeping carried across iterations.
struct Progress {
    closed: Vec<String>,
    last_failure: Option<EntryId>,
    last_tests: Option<bool>,
}

impl<'a, M: ModelTool, T: IssueTracker, R: TestRunner> ImplementationLoop<'a, M, T, R> {
    pub fn new(model: &'a M, tracker: &'a T, tests: &'a R, settings: LoopSettings) -> Self {
        let prompts = PromptBuilder::new(settings.prompt_budget_bytes);
        Self {
            model,
            tracker,
            tests,
            settings,
            prompts,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run until convergence, exhaustion or cancellation.
    ///
    /// `on_iteration` sees the record of every finished iteration, including the
    /// last one.
    #[instrument(skip_all, fields(issues = request.issues.len(), max_iterations = self.settings.max_iterations))]
    pub fn run<F>(
        &self,
        request: &ImplementationRequest,
        store: &mut ContextStore,
        mut on_iteration: F,
    ) -> Result<ImplementationResult>
    where
        F: FnMut(&IterationMeta),
    {
        let paths = ProjectPaths::new(&request.project_root);
        let max_iterations = self.settings.max_iterations;
        let mut progress = Progress {
            closed: Vec::new(),
            last_failure: None,
            last_tests: None,
        };

        for iteration in 1..=max_iterations {
            if self.cancel.is_cancelled() {
                return Ok(cancelled(iteration - 1, &progress));
            }
            let started_at = Utc::now();
            let clock = Instant::now();
            let iteration_paths = IterationPaths::new(&paths, iteration);
            if let Err(err) = iteration_paths.create_dir() {
                warn!(iteration, error = %format!("{err:#}"), "iteration log dir unavailable");
            }

            restore_expired_plans(request, &progress, store)?;
            let prompt = self.build_prompt(request, &progress, store)?;
            let response = self.model.invoke(&ModelRequest {
                prompt,
                workdir: request.project_root.clone(),
                timeout: self.cancel.clamp(self.settings.model_timeout),
                streaming: self.settings.streaming,
                stream_path: self
                    .settings
                    .streaming
                    .then(|| iteration_paths.model_stream_path.clone()),
                cancel: self.cancel.child_with_timeout(self.settings.model_timeout),
            });
            if !response.success {
                warn!(iteration, error = %response.error, "model tool failed; retrying next iteration");
            }

            let mut state = if response.success {
                LoopState::AwaitingIssueClosure
            } else {
                LoopState::Running
            };
            let mut tests_log: Option<String> = None;
            let settled = self.cancel.sleep(self.settings.settle_interval);

            if settled && response.success {
                progress.closed = self.closed_issues(&request.issues);
                let open = open_issue_ids(&request.issues, &progress.closed);
                debug!(iteration, closed = progress.closed.len(), open = open.len(), "issue status polled");

                if open.is_empty() {
                    state = LoopState::RunningTests;
                    let outcome = self.tests.run(&TestRequest {
                        workdir: request.project_root.clone(),
                        timeout: self.cancel.clamp(self.settings.test_timeout),
                        cancel: self.cancel.clone(),
                    });
                    progress.last_tests = Some(outcome.passed);
                    if outcome.passed {
                        state = LoopState::Converged;
                    } else {
                        let source = outcome.command.clone().unwrap_or_else(|| "tests".to_string());
                        let mut entry = NewEntry::new(EntryType::CommandResult, source)
                            .content(outcome.output.clone())
                            .summary(format!("tests failed on iteration {iteration}"));
                        if let Some(ttl) = self.settings.command_result_ttl {
                            entry = entry.ttl(ttl);
                        }
                        progress.last_failure = Some(store.add(entry)?);
                        info!(iteration, "tests failed; continuing");
                        state = LoopState::Running;
                    }
                    tests_log = Some(outcome.output);
                }
            }
            if !settled || (self.cancel.is_cancelled() && state != LoopState::Converged) {
                state = LoopState::Failed;
            }

            let meta = IterationMeta {
                iteration,
                state,
                model_success: response.success,
                model_error: (!response.success).then(|| response.error.clone()),
                closed_issues: progress.closed.clone(),
                open_issues: open_issue_ids(&request.issues, &progress.closed),
                tests_passed: tests_log.as_ref().and(progress.last_tests),
                started_at: started_at.to_rfc3339(),
                ended_at: Utc::now().to_rfc3339(),
                duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            };
            let model_log = if response.success {
                response.output.as_str()
            } else {
                response.error.as_str()
            };
            if let Err(err) = write_iteration(&IterationWriteRequest {
                paths: &iteration_paths,
                meta: &meta,
                model_log,
                tests_log: tests_log.as_deref(),
            }) {
                warn!(iteration, error = %format!("{err:#}"), "failed to write iteration log");
            }
            on_iteration(&meta);

            match state {
                LoopState::Converged => {
                    info!(iteration, "implementation converged");
                    return Ok(ImplementationResult {
                        success: true,
                        error: None,
                        iterations: iteration,
                        tests_passed: true,
                        phases_closed: progress.closed,
                        final_state: LoopState::Converged,
                    });
                }
                LoopState::Failed => return Ok(cancelled(iteration, &progress)),
                _ => {}
            }

            let expired = store.process_turn();
            if progress
                .last_failure
                .is_some_and(|id| expired.contains(&id))
            {
                progress.last_failure = None;
            }
        }

        Ok(exhausted(max_iterations, request.issues.len(), &progress))
    }

    /// Render the prompt for the open issues whose plan entries fit the first batch.
    fn build_prompt(
        &self,
        request: &ImplementationRequest,
        progress: &Progress,
        store: &ContextStore,
    ) -> Result<String> {
        let open: Vec<&TrackedIssue> = request
            .issues
            .iter()
            .filter(|issue| !progress.closed.contains(&issue.id))
            .collect();
        let reserved = usize::from(progress.last_failure.is_some());
        let limit = store.max_implementation_entries().saturating_sub(reserved);
        let tasks = open
            .iter()
            .map(|issue| BatchTask::new(issue.id.clone(), plan_entries(store, issue)))
            .collect();
        let batch = store
            .create_batches(tasks, limit)?
            .into_iter()
            .next()
            .unwrap_or_default();

        let mut entry_ids = batch.entry_ids();
        entry_ids.extend(progress.last_failure);
        let mut context = store.build_implementation_context(&entry_ids)?;
        let failure = progress
            .last_failure
            .and_then(|id| context.take(id))
            .map(|entry| entry.content.unwrap_or(entry.summary));

        let focus: HashSet<&str> = batch.tasks.iter().map(|task| task.task.as_str()).collect();
        let issues = open
            .iter()
            .filter(|issue| focus.contains(issue.id.as_str()))
            .map(|issue| PromptIssue {
                id: issue.id.clone(),
                title: issue.title.clone(),
                plan_path: issue.plan_path.as_ref().map(|p| p.display().to_string()),
            })
            .collect();

        self.prompts.build_implementation(&ImplementationPromptInputs {
            epic_id: request.epic_id.clone(),
            issues,
            plan_paths: request
                .plan_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            implementation_context: context.render(),
            failure,
        })
    }

    /// Ids of the issues the tracker reports closed. Failed queries count as open.
    fn closed_issues(&self, issues: &[TrackedIssue]) -> Vec<String> {
        issues
            .iter()
            .filter(|issue| match self.tracker.show(&issue.id) {
                Ok(status) => status.is_closed(),
                Err(err) => {
                    warn!(issue = %issue.id, error = %format!("{err:#}"), "issue status query failed");
                    false
                }
            })
            .map(|issue| issue.id.clone())
            .collect()
    }
}

fn plan_entries(store: &ContextStore, issue: &TrackedIssue) -> Vec<EntryId> {
    let Some(path) = &issue.plan_path else {
        return Vec::new();
    };
    store
        .find_by_source(&path.display().to_string())
        .into_iter()
        .filter(|entry| entry.entry_type() == EntryType::Plan)
        .map(|entry| entry.id())
        .collect()
}

/// Re-add plan documents of open issues whose PLAN entries expired or were never added.
///
/// Re-added entries carry no ttl. Unreadable plans are skipped with a warning.
fn restore_expired_plans(
    request: &ImplementationRequest,
    progress: &Progress,
    store: &mut ContextStore,
) -> Result<()> {
    for issue in &request.issues {
        if progress.closed.contains(&issue.id) || !plan_entries(store, issue).is_empty() {
            continue;
        }
        let Some(path) = &issue.plan_path else {
            continue;
        };
        match fs::read_to_string(path) {
            Ok(body) if !body.trim().is_empty() => {
                let id = store.add(
                    NewEntry::new(EntryType::Plan, path.display().to_string()).content(body),
                )?;
                debug!(issue = %issue.id, entry = %id, "plan entry restored");
            }
            Ok(_) => warn!(issue = %issue.id, path = %path.display(), "plan document is empty"),
            Err(err) => {
                warn!(issue = %issue.id, path = %path.display(), error = %err, "plan document unreadable");
            }
        }
    }
    Ok(())
}

fn open_issue_ids(issues: &[TrackedIssue], closed: &[String]) -> Vec<String> {
    issues
        .iter()
        .filter(|issue| !closed.contains(&issue.id))
        .map(|issue| issue.id.clone())
        .collect()
}

fn cancelled(iterations: u32, progress: &Progress) -> ImplementationResult {
    warn!(iterations, "implementation loop cancelled");
    ImplementationResult {
        success: false,
        error: Some(CANCELLED_ERROR.to_string()),
        iterations,
        tests_passed: false,
        phases_closed: progress.closed.clone(),
        final_state: LoopState::Failed,
    }
}

fn exhausted(max_iterations: u32, total: usize, progress: &Progress) -> ImplementationResult {
    let tests = match progress.last_tests {
        Some(true) => "passed",
        Some(false) => "failed",
        None => "not run",
    };
    let error = format!(
        "implementation did not converge within max_iterations={max_iterations}: {} of {total} issues closed, last test run {tests}",
        progress.closed.len()
    );
    warn!(max_iterations, "implementation loop exhausted");
    ImplementationResult {
        success: false,
        error: Some(error),
        iterations: max_iterations,
        tests_passed: false,
        phases_closed: progress.closed.clone(),
        final_state: LoopState::Exhausted,
    }
}
