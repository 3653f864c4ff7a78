//! Phase bodies.
//!
//! A [`PhaseExecutor`] runs one phase against the project and the context store and
//! reports a [`PhaseResult`]. Collaborator failures and missing inputs are failed
//! results; only invariant violations (context bounds, bad artifact paths) are `Err`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::plan_split::split_plan;
use crate::core::state::{BeadsLink, PipelineState, TrackedIssue};
use crate::core::types::{ImplementationResult, Phase, PhaseResult, PhaseStatus};
use crate::cwa::{ContextStore, EntryId, EntryType, NewEntry};
use crate::implementation::{ImplementationLoop, ImplementationRequest, LoopSettings};
use crate::io::config::PipelineConfig;
use crate::io::iteration_log::IterationMeta;
use crate::io::layout::ProjectPaths;
use crate::io::model::{ModelRequest, ModelTool};
use crate::io::prompt::{PhasePromptInputs, PromptBuilder};
use crate::io::test_runner::TestRunner;
use crate::io::tracker::IssueTracker;

/// Read-only inputs shared by every phase.
pub struct PhaseContext<'a> {
    pub paths: &'a ProjectPaths,
    pub config: &'a PipelineConfig,
    pub goal: &'a str,
    pub state: &'a PipelineState,
    pub cancel: &'a CancelToken,
}

/// What one phase execution produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub result: PhaseResult,
    /// Context entries added by the phase, in insertion order.
    pub entries: Vec<EntryId>,
    pub beads: Option<BeadsLink>,
    pub implementation: Option<ImplementationResult>,
}

impl PhaseReport {
    fn new(result: PhaseResult, entries: Vec<EntryId>) -> Self {
        Self {
            result,
            entries,
            beads: None,
            implementation: None,
        }
    }

    fn failed(phase: Phase, error: impl Into<String>) -> Self {
        Self::new(PhaseResult::failure(phase, error), Vec::new())
    }
}

pub trait PhaseExecutor {
    /// Run `phase`. `on_iteration` is called after every implementation loop iteration.
    fn execute(
        &self,
        phase: Phase,
        ctx: &PhaseContext<'_>,
        store: &mut ContextStore,
        on_iteration: &mut dyn FnMut(&IterationMeta),
    ) -> Result<PhaseReport>;
}

/// Entry type used for a phase's primary artifact.
pub fn artifact_entry_type(phase: Phase) -> EntryType {
    match phase {
        Phase::Research => EntryType::File,
        Phase::Decomposition => EntryType::Task,
        Phase::TddPlanning | Phase::MultiDoc => EntryType::Plan,
        Phase::BeadsSync | Phase::Implementation => EntryType::Tracking,
    }
}

/// Re-add the artifacts of completed phases to a fresh store and track the new ids.
///
/// Plan documents are restored without a ttl. Unreadable artifacts are skipped with a
/// warning.
pub fn restore_artifacts(
    state: &mut PipelineState,
    store: &mut ContextStore,
    ttl: Option<u32>,
) -> usize {
    let mut restored = 0;
    for phase in Phase::ALL {
        if state.status(phase) != PhaseStatus::Completed {
            continue;
        }
        let artifacts = state
            .result(phase)
            .map(|result| result.artifacts.clone())
            .unwrap_or_default();
        for path in artifacts {
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!(phase = %phase, path = %path.display(), error = %err, "artifact missing on resume");
                    continue;
                }
            };
            let mut entry = NewEntry::new(artifact_entry_type(phase), path.display().to_string())
                .content(contents);
            if let Some(ttl) = ttl
                && phase != Phase::MultiDoc
            {
                entry = entry.ttl(ttl);
            }
            let id = match store.add(entry) {
                Ok(id) => id,
                Err(err) => {
                    warn!(phase = %phase, path = %path.display(), error = %err, "artifact not restored");
                    continue;
                }
            };
            state.track_entry(phase, id);
            restored += 1;
        }
    }
    debug!(restored, "artifacts restored into context store");
    restored
}

/// Production phase bodies driving the model tool, the issue tracker and the tests.
pub struct StandardPhases<'a, M: ModelTool, T: IssueTracker, R: TestRunner> {
    model: &'a M,
    tracker: &'a T,
    tests: &'a R,
}

impl<'a, M: ModelTool, T: IssueTracker, R: TestRunner> StandardPhases<'a, M, T, R> {
    pub fn new(model: &'a M, tracker: &'a T, tests: &'a R) -> Self {
        Self {
            model,
            tracker,
            tests,
        }
    }

    /// Research, decomposition and planning: one model call producing one artifact.
    fn prompt_phase(
        &self,
        phase: Phase,
        upstream: Option<Phase>,
        ctx: &PhaseContext<'_>,
        store: &mut ContextStore,
    ) -> Result<PhaseReport> {
        let upstream_text = upstream.and_then(|up| {
            let text = completed_artifact(ctx.state, up);
            if text.is_none() {
                warn!(phase = %phase, upstream = %up, "upstream artifact unavailable; prompting without it");
            }
            text
        });
        let inputs = PhasePromptInputs {
            goal: ctx.goal.to_string(),
            working_context: store.build_working_context().render(),
            upstream: upstream_text,
        };
        let prompt = PromptBuilder::new(ctx.config.model.prompt_budget_bytes)
            .build_phase(phase, &inputs)?;

        let response = self.model.invoke(&ModelRequest {
            prompt,
            workdir: ctx.paths.root.clone(),
            timeout: ctx.config.model.timeout(),
            streaming: ctx.config.model.streaming,
            stream_path: Some(ctx.paths.phase_stream_log(phase)),
            cancel: ctx.cancel.clone(),
        });

        let mut entries = Vec::new();
        entries.push(store.add(
            command_entry(ctx, format!("model:{phase}")).summary(if response.success {
                format!("{phase} model call succeeded ({} bytes)", response.output.len())
            } else {
                format!(
                    "{phase} model call failed: {}",
                    first_line(&response.error).unwrap_or("no error output")
                )
            }),
        )?);

        if !response.success {
            let mut result = PhaseResult::failure(phase, response.error);
            if !response.output.trim().is_empty() {
                result = result.with_output(response.output);
            }
            return Ok(PhaseReport::new(result, entries));
        }
        if response.output.trim().is_empty() {
            return Ok(PhaseReport::new(
                PhaseResult::failure(phase, format!("{phase}: model returned no output")),
                entries,
            ));
        }

        let path = ctx.paths.artifact(phase);
        if let Err(err) = write_artifact(&path, &response.output) {
            return Ok(PhaseReport::new(
                PhaseResult::failure(phase, format!("{err:#}")),
                entries,
            ));
        }
        entries.push(store.add(
            artifact_entry(ctx, phase, &path).content(response.output.clone()),
        )?);
        info!(phase = %phase, path = %path.display(), "artifact written");

        let result = PhaseResult::success(phase, Some(response.output), vec![path])?;
        Ok(PhaseReport::new(result, entries))
    }

    fn multi_doc(&self, ctx: &PhaseContext<'_>, store: &mut ContextStore) -> Result<PhaseReport> {
        let phase = Phase::MultiDoc;
        let Some(plan) = completed_artifact(ctx.state, Phase::TddPlanning) else {
            return Ok(PhaseReport::failed(
                phase,
                "no TDD plan available; tdd_planning has not completed",
            ));
        };

        let documents = split_plan(&plan);
        let mut artifacts = Vec::with_capacity(documents.len());
        let mut entries = Vec::with_capacity(documents.len());
        for doc in &documents {
            let path = ctx.paths.plans_dir.join(&doc.file_name);
            if let Err(err) = write_artifact(&path, &doc.body) {
                return Ok(PhaseReport::failed(phase, format!("{err:#}")));
            }
            // The implementation loop reads these on every iteration; they never expire.
            entries.push(store.add(
                NewEntry::new(EntryType::Plan, path.display().to_string())
                    .content(doc.body.clone())
                    .summary(doc.title.clone()),
            )?);
            artifacts.push(path);
        }
        info!(documents = documents.len(), "plan split into documents");

        let titles: Vec<&str> = documents.iter().map(|doc| doc.title.as_str()).collect();
        let result = PhaseResult::success(phase, Some(titles.join("\n")), artifacts)?;
        Ok(PhaseReport::new(result, entries))
    }

    fn beads_sync(&self, ctx: &PhaseContext<'_>, store: &mut ContextStore) -> Result<PhaseReport> {
        let phase = Phase::BeadsSync;
        let plan_paths = completed_artifacts(ctx.state, Phase::MultiDoc);
        if plan_paths.is_empty() {
            return Ok(PhaseReport::failed(
                phase,
                "no plan documents available; multi_doc has not completed",
            ));
        }

        let link = match self.create_issues(ctx.goal, &plan_paths) {
            Ok(link) => link,
            Err(err) => return Ok(PhaseReport::failed(phase, format!("{err:#}"))),
        };

        let mut entries = Vec::with_capacity(link.issues.len());
        for issue in &link.issues {
            let plan = issue
                .plan_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let mut entry = NewEntry::new(EntryType::Tracking, issue.id.clone())
                .content(format!(
                    "issue {} in epic {}: {}\nplan: {plan}\n",
                    issue.id, link.epic_id, issue.title
                ))
                .summary(format!("{}: {}", issue.id, issue.title));
            if let Some(ttl) = ctx.config.context.artifact_ttl() {
                entry = entry.ttl(ttl);
            }
            entries.push(store.add(entry)?);
        }
        info!(epic_id = %link.epic_id, issues = link.issues.len(), "issues synced");

        let output = format!("epic {} with {} issues", link.epic_id, link.issues.len());
        let mut report = PhaseReport::new(PhaseResult::success(phase, Some(output), Vec::new())?, entries);
        report.beads = Some(link);
        Ok(report)
    }

    /// One epic, one issue per plan document, each depending on its predecessor.
    fn create_issues(&self, goal: &str, plan_paths: &[PathBuf]) -> Result<BeadsLink> {
        let epic_id = self
            .tracker
            .create_epic(&epic_title(goal))
            .context("create epic")?;
        let mut issues: Vec<TrackedIssue> = Vec::with_capacity(plan_paths.len());
        for path in plan_paths {
            let title = plan_title(path);
            let id = self
                .tracker
                .create_issue(&title)
                .with_context(|| format!("create issue for {}", path.display()))?;
            if let Some(prev) = issues.last() {
                self.tracker
                    .add_dependency(&id, &prev.id)
                    .with_context(|| format!("link {id} to {}", prev.id))?;
            }
            issues.push(TrackedIssue {
                id,
                title,
                plan_path: Some(path.clone()),
            });
        }
        self.tracker.sync().context("sync issue tracker")?;
        Ok(BeadsLink { epic_id, issues })
    }

    fn implementation(
        &self,
        ctx: &PhaseContext<'_>,
        store: &mut ContextStore,
        on_iteration: &mut dyn FnMut(&IterationMeta),
    ) -> Result<PhaseReport> {
        let phase = Phase::Implementation;
        let issues = ctx.state.beads_issues().to_vec();
        if issues.is_empty() {
            return Ok(PhaseReport::failed(
                phase,
                "no tracked issues; beads_sync has not completed",
            ));
        }
        let request = ImplementationRequest {
            project_root: ctx.paths.root.clone(),
            plan_paths: completed_artifacts(ctx.state, Phase::MultiDoc),
            issues,
            epic_id: ctx.state.beads_epic_id().map(str::to_string),
        };

        let outcome = ImplementationLoop::new(
            self.model,
            self.tracker,
            self.tests,
            LoopSettings::from_config(ctx.config),
        )
        .with_cancel(ctx.cancel.clone())
        .run(&request, store, |meta| on_iteration(meta))?;

        let summary = serde_json::to_string_pretty(&outcome).context("serialize implementation result")?;
        let entry = command_entry(ctx, "implementation".to_string()).summary(format!(
            "implementation {} after {} iterations",
            if outcome.success { "converged" } else { "stopped" },
            outcome.iterations
        ));
        let entries = vec![store.add(entry)?];

        let result = if outcome.success {
            PhaseResult::success(phase, Some(summary), Vec::new())?
        } else {
            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| "implementation did not converge".to_string());
            PhaseResult::failure(phase, error).with_output(summary)
        };
        let mut report = PhaseReport::new(result, entries);
        report.implementation = Some(outcome);
        Ok(report)
    }
}

impl<M: ModelTool, T: IssueTracker, R: TestRunner> PhaseExecutor for StandardPhases<'_, M, T, R> {
    #[instrument(skip_all, fields(phase = %phase))]
    fn execute(
        &self,
        phase: Phase,
        ctx: &PhaseContext<'_>,
        store: &mut ContextStore,
        on_iteration: &mut dyn FnMut(&IterationMeta),
    ) -> Result<PhaseReport> {
        match phase {
            Phase::Research => self.prompt_phase(phase, None, ctx, store),
            Phase::Decomposition => self.prompt_phase(phase, Some(Phase::Research), ctx, store),
            Phase::TddPlanning => self.prompt_phase(phase, Some(Phase::Decomposition), ctx, store),
            Phase::MultiDoc => self.multi_doc(ctx, store),
            Phase::BeadsSync => self.beads_sync(ctx, store),
            Phase::Implementation => self.implementation(ctx, store, on_iteration),
        }
    }
}

fn command_entry(ctx: &PhaseContext<'_>, source: String) -> NewEntry {
    let entry = NewEntry::new(EntryType::CommandResult, source);
    match ctx.config.context.command_result_ttl {
        0 => entry,
        ttl => entry.ttl(ttl),
    }
}

fn artifact_entry(ctx: &PhaseContext<'_>, phase: Phase, path: &Path) -> NewEntry {
    let entry = NewEntry::new(artifact_entry_type(phase), path.display().to_string());
    match ctx.config.context.artifact_ttl() {
        Some(ttl) => entry.ttl(ttl),
        None => entry,
    }
}

/// Artifacts of `phase` when it completed successfully.
fn completed_artifacts(state: &PipelineState, phase: Phase) -> Vec<PathBuf> {
    if state.status(phase) != PhaseStatus::Completed {
        return Vec::new();
    }
    state
        .result(phase)
        .filter(|result| result.success)
        .map(|result| result.artifacts.clone())
        .unwrap_or_default()
}

fn completed_artifact(state: &PipelineState, phase: Phase) -> Option<String> {
    let path = completed_artifacts(state, phase).into_iter().next()?;
    match fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(err) => {
            warn!(phase = %phase, path = %path.display(), error = %err, "read artifact");
            None
        }
    }
}

fn write_artifact(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write artifact {}", path.display()))
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

fn epic_title(goal: &str) -> String {
    match first_line(goal) {
        Some(line) => line.chars().take(80).collect(),
        None => "Pipeline implementation".to_string(),
    }
}

/// Title of a plan document: its first `## ` heading, else the file stem.
fn plan_title(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| {
            text.lines()
                .find_map(|line| line.strip_prefix("## ").map(|t| t.trim().to_string()))
                .filter(|t| !t.is_empty())
        })
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Plan".to_string())
        })
}
