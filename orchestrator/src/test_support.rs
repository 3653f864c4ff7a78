//! Scripted collaborators and project fixtures for tests.
//!
//! Every scripted collaborator records its calls. Queued responses are consumed in
//! order; `assert_drained` fails the test if any are left over.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{Phase, PhaseResult};
use crate::io::config::{PipelineConfig, write_config};
use crate::io::layout::ProjectPaths;
use crate::io::model::{ModelRequest, ModelResponse, ModelTool};
use crate::io::test_runner::{TestOutcome, TestRequest, TestRunner};
use crate::io::tracker::{IssueStatus, IssueTracker};
use crate::pipeline::{Decider, FailureDecision, PauseDecision};

/// Model tool that replays queued responses and records every prompt.
///
/// Once the queue is empty, the fallback response (if any) is repeated.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    responses: RefCell<VecDeque<ModelResponse>>,
    fallback: Option<ModelResponse>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            ..Self::default()
        }
    }

    pub fn always(response: ModelResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::default()
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    pub fn assert_drained(&self) {
        let left = self.responses.borrow().len();
        assert_eq!(left, 0, "{left} scripted model responses were not consumed");
    }
}

impl ModelTool for ScriptedModel {
    fn invoke(&self, request: &ModelRequest) -> ModelResponse {
        self.prompts.borrow_mut().push(request.prompt.clone());
        if let Some(response) = self.responses.borrow_mut().pop_front() {
            return response;
        }
        match &self.fallback {
            Some(response) => response.clone(),
            None => panic!("no scripted model response left for prompt:\n{}", request.prompt),
        }
    }
}

/// One scripted answer to `show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStatus {
    Status(String),
    /// The query itself fails (tool missing, timeout, bad output).
    QueryFails,
}

impl ScriptedStatus {
    pub fn closed() -> Self {
        Self::Status("closed".to_string())
    }

    pub fn open() -> Self {
        Self::Status("open".to_string())
    }
}

/// In-memory issue tracker.
///
/// Created ids are `bd-1`, `bd-2`, ... in creation order. Each issue answers `show`
/// from its queue; the last answer repeats once the queue has one item left.
#[derive(Debug, Default)]
pub struct ScriptedTracker {
    statuses: RefCell<HashMap<String, VecDeque<ScriptedStatus>>>,
    next_id: Cell<u32>,
    created: RefCell<Vec<(String, String)>>,
    dependencies: RefCell<Vec<(String, String)>>,
    shows: RefCell<Vec<String>>,
    syncs: Cell<u32>,
    fail_writes: bool,
}

impl ScriptedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker whose create/dep/sync calls all fail.
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn with_statuses(self, issue_id: &str, statuses: Vec<ScriptedStatus>) -> Self {
        self.statuses
            .borrow_mut()
            .insert(issue_id.to_string(), statuses.into());
        self
    }

    pub fn all_closed(self, issue_ids: &[&str]) -> Self {
        issue_ids.iter().fold(self, |tracker, id| {
            tracker.with_statuses(id, vec![ScriptedStatus::closed()])
        })
    }

    /// `(id, title)` of every created epic and issue.
    pub fn created(&self) -> Vec<(String, String)> {
        self.created.borrow().clone()
    }

    /// `(issue, depends_on)` pairs.
    pub fn dependencies(&self) -> Vec<(String, String)> {
        self.dependencies.borrow().clone()
    }

    pub fn shows(&self) -> Vec<String> {
        self.shows.borrow().clone()
    }

    pub fn syncs(&self) -> u32 {
        self.syncs.get()
    }

    pub fn assert_drained(&self) {
        for (id, queue) in self.statuses.borrow().iter() {
            assert!(
                queue.len() <= 1,
                "{} scripted statuses for {id} were not consumed",
                queue.len() - 1
            );
        }
    }

    fn write_guard(&self, op: &str) -> Result<()> {
        if self.fail_writes {
            return Err(anyhow!("bd {op} failed: scripted failure"));
        }
        Ok(())
    }

    fn create(&self, title: &str) -> Result<String> {
        self.write_guard("create")?;
        let next = self.next_id.get() + 1;
        self.next_id.set(next);
        let id = format!("bd-{next}");
        self.created
            .borrow_mut()
            .push((id.clone(), title.to_string()));
        Ok(id)
    }
}

impl IssueTracker for ScriptedTracker {
    fn show(&self, issue_id: &str) -> Result<IssueStatus> {
        self.shows.borrow_mut().push(issue_id.to_string());
        let mut statuses = self.statuses.borrow_mut();
        let queue = statuses
            .get_mut(issue_id)
            .ok_or_else(|| anyhow!("unknown issue {issue_id}"))?;
        let answer = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match answer {
            Some(ScriptedStatus::Status(status)) => Ok(IssueStatus::new(status)),
            Some(ScriptedStatus::QueryFails) => Err(anyhow!("bd show {issue_id} timed out")),
            None => Err(anyhow!("no status scripted for {issue_id}")),
        }
    }

    fn create_epic(&self, title: &str) -> Result<String> {
        self.create(title)
    }

    fn create_issue(&self, title: &str) -> Result<String> {
        self.create(title)
    }

    fn add_dependency(&self, issue_id: &str, depends_on_id: &str) -> Result<()> {
        self.write_guard("dep add")?;
        self.dependencies
            .borrow_mut()
            .push((issue_id.to_string(), depends_on_id.to_string()));
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.write_guard("sync")?;
        self.syncs.set(self.syncs.get() + 1);
        Ok(())
    }
}

/// Test runner replaying queued outcomes, then repeating the fallback.
#[derive(Debug, Default)]
pub struct ScriptedTestRunner {
    outcomes: RefCell<VecDeque<TestOutcome>>,
    fallback: Option<TestOutcome>,
    runs: Cell<u32>,
}

impl ScriptedTestRunner {
    pub fn new(outcomes: Vec<TestOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            ..Self::default()
        }
    }

    pub fn always(outcome: TestOutcome) -> Self {
        Self {
            fallback: Some(outcome),
            ..Self::default()
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.get()
    }

    pub fn assert_drained(&self) {
        let left = self.outcomes.borrow().len();
        assert_eq!(left, 0, "{left} scripted test outcomes were not consumed");
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, _request: &TestRequest) -> TestOutcome {
        self.runs.set(self.runs.get() + 1);
        if let Some(outcome) = self.outcomes.borrow_mut().pop_front() {
            return outcome;
        }
        match &self.fallback {
            Some(outcome) => outcome.clone(),
            None => panic!("no scripted test outcome left"),
        }
    }
}

/// Decider replaying queued decisions and recording what it was asked.
#[derive(Debug, Default)]
pub struct ScriptedDecider {
    failures: RefCell<VecDeque<FailureDecision>>,
    pauses: RefCell<VecDeque<PauseDecision>>,
    failure_calls: RefCell<Vec<(Phase, u32)>>,
    pause_calls: RefCell<Vec<Phase>>,
}

impl ScriptedDecider {
    pub fn new(failures: Vec<FailureDecision>, pauses: Vec<PauseDecision>) -> Self {
        Self {
            failures: RefCell::new(failures.into()),
            pauses: RefCell::new(pauses.into()),
            ..Self::default()
        }
    }

    /// `(phase, attempt)` for every failure consultation.
    pub fn failure_calls(&self) -> Vec<(Phase, u32)> {
        self.failure_calls.borrow().clone()
    }

    pub fn pause_calls(&self) -> Vec<Phase> {
        self.pause_calls.borrow().clone()
    }

    pub fn assert_drained(&self) {
        assert!(
            self.failures.borrow().is_empty(),
            "scripted failure decisions were not consumed"
        );
        assert!(
            self.pauses.borrow().is_empty(),
            "scripted pause decisions were not consumed"
        );
    }
}

impl Decider for ScriptedDecider {
    fn on_failure(&self, phase: Phase, _result: &PhaseResult, attempt: u32) -> FailureDecision {
        self.failure_calls.borrow_mut().push((phase, attempt));
        self.failures
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected failure consultation for {phase}"))
    }

    fn on_pause(&self, completed: Phase) -> PauseDecision {
        self.pause_calls.borrow_mut().push(completed);
        self.pauses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected pause consultation after {completed}"))
    }
}

/// Temporary project directory with a fast pipeline config.
pub struct TestProject {
    temp: TempDir,
    paths: ProjectPaths,
    config: PipelineConfig,
}

impl TestProject {
    /// New project whose config skips settle sleeps.
    pub fn new() -> Result<Self> {
        let mut config = PipelineConfig::default();
        config.implementation.settle_interval_secs = 0;
        config.implementation.max_iterations = 5;
        Self::with_config(config)
    }

    pub fn with_config(config: PipelineConfig) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = ProjectPaths::new(temp.path());
        write_config(&paths.config_path, &config)?;
        Ok(Self {
            temp,
            paths,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Write `contents` under the project root, creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}
