//! End-to-end pipeline runs over the standard phases with scripted collaborators.
//!
//! Each test drives `Pipeline::run` from a fresh project through every phase and
//! checks the artifacts, tracker calls and loop outcome it leaves behind.

use std::fs;

use orchestrator::core::types::{AutonomyMode, LoopState, Phase, PhaseStatus};
use orchestrator::io::checkpoint::CheckpointManager;
use orchestrator::io::model::ModelResponse;
use orchestrator::io::test_runner::TestOutcome;
use orchestrator::phases::StandardPhases;
use orchestrator::pipeline::{AutoDecider, Pipeline, PipelineOutcome};
use orchestrator::test_support::{
    ScriptedModel, ScriptedStatus, ScriptedTestRunner, ScriptedTracker, TestProject,
};

const RESEARCH: &str = "# Findings\nMarkdown input arrives through src/input.rs.\n";
const REQUIREMENTS: &str = "1. Tokenize headings\n2. Parse nested lists\n";
const PLAN: &str = "# Markdown parser plan\n\n## Tokenizer\n\n- failing test: heading tokens\n\n## Parser\n\n- failing test: nested list tree\n";

/// Full autonomous run:
///
/// 1. research, decomposition and planning each make one model call
/// 2. the plan splits into two documents, synced as `bd-2` and `bd-3` under epic `bd-1`
/// 3. implementation: iteration 1 leaves both issues open, iteration 2 closes them
///    but the tests fail, iteration 3 passes
#[test]
fn autonomous_run_converges_through_every_phase() {
    let project = TestProject::new().expect("project");
    let model = ScriptedModel::new(vec![
        ModelResponse::ok(RESEARCH),
        ModelResponse::ok(REQUIREMENTS),
        ModelResponse::ok(PLAN),
        ModelResponse::ok("started tokenizer"),
        ModelResponse::ok("closed both issues"),
        ModelResponse::ok("fixed the failing test"),
    ]);
    let tracker = ScriptedTracker::new()
        .with_statuses("bd-2", vec![ScriptedStatus::open(), ScriptedStatus::closed()])
        .with_statuses("bd-3", vec![ScriptedStatus::open(), ScriptedStatus::closed()]);
    let tests = ScriptedTestRunner::new(vec![
        TestOutcome::failed("parser::nested FAILED"),
        TestOutcome::passed("2 passed"),
    ]);
    let phases = StandardPhases::new(&model, &tracker, &tests);

    let run = Pipeline::new(
        project.root(),
        project.config().clone(),
        AutonomyMode::Autonomous,
        &phases,
        &AutoDecider,
    )
    .expect("pipeline")
    .with_goal("Add a markdown parser")
    .run()
    .expect("run");

    assert!(run.succeeded(), "failed: {:?}", run.failed_phases());
    for phase in Phase::ALL {
        assert_eq!(run.state.status(phase), PhaseStatus::Completed, "{phase}");
    }

    let implementation = run.implementation.as_ref().expect("loop outcome");
    assert_eq!(implementation.iterations, 3);
    assert_eq!(implementation.final_state, LoopState::Converged);
    assert_eq!(implementation.phases_closed, vec!["bd-2", "bd-3"]);

    let plans: Vec<_> = fs::read_dir(&project.paths().plans_dir)
        .expect("plans dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(plans.len(), 2);

    assert_eq!(run.state.beads_epic_id(), Some("bd-1"));
    assert_eq!(run.state.beads_issues().len(), 2);
    assert_eq!(
        tracker.dependencies(),
        vec![("bd-3".to_string(), "bd-2".to_string())]
    );

    let prompts = model.prompts();
    assert!(prompts[1].contains("src/input.rs"), "research reaches decomposition");
    assert!(prompts[2].contains("Parse nested lists"), "requirements reach planning");
    assert!(prompts[3].contains("failing test: heading tokens"));
    assert!(prompts[5].contains("parser::nested FAILED"));

    for iteration in 1..=3 {
        let dir = project.paths().iteration_dir(iteration);
        assert!(dir.join("meta.json").is_file(), "iteration {iteration}");
    }
    assert!(!project.paths().iteration_dir(1).join("tests.log").exists());
    let failed_log = fs::read_to_string(project.paths().iteration_dir(2).join("tests.log"))
        .expect("tests log");
    assert!(failed_log.contains("FAILED"));

    // Successful runs remove their checkpoints.
    let checkpoints = CheckpointManager::new(project.root()).expect("manager");
    assert!(checkpoints.list().expect("list").is_empty());

    model.assert_drained();
    tests.assert_drained();
    tracker.assert_drained();
}

#[test]
fn exhausted_implementation_fails_only_that_phase() {
    let mut config = TestProject::new().expect("defaults").config().clone();
    config.implementation.max_iterations = 2;
    let project = TestProject::with_config(config).expect("project");
    let model = ScriptedModel::new(vec![
        ModelResponse::ok(RESEARCH),
        ModelResponse::ok(REQUIREMENTS),
        ModelResponse::ok(PLAN),
        ModelResponse::ok("attempt one"),
        ModelResponse::ok("attempt two"),
    ]);
    let tracker = ScriptedTracker::new().all_closed(&["bd-2", "bd-3"]);
    let tests = ScriptedTestRunner::always(TestOutcome::failed("still red"));
    let phases = StandardPhases::new(&model, &tracker, &tests);

    let run = Pipeline::new(
        project.root(),
        project.config().clone(),
        AutonomyMode::Autonomous,
        &phases,
        &AutoDecider,
    )
    .expect("pipeline")
    .with_goal("Add a markdown parser")
    .run()
    .expect("run");

    assert_eq!(run.outcome, PipelineOutcome::Finished);
    assert_eq!(run.failed_phases(), vec![Phase::Implementation]);
    let implementation = run.implementation.as_ref().expect("loop outcome");
    assert!(!implementation.success);
    assert_eq!(implementation.iterations, 2);
    assert_eq!(implementation.final_state, LoopState::Exhausted);
    let error = run
        .state
        .result(Phase::Implementation)
        .and_then(|result| result.error.clone())
        .expect("error");
    assert!(error.contains("max_iterations=2"), "{error}");

    // Failed runs keep their checkpoints for resume.
    let checkpoints = CheckpointManager::new(project.root()).expect("manager");
    let newest = checkpoints
        .detect_resumable_checkpoint()
        .expect("detect")
        .expect("checkpoint");
    assert_eq!(newest.checkpoint.phase, "implementation-failed");
    assert_eq!(newest.checkpoint.errors.len(), 1);
    assert!(newest.checkpoint.errors[0].starts_with("implementation: "));
}

#[test]
fn research_failure_is_continued_past_in_autonomous_mode() {
    let project = TestProject::new().expect("project");
    let model = ScriptedModel::new(vec![
        ModelResponse::failed("model tool not found"),
        ModelResponse::ok(REQUIREMENTS),
        ModelResponse::ok(PLAN),
        ModelResponse::ok("implemented"),
    ]);
    let tracker = ScriptedTracker::new().all_closed(&["bd-2", "bd-3"]);
    let tests = ScriptedTestRunner::always(TestOutcome::passed("ok"));
    let phases = StandardPhases::new(&model, &tracker, &tests);

    let run = Pipeline::new(
        project.root(),
        project.config().clone(),
        AutonomyMode::Autonomous,
        &phases,
        &AutoDecider,
    )
    .expect("pipeline")
    .with_goal("Add a markdown parser")
    .run()
    .expect("run");

    assert_eq!(run.failed_phases(), vec![Phase::Research]);
    assert_eq!(run.state.status(Phase::Implementation), PhaseStatus::Completed);
    let prompts = model.prompts();
    assert!(!prompts[1].contains("### Research"));
    model.assert_drained();
}
