//! Stop, crash and resume through checkpoints written by a real run.

use orchestrator::core::types::{AutonomyMode, Phase, PhaseStatus};
use orchestrator::io::checkpoint::CheckpointManager;
use orchestrator::io::model::ModelResponse;
use orchestrator::io::test_runner::TestOutcome;
use orchestrator::phases::StandardPhases;
use orchestrator::pipeline::{PauseDecision, Pipeline, PipelineOutcome};
use orchestrator::test_support::{
    ScriptedDecider, ScriptedModel, ScriptedTestRunner, ScriptedTracker, TestProject,
};

const RESEARCH: &str = "# Findings\nConfig is loaded in src/settings.rs.\n";
const REQUIREMENTS: &str = "1. Reload settings on SIGHUP\n";
const PLAN: &str = "# Reload plan\n\n## Signal handler\n\n- failing test: reload on hup\n";

#[test]
fn interrupted_phase_runs_again_with_restored_context() {
    let project = TestProject::new().expect("project");
    let tracker = ScriptedTracker::new();
    let tests = ScriptedTestRunner::always(TestOutcome::passed("ok"));

    // First session: the operator stops after decomposition.
    let first_model = ScriptedModel::new(vec![
        ModelResponse::ok(RESEARCH),
        ModelResponse::ok(REQUIREMENTS),
    ]);
    let first_phases = StandardPhases::new(&first_model, &tracker, &tests);
    let first_decider =
        ScriptedDecider::new(Vec::new(), vec![PauseDecision::Proceed, PauseDecision::Stop]);
    let stopped = Pipeline::new(
        project.root(),
        project.config().clone(),
        AutonomyMode::Checkpoint,
        &first_phases,
        &first_decider,
    )
    .expect("pipeline")
    .with_goal("Reload settings without restarting")
    .run()
    .expect("first run");
    assert_eq!(
        stopped.outcome,
        PipelineOutcome::Paused {
            next_phase: Phase::TddPlanning
        }
    );
    first_decider.assert_drained();
    let old_max = stopped.state.max_entry_id().expect("entries tracked");

    // A second session starts planning and dies before recording the outcome.
    let mut crashed = stopped.state.clone();
    crashed.start_phase(Phase::TddPlanning).expect("start");
    CheckpointManager::new(project.root())
        .expect("manager")
        .write_checkpoint(&crashed, "tdd_planning-in_progress", &[])
        .expect("crash checkpoint");

    let resume_model = ScriptedModel::new(vec![ModelResponse::ok(PLAN)]);
    let resume_phases = StandardPhases::new(&resume_model, &tracker, &tests);
    let resume_decider = ScriptedDecider::new(Vec::new(), vec![PauseDecision::Stop]);
    let resumed = Pipeline::new(
        project.root(),
        project.config().clone(),
        AutonomyMode::Checkpoint,
        &resume_phases,
        &resume_decider,
    )
    .expect("pipeline")
    .resume_from_checkpoint(None, None)
    .expect("resume");

    assert_eq!(
        resumed.outcome,
        PipelineOutcome::Paused {
            next_phase: Phase::MultiDoc
        }
    );
    assert_eq!(resumed.state.status(Phase::Research), PhaseStatus::Completed);
    assert_eq!(resumed.state.status(Phase::TddPlanning), PhaseStatus::Completed);
    assert_eq!(resume_decider.pause_calls(), vec![Phase::TddPlanning]);

    let prompts = resume_model.prompts();
    assert_eq!(prompts.len(), 1, "completed phases are not repeated");
    assert!(prompts[0].contains("Reload settings on SIGHUP"));
    assert!(prompts[0].contains("Reload settings without restarting"), "saved goal reused");

    // Restored artifacts get fresh ids above everything the checkpoint recorded.
    let restored = resumed.state.entries_for(Phase::Research);
    assert!(restored.iter().any(|id| *id > old_max), "{restored:?}");
    resume_model.assert_drained();
}

#[test]
fn resume_from_explicit_checkpoint_runs_requested_phase() {
    let project = TestProject::new().expect("project");
    let tracker = ScriptedTracker::new();
    let tests = ScriptedTestRunner::always(TestOutcome::passed("ok"));

    let first_model = ScriptedModel::new(vec![ModelResponse::ok(RESEARCH)]);
    let first_phases = StandardPhases::new(&first_model, &tracker, &tests);
    let first_decider = ScriptedDecider::new(Vec::new(), vec![PauseDecision::Stop]);
    let stopped = Pipeline::new(
        project.root(),
        project.config().clone(),
        AutonomyMode::Checkpoint,
        &first_phases,
        &first_decider,
    )
    .expect("pipeline")
    .with_goal("Reload settings without restarting")
    .run()
    .expect("first run");
    assert_eq!(
        stopped.outcome,
        PipelineOutcome::Paused {
            next_phase: Phase::Decomposition
        }
    );

    let newest = CheckpointManager::new(project.root())
        .expect("manager")
        .detect_resumable_checkpoint()
        .expect("detect")
        .expect("checkpoint");
    assert_eq!(newest.checkpoint.phase, "research-completed");

    // Skip decomposition and plan straight from the research findings.
    let resume_model = ScriptedModel::new(vec![ModelResponse::ok(PLAN)]);
    let resume_phases = StandardPhases::new(&resume_model, &tracker, &tests);
    let resume_decider = ScriptedDecider::new(Vec::new(), vec![PauseDecision::Stop]);
    let resumed = Pipeline::new(
        project.root(),
        project.config().clone(),
        AutonomyMode::Checkpoint,
        &resume_phases,
        &resume_decider,
    )
    .expect("pipeline")
    .resume_from_checkpoint(Some(&newest.file_path), Some(Phase::TddPlanning))
    .expect("resume");

    assert_eq!(resumed.state.status(Phase::TddPlanning), PhaseStatus::Completed);
    assert_eq!(resumed.state.status(Phase::Decomposition), PhaseStatus::Pending);
    assert_eq!(
        resumed.outcome,
        PipelineOutcome::Paused {
            next_phase: Phase::Decomposition
        }
    );
    // Only the restored research summary reaches the planning prompt.
    let prompt = &resume_model.prompts()[0];
    assert!(prompt.contains("research.md: Findings"), "{prompt}");
    assert!(!prompt.contains("### Requirements"));
}
