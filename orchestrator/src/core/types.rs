//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components and the on-disk
//! checkpoint format. They must not depend on external state or I/O.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::StateError;

/// The six pipeline phases, in canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Decomposition,
    TddPlanning,
    MultiDoc,
    BeadsSync,
    Implementation,
}

impl Phase {
    /// Every phase in canonical order.
    pub const ALL: [Phase; 6] = [
        Phase::Research,
        Phase::Decomposition,
        Phase::TddPlanning,
        Phase::MultiDoc,
        Phase::BeadsSync,
        Phase::Implementation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Decomposition => "decomposition",
            Phase::TddPlanning => "tdd_planning",
            Phase::MultiDoc => "multi_doc",
            Phase::BeadsSync => "beads_sync",
            Phase::Implementation => "implementation",
        }
    }

    /// Position in [`Phase::ALL`].
    pub fn index(self) -> usize {
        match self {
            Phase::Research => 0,
            Phase::Decomposition => 1,
            Phase::TddPlanning => 2,
            Phase::MultiDoc => 3,
            Phase::BeadsSync => 4,
            Phase::Implementation => 5,
        }
    }

    /// Batch-mode group this phase belongs to (0-based).
    pub fn group(self) -> usize {
        match self {
            Phase::Research | Phase::Decomposition => 0,
            Phase::TddPlanning | Phase::MultiDoc => 1,
            Phase::BeadsSync | Phase::Implementation => 2,
        }
    }

    /// True when this phase is the last one of its batch group.
    pub fn ends_group(self) -> bool {
        matches!(
            self,
            Phase::Decomposition | Phase::MultiDoc | Phase::Implementation
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == normalized || phase.as_str().replace('_', "") == normalized)
            .ok_or_else(|| format!("unknown phase '{s}'"))
    }
}

/// Lifecycle status of a single phase.
///
/// Legal transitions: `Pending -> InProgress`, `InProgress -> Completed | Failed`,
/// `Failed -> InProgress` (explicit retry). Everything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: PhaseStatus) -> bool {
        matches!(
            (self, next),
            (PhaseStatus::Pending, PhaseStatus::InProgress)
                | (PhaseStatus::InProgress, PhaseStatus::Completed)
                | (PhaseStatus::InProgress, PhaseStatus::Failed)
                | (PhaseStatus::Failed, PhaseStatus::InProgress)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Failed)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pause policy selected once per pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyMode {
    /// Pause after every phase.
    #[default]
    Checkpoint,
    /// Pause between phase groups.
    Batch,
    /// Never pause; failed phases are continued past without prompting.
    Autonomous,
}

impl AutonomyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AutonomyMode::Checkpoint => "checkpoint",
            AutonomyMode::Batch => "batch",
            AutonomyMode::Autonomous => "autonomous",
        }
    }

    /// Whether the operator is consulted after `phase` finishes.
    pub fn pauses_after(self, phase: Phase) -> bool {
        match self {
            AutonomyMode::Checkpoint => true,
            AutonomyMode::Batch => phase.ends_group(),
            AutonomyMode::Autonomous => false,
        }
    }

    pub fn is_interactive(self) -> bool {
        !matches!(self, AutonomyMode::Autonomous)
    }
}

impl fmt::Display for AutonomyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutonomyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checkpoint" => Ok(AutonomyMode::Checkpoint),
            "batch" => Ok(AutonomyMode::Batch),
            "autonomous" => Ok(AutonomyMode::Autonomous),
            other => Err(format!(
                "unknown autonomy mode '{other}' (expected checkpoint, batch or autonomous)"
            )),
        }
    }
}

/// Outcome of one phase execution. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Absolute paths of files produced by the phase.
    pub artifacts: Vec<PathBuf>,
}

impl PhaseResult {
    /// Build a successful result. Every artifact must be an absolute path.
    pub fn success(
        phase: Phase,
        output: Option<String>,
        artifacts: Vec<PathBuf>,
    ) -> Result<Self, StateError> {
        if let Some(relative) = artifacts.iter().find(|path| !path.is_absolute()) {
            return Err(StateError::RelativeArtifact {
                phase,
                path: relative.clone(),
            });
        }
        Ok(Self {
            phase,
            success: true,
            output,
            error: None,
            artifacts,
        })
    }

    /// Build a failed result. An empty message is replaced so `error` is never blank.
    pub fn failure(phase: Phase, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = format!("{phase} failed");
        }
        Self {
            phase,
            success: false,
            output: None,
            error: Some(error),
            artifacts: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// States of the autonomous implementation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Running,
    AwaitingIssueClosure,
    RunningTests,
    Converged,
    Exhausted,
    Failed,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Converged | LoopState::Exhausted | LoopState::Failed
        )
    }
}

/// Structured result of the implementation loop. Produced exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationResult {
    pub success: bool,
    pub error: Option<String>,
    pub iterations: u32,
    pub tests_passed: bool,
    /// External issue identifiers observed closed.
    pub phases_closed: Vec<String>,
    /// Terminal loop state.
    pub final_state: LoopState,
}
