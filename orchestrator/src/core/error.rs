//! Typed invariant violations.
//!
//! Expected runtime failures (tool errors, failing tests) are values, not errors.
//! The types here signal misuse of the core and are surfaced through `anyhow`
//! at orchestration seams, where callers can `downcast_ref` them.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::{Phase, PhaseStatus};
use crate::cwa::EntryId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("illegal transition for phase {phase}: {from} -> {to}")]
    IllegalTransition {
        phase: Phase,
        from: PhaseStatus,
        to: PhaseStatus,
    },
    #[error("result for phase {result} stored under phase {phase}")]
    PhaseMismatch { phase: Phase, result: Phase },
    #[error("artifact path for phase {phase} must be absolute: {}", path.display())]
    RelativeArtifact { phase: Phase, path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context entry {0} not found")]
    NotFound(EntryId),
    #[error("context entry {0} already exists")]
    DuplicateId(EntryId),
    #[error("context entry from '{source_name}' has neither summary nor content")]
    EmptySummary { source_name: String },
    #[error("implementation context requested {requested} entries (max {max})")]
    Bounds { requested: usize, max: usize },
    #[error("task '{task}' requires {required} entries, more than the batch limit of {max}")]
    BatchTooLarge {
        task: String,
        required: usize,
        max: usize,
    },
}
