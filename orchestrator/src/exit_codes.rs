//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; for `run`/`resume`, every phase completed.
pub const OK: i32 = 0;
/// Command failed due to invalid config, a missing checkpoint or other errors.
pub const INVALID: i32 = 1;
/// The operator stopped the pipeline at a pause point (or it was cancelled).
pub const PAUSED: i32 = 2;
/// The pipeline finished but at least one phase failed.
pub const FAILED_PHASES: i32 = 3;
/// A second interrupt arrived before the run could stop on its own.
pub const INTERRUPTED: i32 = 130;
