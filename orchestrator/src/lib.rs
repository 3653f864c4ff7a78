//! Multi-phase delivery pipeline driven by an external model tool.
//!
//! A run moves a goal through research, decomposition, TDD planning, plan splitting,
//! issue tracker sync and an autonomous implementation loop. State is checkpointed
//! after every transition so an interrupted run resumes where it stopped.
//!
//! - **[`core`]**: Pure, deterministic logic (phase types, pipeline state and its
//!   transitions, cancellation, plan splitting). No I/O.
//! - **[`cwa`]**: The context store, an in-memory bounded working set of entries
//!   with turn-based expiry.
//! - **[`io`]**: Side-effecting operations (filesystem, git, child processes,
//!   checkpoints, collaborators). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`phases`], [`pipeline`], [`implementation`]) combine core
//! logic with I/O to implement the CLI commands.

pub mod core;
pub mod cwa;
pub mod exit_codes;
pub mod implementation;
pub mod io;
pub mod logging;
pub mod phases;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
