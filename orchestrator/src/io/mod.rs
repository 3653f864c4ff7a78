//! Side-effecting adapters: child processes, git, configuration, checkpoints and the
//! external collaborators the pipeline drives.

pub mod checkpoint;
pub mod config;
pub mod git;
pub mod iteration_log;
pub mod layout;
pub mod model;
pub mod process;
pub mod prompt;
pub mod test_runner;
pub mod tracker;
