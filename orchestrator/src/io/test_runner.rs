//! Test runner adapter.
//!
//! A primary command is tried first. The fallback runs only when the primary binary
//! does not exist; a primary that runs and fails is a real failure.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::io::config::TestsConfig;
use crate::io::process::{CommandOutput, RunOptions, is_command_not_found, run_command};

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub passed: bool,
    pub output: String,
    /// Command line that produced the outcome, if any ran.
    pub command: Option<String>,
}

impl TestOutcome {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
            command: None,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
            command: None,
        }
    }
}

pub const NO_TEST_COMMAND_NOTE: &str = "no test command available; treating tests as passed";

pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> TestOutcome;
}

#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    primary: Vec<String>,
    fallback: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandTestRunner {
    pub fn new(primary: Vec<String>, fallback: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            primary,
            fallback,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &TestsConfig) -> Self {
        Self::new(
            cfg.primary.clone(),
            cfg.fallback.clone(),
            cfg.output_limit_bytes,
        )
    }

    fn spawn(&self, argv: &[String], request: &TestRequest) -> Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("test command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let opts = RunOptions::new(request.timeout, self.output_limit_bytes)
            .cancel(request.cancel.clone());
        run_command(cmd, opts)
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(workdir = %request.workdir.display()))]
    fn run(&self, request: &TestRequest) -> TestOutcome {
        let candidates = [&self.primary, &self.fallback];
        for argv in candidates.into_iter().filter(|argv| !argv.is_empty()) {
            let command_line = argv.join(" ");
            match self.spawn(argv, request) {
                Ok(output) => {
                    let passed = output.success();
                    info!(command = %command_line, passed, "test command finished");
                    let mut text = format_output(&output);
                    if !passed {
                        text.push_str(&format!("\n[{command_line}: {}]\n", output.failure_reason()));
                    }
                    return TestOutcome {
                        passed,
                        output: text,
                        command: Some(command_line),
                    };
                }
                Err(err) if is_command_not_found(&err) => {
                    debug!(command = %command_line, "test command not found, trying next");
                }
                Err(err) => {
                    warn!(command = %command_line, err = %format!("{err:#}"), "test command could not run");
                    return TestOutcome {
                        passed: false,
                        output: format!("{command_line}: {err:#}"),
                        command: Some(command_line),
                    };
                }
            }
        }
        info!(note = NO_TEST_COMMAND_NOTE, "no test command found");
        TestOutcome::passed(NO_TEST_COMMAND_NOTE)
    }
}

fn format_output(output: &CommandOutput) -> String {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_lossy());
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_lossy());
    buf
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn request(dir: &std::path::Path) -> TestRequest {
        TestRequest {
            workdir: dir.to_path_buf(),
            timeout: Duration::from_secs(10),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn missing_primary_falls_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(
            argv(&["no-such-test-binary-xyz"]),
            argv(&["sh", "-c", "echo fallback ran"]),
            4096,
        );
        let outcome = runner.run(&request(temp.path()));
        assert!(outcome.passed);
        assert!(outcome.output.contains("fallback ran"));
        assert_eq!(outcome.command.as_deref(), Some("sh -c echo fallback ran"));
    }

    #[test]
    fn failing_primary_does_not_fall_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(
            argv(&["sh", "-c", "echo 1 failed; exit 1"]),
            argv(&["sh", "-c", "echo fallback ran"]),
            4096,
        );
        let outcome = runner.run(&request(temp.path()));
        assert!(!outcome.passed);
        assert!(outcome.output.contains("1 failed"));
        assert!(!outcome.output.contains("fallback ran"));
        assert!(outcome.output.contains("exit code 1"));
    }

    #[test]
    fn no_command_at_all_passes_with_note() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(
            argv(&["no-such-test-binary-xyz"]),
            argv(&["also-missing-test-binary-xyz"]),
            4096,
        );
        let outcome = runner.run(&request(temp.path()));
        assert!(outcome.passed);
        assert_eq!(outcome.output, NO_TEST_COMMAND_NOTE);
        assert!(outcome.command.is_none());
    }

    #[test]
    fn timeout_is_a_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(argv(&["sleep", "5"]), Vec::new(), 4096);
        let mut req = request(temp.path());
        req.timeout = Duration::from_millis(200);
        let outcome = runner.run(&req);
        assert!(!outcome.passed);
        assert!(outcome.output.contains("timed out"));
    }
}
