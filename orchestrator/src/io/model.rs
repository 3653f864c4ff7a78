//! Model tool abstraction.
//!
//! The [`ModelTool`] trait decouples phases and the implementation loop from the
//! actual model backend. Tests use scripted tools that return canned responses
//! without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::io::config::ModelConfig;
use crate::io::process::{RunOptions, run_command};

/// Parameters for one model invocation.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub streaming: bool,
    /// Where streamed stdout is teed when `streaming` is set.
    pub stream_path: Option<PathBuf>,
    pub cancel: CancelToken,
}

/// Outcome of a model invocation. A failed call is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl ModelResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
        }
    }
}

pub trait ModelTool {
    fn invoke(&self, request: &ModelRequest) -> ModelResponse;
}

/// Model tool that spawns a configured command and writes the prompt to its stdin.
#[derive(Debug, Clone)]
pub struct CommandModelTool {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandModelTool {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &ModelConfig) -> Self {
        Self::new(cfg.command.clone(), cfg.output_limit_bytes)
    }
}

impl ModelTool for CommandModelTool {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), streaming = request.streaming))]
    fn invoke(&self, request: &ModelRequest) -> ModelResponse {
        let Some((program, args)) = self.command.split_first() else {
            return ModelResponse::failed("model command is empty");
        };
        info!(program = %program, workdir = %request.workdir.display(), "invoking model tool");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        let stream_path = request
            .stream_path
            .as_deref()
            .filter(|_| request.streaming);
        let opts = RunOptions::new(request.timeout, self.output_limit_bytes)
            .stdin(request.prompt.as_bytes())
            .stream_to(stream_path)
            .cancel(request.cancel.clone());

        let output = match run_command(cmd, opts) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "model tool could not run");
                return ModelResponse::failed(format!("{program}: {err:#}"));
            }
        };

        if output.success() {
            debug!(stdout_bytes = output.stdout.len(), "model tool finished");
            return ModelResponse::ok(output.stdout_lossy());
        }

        let reason = output.failure_reason();
        warn!(reason = %reason, "model tool failed");
        let stderr = output.stderr_lossy();
        ModelResponse {
            success: false,
            output: output.stdout_lossy(),
            error: if stderr.trim().is_empty() {
                format!("{program} {reason}")
            } else {
                format!("{program} {reason}: {}", stderr.trim())
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path, prompt: &str) -> ModelRequest {
        ModelRequest {
            prompt: prompt.to_string(),
            workdir: dir.to_path_buf(),
            timeout: Duration::from_secs(10),
            streaming: true,
            stream_path: Some(dir.join("model.stream.log")),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn prompt_goes_to_stdin_and_output_is_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tool = CommandModelTool::new(vec!["cat".to_string()], 1024);
        let response = tool.invoke(&request(temp.path(), "write the parser\n"));
        assert!(response.success, "{response:?}");
        assert_eq!(response.output, "write the parser\n");
        let streamed =
            std::fs::read_to_string(temp.path().join("model.stream.log")).expect("stream");
        assert_eq!(streamed, "write the parser\n");
    }

    #[test]
    fn non_zero_exit_is_a_failed_response() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tool = CommandModelTool::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo rate limited >&2; exit 3".to_string(),
            ],
            1024,
        );
        let response = tool.invoke(&request(temp.path(), ""));
        assert!(!response.success);
        assert!(response.error.contains("exit code 3"), "{}", response.error);
        assert!(response.error.contains("rate limited"));
    }

    #[test]
    fn missing_binary_is_a_failed_response() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tool = CommandModelTool::new(vec!["no-such-model-cli-xyz".to_string()], 1024);
        let response = tool.invoke(&request(temp.path(), "hi"));
        assert!(!response.success);
        assert!(response.error.starts_with("no-such-model-cli-xyz"));
    }
}
