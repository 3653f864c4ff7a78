//! Issue tracker adapter for the `bd` (beads) CLI.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::cancel::CancelToken;
use crate::io::config::TrackerConfig;
use crate::io::process::{RunOptions, run_command};

const TRACKER_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueStatus {
    pub status: String,
}

impl IssueStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }

    /// `closed` or `done`, case-insensitively.
    pub fn is_closed(&self) -> bool {
        let status = self.status.trim();
        status.eq_ignore_ascii_case("closed") || status.eq_ignore_ascii_case("done")
    }
}

pub trait IssueTracker {
    fn show(&self, issue_id: &str) -> Result<IssueStatus>;
    fn create_epic(&self, title: &str) -> Result<String>;
    fn create_issue(&self, title: &str) -> Result<String>;
    fn add_dependency(&self, issue_id: &str, depends_on_id: &str) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

/// Tracker backed by the `bd` command.
#[derive(Debug, Clone)]
pub struct BeadsTracker {
    command: String,
    workdir: PathBuf,
    timeout: Duration,
    cancel: CancelToken,
}

impl BeadsTracker {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            timeout,
            cancel: CancelToken::new(),
        }
    }

    pub fn from_config(cfg: &TrackerConfig, workdir: impl Into<PathBuf>) -> Self {
        Self::new(
            cfg.command.clone(),
            workdir,
            Duration::from_secs(cfg.query_timeout_secs),
        )
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args).current_dir(&self.workdir);
        let label = format!("{} {}", self.command, args.join(" "));
        let opts = RunOptions::new(self.cancel.clamp(self.timeout), TRACKER_OUTPUT_LIMIT_BYTES)
            .cancel(self.cancel.clone());
        let output = run_command(cmd, opts).with_context(|| format!("run {label}"))?;
        if !output.success() {
            return Err(anyhow!(
                "{label} failed ({}): {}",
                output.failure_reason(),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output.stdout_lossy())
    }

    fn create(&self, title: &str, issue_type: &str) -> Result<String> {
        let stdout = self.run(&["create", title, "--type", issue_type, "--json"])?;
        let record = parse_record(&stdout).context("parse bd create output")?;
        string_field(&record, "id")
    }
}

impl IssueTracker for BeadsTracker {
    #[instrument(skip(self))]
    fn show(&self, issue_id: &str) -> Result<IssueStatus> {
        let stdout = self.run(&["show", issue_id, "--json"])?;
        let record = parse_record(&stdout).context("parse bd show output")?;
        let status = string_field(&record, "status")?;
        debug!(status = %status, "issue status");
        Ok(IssueStatus::new(status))
    }

    fn create_epic(&self, title: &str) -> Result<String> {
        self.create(title, "epic")
    }

    fn create_issue(&self, title: &str) -> Result<String> {
        self.create(title, "task")
    }

    fn add_dependency(&self, issue_id: &str, depends_on_id: &str) -> Result<()> {
        self.run(&["dep", "add", issue_id, depends_on_id])?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.run(&["sync"])?;
        Ok(())
    }
}

/// `bd --json` prints either one object or a single-element array.
fn parse_record(stdout: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(stdout.trim()).context("invalid json")?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Array(items) => items
            .into_iter()
            .next()
            .filter(Value::is_object)
            .ok_or_else(|| anyhow!("expected a non-empty array of objects")),
        other => Err(anyhow!("expected a json object, got {other}")),
    }
}

fn string_field(record: &Value, field: &str) -> Result<String> {
    record
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing string field '{field}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_status_is_case_insensitive() {
        assert!(IssueStatus::new("CLOSED").is_closed());
        assert!(IssueStatus::new("Done").is_closed());
        assert!(IssueStatus::new(" closed\n").is_closed());
        assert!(!IssueStatus::new("open").is_closed());
        assert!(!IssueStatus::new("in_progress").is_closed());
    }

    #[test]
    fn parses_object_and_single_element_array() {
        let obj = parse_record("{\"id\":\"bd-1\",\"status\":\"open\"}\n").expect("object");
        assert_eq!(string_field(&obj, "status").expect("status"), "open");

        let arr = parse_record("[{\"id\":\"bd-2\",\"status\":\"closed\"}]").expect("array");
        assert_eq!(string_field(&arr, "id").expect("id"), "bd-2");

        assert!(parse_record("[]").is_err());
        assert!(parse_record("\"closed\"").is_err());
    }

    #[test]
    fn missing_binary_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = BeadsTracker::new("no-such-bd-binary-xyz", temp.path(), Duration::from_secs(1));
        assert!(tracker.show("bd-1").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn show_reads_status_from_fake_cli() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("bd");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '[{\"id\":\"'\"$2\"'\",\"status\":\"Done\"}]'\n",
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let tracker = BeadsTracker::new(
            script.to_string_lossy().into_owned(),
            temp.path(),
            Duration::from_secs(5),
        );
        let status = tracker.show("bd-7").expect("show");
        assert!(status.is_closed());
    }
}
