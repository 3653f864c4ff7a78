//! Pipeline configuration stored under `.pipeline/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Pipeline configuration (TOML).
///
/// Every section is optional; missing fields take the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub tests: TestsConfig,
    pub tracker: TrackerConfig,
    pub implementation: ImplementationConfig,
    pub pipeline: PipelineSection,
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Argv of the model tool; the prompt is written to its stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Tee stdout to `model.stream.log` while the tool runs.
    pub streaming: bool,
    /// Rendered prompts are trimmed to this many bytes.
    pub prompt_budget_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            timeout_secs: 3600,
            output_limit_bytes: 1_000_000,
            streaming: true,
            prompt_budget_bytes: 400_000,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    pub primary: Vec<String>,
    /// Tried only when the primary binary does not exist.
    pub fallback: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            primary: vec!["make".to_string(), "test".to_string()],
            fallback: vec!["cargo".to_string(), "test".to_string()],
            timeout_secs: 1800,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    pub command: String,
    pub query_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: "bd".to_string(),
            query_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImplementationConfig {
    pub max_iterations: u32,
    /// Pause after each model call so its side effects settle.
    pub settle_interval_secs: u64,
    /// Write a checkpoint every N loop iterations.
    pub checkpoint_every: u32,
}

impl Default for ImplementationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            settle_interval_secs: 10,
            checkpoint_every: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineSection {
    pub max_phase_attempts: u32,
    pub keep_checkpoints_on_success: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_phase_attempts: 3,
            keep_checkpoints_on_success: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Hard ceiling for one implementation context.
    pub max_entries: usize,
    /// Ttl given to phase artifacts; 0 means they never expire.
    pub default_ttl: u32,
    /// Entries at or below this ttl are compressed after each phase.
    pub compress_threshold: u32,
    pub command_result_ttl: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            default_ttl: 20,
            compress_threshold: 2,
            command_result_ttl: 5,
        }
    }
}

impl ContextConfig {
    pub fn artifact_ttl(&self) -> Option<u32> {
        (self.default_ttl > 0).then_some(self.default_ttl)
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        validate_command("model.command", &self.model.command)?;
        validate_command("tests.primary", &self.tests.primary)?;
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.output_limit_bytes == 0 {
            return Err(anyhow!("model.output_limit_bytes must be > 0"));
        }
        if self.model.prompt_budget_bytes == 0 {
            return Err(anyhow!("model.prompt_budget_bytes must be > 0"));
        }
        if self.tests.timeout_secs == 0 {
            return Err(anyhow!("tests.timeout_secs must be > 0"));
        }
        if self.tests.output_limit_bytes == 0 {
            return Err(anyhow!("tests.output_limit_bytes must be > 0"));
        }
        if self.tracker.command.trim().is_empty() {
            return Err(anyhow!("tracker.command must be non-empty"));
        }
        if self.tracker.query_timeout_secs == 0 {
            return Err(anyhow!("tracker.query_timeout_secs must be > 0"));
        }
        if self.implementation.max_iterations == 0 {
            return Err(anyhow!("implementation.max_iterations must be > 0"));
        }
        if self.implementation.checkpoint_every == 0 {
            return Err(anyhow!("implementation.checkpoint_every must be > 0"));
        }
        if self.pipeline.max_phase_attempts == 0 {
            return Err(anyhow!("pipeline.max_phase_attempts must be > 0"));
        }
        if self.context.max_entries == 0 {
            return Err(anyhow!("context.max_entries must be > 0"));
        }
        Ok(())
    }
}

fn validate_command(name: &str, command: &[String]) -> Result<()> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(anyhow!("{name} must be a non-empty array")),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.implementation.max_iterations, 100);
        assert_eq!(cfg.model.timeout_secs, 3600);
        assert_eq!(cfg.context.max_entries, 200);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".pipeline/config.toml");
        let mut cfg = PipelineConfig::default();
        cfg.implementation.settle_interval_secs = 0;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    /// Partial files only override what they name.
    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[tests]\nprimary = [\"just\", \"test\"]\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.tests.primary, vec!["just", "test"]);
        assert_eq!(cfg.tests.fallback, vec!["cargo", "test"]);
        assert_eq!(cfg.tracker.command, "bd");
    }

    #[test]
    fn rejects_empty_model_command() {
        let mut cfg = PipelineConfig::default();
        cfg.model.command.clear();
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("model.command"));
    }
}
