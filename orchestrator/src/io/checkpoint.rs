//! Durable checkpoints under `<project>/.checkpoints/<uuid>.json`.
//!
//! Checkpoints are written once and never mutated. Scans skip files that fail to
//! parse or do not match the embedded schema instead of failing the whole scan.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::state::PipelineState;
use crate::core::types::{Phase, PhaseStatus};
use crate::io::git::Git;

const CHECKPOINT_SCHEMA: &str = include_str!("../../schemas/checkpoint.schema.json");

/// On-disk checkpoint document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// `{phase}-{status}` of the transition that produced this checkpoint.
    pub phase: String,
    /// RFC3339 with offset.
    pub timestamp: String,
    pub state: PipelineState,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Full HEAD sha, or empty when unavailable.
    #[serde(default)]
    pub git_commit: String,
}

/// A checkpoint together with the file it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedCheckpoint {
    pub checkpoint: Checkpoint,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenCheckpoint {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Label for a transition, e.g. `tdd_planning-completed`.
pub fn checkpoint_label(phase: Phase, status: PhaseStatus) -> String {
    format!("{}-{}", phase.as_str(), status.as_str())
}

pub struct CheckpointManager {
    dir: PathBuf,
    git: Git,
    validator: Validator,
}

impl fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Manager for `<project_root>/.checkpoints`. Nothing is created until the first write.
    pub fn new(project_root: &Path) -> Result<Self> {
        Self::with_dir(project_root.join(".checkpoints"), Git::new(project_root))
    }

    pub fn with_dir(dir: PathBuf, git: Git) -> Result<Self> {
        let schema: Value =
            serde_json::from_str(CHECKPOINT_SCHEMA).context("parse checkpoint schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile checkpoint schema")?;
        Ok(Self {
            dir,
            git,
            validator,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_checkpoint(
        &self,
        state: &PipelineState,
        phase: &str,
        errors: &[String],
    ) -> Result<WrittenCheckpoint> {
        self.write_checkpoint_at(state, phase, errors, Utc::now())
    }

    /// Serialize `state` into a new checkpoint file stamped with `timestamp`.
    ///
    /// The git commit is looked up best-effort and left empty on failure.
    #[instrument(skip_all, fields(phase = %phase))]
    pub fn write_checkpoint_at(
        &self,
        state: &PipelineState,
        phase: &str,
        errors: &[String],
        timestamp: DateTime<Utc>,
    ) -> Result<WrittenCheckpoint> {
        create_dir_0755(&self.dir)?;
        let id = Uuid::new_v4().to_string();
        let checkpoint = Checkpoint {
            id: id.clone(),
            phase: phase.to_string(),
            timestamp: timestamp.to_rfc3339(),
            state: state.clone(),
            errors: errors.to_vec(),
            git_commit: self.git.rev_parse_head(),
        };

        let mut buf = serde_json::to_string_pretty(&checkpoint).context("serialize checkpoint")?;
        buf.push('\n');
        let path = self.dir.join(format!("{id}.json"));
        write_atomic(&path, &buf)?;
        let path = std::path::absolute(&path)
            .with_context(|| format!("resolve checkpoint path {}", path.display()))?;
        debug!(checkpoint_id = %id, path = %path.display(), "checkpoint written");
        Ok(WrittenCheckpoint { id, path })
    }

    /// Newest valid checkpoint by its `timestamp` field, or `None` when there is none.
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    pub fn detect_resumable_checkpoint(&self) -> Result<Option<LocatedCheckpoint>> {
        let newest = self.list()?.into_iter().next();
        match &newest {
            Some(found) => debug!(
                checkpoint_id = %found.checkpoint.id,
                phase = %found.checkpoint.phase,
                "resumable checkpoint found"
            ),
            None => debug!("no resumable checkpoint"),
        }
        Ok(newest)
    }

    /// Every valid checkpoint, newest first. Files with unparsable timestamps are skipped.
    pub fn list(&self) -> Result<Vec<LocatedCheckpoint>> {
        let mut dated: Vec<(DateTime<Utc>, LocatedCheckpoint)> = self
            .scan()?
            .into_iter()
            .filter_map(|located| match parse_timestamp(&located.checkpoint.timestamp) {
                Some(ts) => Some((ts, located)),
                None => {
                    debug!(path = %located.file_path.display(), "skipping checkpoint with bad timestamp");
                    None
                }
            })
            .collect();
        dated.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dated.into_iter().map(|(_, located)| located).collect())
    }

    pub fn load_checkpoint(&self, path: &Path) -> Result<PipelineState> {
        Ok(self.load_checkpoint_file(path)?.checkpoint.state)
    }

    /// Read and validate one checkpoint file.
    pub fn load_checkpoint_file(&self, path: &Path) -> Result<LocatedCheckpoint> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read checkpoint {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoint {}", path.display()))?;
        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            anyhow::bail!(
                "checkpoint {} does not match schema:\n- {}",
                path.display(),
                messages.join("\n- ")
            );
        }
        let checkpoint: Checkpoint = serde_json::from_value(value)
            .with_context(|| format!("deserialize checkpoint {}", path.display()))?;
        Ok(LocatedCheckpoint {
            checkpoint,
            file_path: path.to_path_buf(),
        })
    }

    /// Best-effort removal; failures are logged and reported as `false`.
    pub fn delete_checkpoint(&self, path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "checkpoint deleted");
                true
            }
            Err(err) => {
                warn!(path = %path.display(), err = %err, "failed to delete checkpoint");
                false
            }
        }
    }

    /// Delete every checkpoint at least `days` old. Unreadable files are left alone
    /// and not counted.
    #[instrument(skip_all, fields(days))]
    pub fn cleanup_by_age(&self, days: u32) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();
        for located in self.scan()? {
            if get_checkpoint_age_days_at(&located.checkpoint, now) >= i64::from(days) {
                self.record_delete(&located.file_path, &mut report);
            }
        }
        info!(deleted = report.deleted, failed = report.failed, "checkpoints cleaned by age");
        Ok(report)
    }

    /// Delete every checkpoint file, leaving the directory in place.
    #[instrument(skip_all)]
    pub fn cleanup_all(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for path in self.checkpoint_files()? {
            self.record_delete(&path, &mut report);
        }
        info!(deleted = report.deleted, failed = report.failed, "checkpoints cleaned");
        Ok(report)
    }

    fn record_delete(&self, path: &Path, report: &mut CleanupReport) {
        if self.delete_checkpoint(path) {
            report.deleted += 1;
        } else {
            report.failed += 1;
        }
    }

    fn scan(&self) -> Result<Vec<LocatedCheckpoint>> {
        let mut found = Vec::new();
        for path in self.checkpoint_files()? {
            match self.load_checkpoint_file(&path) {
                Ok(located) => found.push(located),
                Err(err) => debug!(path = %path.display(), err = %err, "skipping checkpoint"),
            }
        }
        Ok(found)
    }

    fn checkpoint_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read checkpoint dir {}", self.dir.display()));
            }
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("read checkpoint dir entry {}", self.dir.display()))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

pub fn get_checkpoint_age_days(checkpoint: &Checkpoint) -> i64 {
    get_checkpoint_age_days_at(checkpoint, Utc::now())
}

/// Whole days between the checkpoint's timestamp and `now`; 0 when unparsable.
pub fn get_checkpoint_age_days_at(checkpoint: &Checkpoint, now: DateTime<Utc>) -> i64 {
    parse_timestamp(&checkpoint.timestamp)
        .map(|ts| (now - ts).num_days().max(0))
        .unwrap_or(0)
}

/// RFC3339 (`Z` or explicit offset); an offset-less timestamp is read as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn create_dir_0755(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .create(dir)
        .with_context(|| format!("create checkpoint dir {}", dir.display()))?;
    // DirBuilder modes are filtered by the umask; set the bits explicitly.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("set mode on checkpoint dir {}", dir.display()))?;
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp checkpoint {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace checkpoint {}", path.display()))?;
    Ok(())
}
