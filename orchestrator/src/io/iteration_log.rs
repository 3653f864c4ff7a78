//! Per-iteration artifacts under `.pipeline/iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::LoopState;
use crate::io::layout::ProjectPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationMeta {
    pub iteration: u32,
    pub state: LoopState,
    pub model_success: bool,
    pub model_error: Option<String>,
    pub closed_issues: Vec<String>,
    pub open_issues: Vec<String>,
    /// `None` when tests were not run this iteration.
    pub tests_passed: Option<bool>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub model_log_path: PathBuf,
    pub model_stream_path: PathBuf,
    pub tests_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(paths: &ProjectPaths, iteration: u32) -> Self {
        let dir = paths.iteration_dir(iteration);
        Self {
            meta_path: dir.join("meta.json"),
            model_log_path: dir.join("model.log"),
            model_stream_path: dir.join("model.stream.log"),
            tests_log_path: dir.join("tests.log"),
            dir,
        }
    }

    pub fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))
    }
}

pub struct IterationWriteRequest<'a> {
    pub paths: &'a IterationPaths,
    pub meta: &'a IterationMeta,
    pub model_log: &'a str,
    pub tests_log: Option<&'a str>,
}

pub fn write_iteration(request: &IterationWriteRequest<'_>) -> Result<()> {
    request.paths.create_dir()?;
    // Fixed order keeps partial logs predictable.
    write_json(&request.paths.meta_path, request.meta)?;
    write_text(&request.paths.model_log_path, request.model_log)?;
    if let Some(log) = request.tests_log {
        write_text(&request.paths.tests_log_path, log)?;
    }
    Ok(())
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
