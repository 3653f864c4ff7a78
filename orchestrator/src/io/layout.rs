//! On-disk layout of a project managed by the pipeline.

use std::path::{Path, PathBuf};

use crate::core::types::Phase;

/// Resolved paths under a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub pipeline_dir: PathBuf,
    pub config_path: PathBuf,
    /// Goal text of the current run, kept so `resume` can re-render prompts.
    pub goal_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub plans_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: &Path) -> Self {
        let pipeline_dir = root.join(".pipeline");
        Self {
            root: root.to_path_buf(),
            config_path: pipeline_dir.join("config.toml"),
            goal_path: pipeline_dir.join("goal.md"),
            artifacts_dir: pipeline_dir.join("artifacts"),
            plans_dir: pipeline_dir.join("plans"),
            iterations_dir: pipeline_dir.join("iterations"),
            checkpoints_dir: root.join(".checkpoints"),
            pipeline_dir,
        }
    }

    /// Markdown artifact written by a prompt-driven phase.
    pub fn artifact(&self, phase: Phase) -> PathBuf {
        self.artifacts_dir.join(format!("{}.md", phase.as_str()))
    }

    /// Stream log of the model call made by a prompt-driven phase.
    pub fn phase_stream_log(&self, phase: Phase) -> PathBuf {
        self.artifacts_dir.join(format!("{}.stream.log", phase.as_str()))
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.iterations_dir.join(iteration.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_project_scoped() {
        let paths = ProjectPaths::new(Path::new("/work/app"));
        assert_eq!(paths.config_path, Path::new("/work/app/.pipeline/config.toml"));
        assert_eq!(paths.checkpoints_dir, Path::new("/work/app/.checkpoints"));
        assert_eq!(
            paths.artifact(Phase::TddPlanning),
            Path::new("/work/app/.pipeline/artifacts/tdd_planning.md")
        );
        assert_eq!(
            paths.iteration_dir(3),
            Path::new("/work/app/.pipeline/iterations/3")
        );
    }
}
