//! Git inspection for checkpoint metadata.
//!
//! Lookups degrade to empty values; a missing repo or binary never fails the caller.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Full HEAD sha, or an empty string when it cannot be determined.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn rev_parse_head(&self) -> String {
        match self.run_capture(&["rev-parse", "HEAD"]) {
            Ok(out) => {
                let sha = out.trim();
                if is_full_sha(sha) {
                    sha.to_string()
                } else {
                    debug!(output = %sha, "unexpected rev-parse output");
                    String::new()
                }
            }
            Err(err) => {
                debug!(err = %err, "git rev-parse HEAD unavailable");
                String::new()
            }
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// 40 lowercase or uppercase hex characters.
pub fn is_full_sha(text: &str) -> bool {
    text.len() == 40 && text.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_sha_shape() {
        assert!(is_full_sha(&"a1".repeat(20)));
        assert!(!is_full_sha("abc123"));
        assert!(!is_full_sha(&"z".repeat(40)));
    }

    #[test]
    fn outside_a_repo_yields_empty_sha() {
        let dir = tempfile::tempdir().expect("tempdir");
        let git = Git::new(dir.path().join("missing"));
        assert_eq!(git.rev_parse_head(), "");
    }
}
