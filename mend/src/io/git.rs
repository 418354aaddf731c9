//! Git adapter for completion detection.
//!
//! Repairs are verified by observing the repository head before and after an
//! agent run, so we keep a small, explicit wrapper around `git` subprocess
//! calls.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
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

    /// True if `workdir` is inside a git work tree.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
            .unwrap_or(false)
    }

    /// Full HEAD sha, or `None` when there is no repository or no commit yet.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn head_sha(&self) -> Result<Option<String>> {
        if !self.is_repository() {
            debug!("not a git repository");
            return Ok(None);
        }
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.status.success() {
            debug!("repository has no commits yet");
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&out.stdout).trim().to_string();
        debug!(head = %sha, "resolved HEAD");
        Ok(Some(sha))
    }

    /// Stage all changes (respects .gitignore). Only fixtures commit; agents
    /// make their own commits.
    #[cfg(any(test, feature = "test-support"))]
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[cfg(any(test, feature = "test-support"))]
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        let staged = self.run(&["diff", "--cached", "--name-only"])?;
        if String::from_utf8_lossy(&staged.stdout).trim().is_empty() {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    #[cfg(any(test, feature = "test-support"))]
    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
