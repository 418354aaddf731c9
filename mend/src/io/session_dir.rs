//! Per-session and per-agent working directories under `.mend/sessions/`.
//!
//! Each agent run gets its own folder so concurrent agents never collide on
//! shared files. The folder is the subprocess working directory and keeps
//! the raw stream and logs for later inspection.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::debug;

use crate::core::provider::Provider;
use crate::core::types::Issue;

pub const ISSUE_FILE: &str = "ISSUE.md";
pub const STREAM_FILE: &str = "stream.jsonl";
pub const LOG_FILE: &str = "agent.log";

/// `.mend/sessions/<session-id>/`
#[derive(Debug, Clone)]
pub struct SessionDir {
    root: PathBuf,
    id: String,
}

impl SessionDir {
    /// Create a session folder named after the current local time.
    pub fn create(state_root: &Path) -> Result<Self> {
        let id = Local::now().format("%Y%m%d-%H%M%S").to_string();
        Self::create_with_id(state_root, &id)
    }

    pub fn create_with_id(state_root: &Path, id: &str) -> Result<Self> {
        let root = state_root.join("sessions").join(id);
        fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
        debug!(session = %root.display(), "session folder ready");
        Ok(Self {
            root,
            id: id.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Create and seed the folder for the `index`-th issue of this session.
    ///
    /// Writes `ISSUE.md` and copies the provider's context file from
    /// `<project>/.mend/` or, failing that, the project root.
    pub fn seed_agent_dir(
        &self,
        index: usize,
        issue: &Issue,
        prompt: &str,
        provider: Provider,
        project_root: &Path,
    ) -> Result<AgentDir> {
        let name = format!("{:02}-{}", index + 1, slug(&issue.canonical_type()));
        let path = self.root.join(name);
        fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;

        let issue_md = render_issue(issue, prompt);
        fs::write(path.join(ISSUE_FILE), issue_md)
            .with_context(|| format!("write {}", path.join(ISSUE_FILE).display()))?;

        let context_file = provider.context_file();
        let candidates = [
            project_root.join(".mend").join(context_file),
            project_root.join(context_file),
        ];
        if let Some(source) = candidates.iter().find(|p| p.is_file()) {
            fs::copy(source, path.join(context_file))
                .with_context(|| format!("copy {}", source.display()))?;
        } else {
            debug!(context_file, "no provider context file to copy");
        }
        Ok(AgentDir { path })
    }
}

/// Working directory of one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDir {
    path: PathBuf,
}

impl AgentDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stream_path(&self) -> PathBuf {
        self.path.join(STREAM_FILE)
    }

    pub fn write_log(&self, stdout: &str, stderr: &str) -> Result<()> {
        let log = format!("=== stdout ===\n{stdout}\n=== stderr ===\n{stderr}\n");
        let path = self.path.join(LOG_FILE);
        fs::write(&path, log).with_context(|| format!("write {}", path.display()))
    }
}

fn render_issue(issue: &Issue, prompt: &str) -> String {
    let mut out = format!(
        "# {}\n\n- Severity: {}\n- Path: `{}`\n\n## Problem\n\n{}\n",
        issue.canonical_type(),
        issue.severity,
        issue.path,
        issue.message.trim()
    );
    if !issue.suggestion.trim().is_empty() {
        out.push_str(&format!("\n## Suggestion\n\n{}\n", issue.suggestion.trim()));
    }
    out.push_str(&format!("\n## Prompt\n\n{}\n", prompt.trim()));
    out
}

fn slug(issue_type: &str) -> String {
    issue_type
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}
