//! Agent prompt rendering.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::{Instructions, Issue};

const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Relative to the project root.
pub const LEARNINGS_PATH: &str = ".mend/views/GLOBAL_LEARNINGS.md";

/// Learnings shorter than this are treated as an empty scaffold.
const MIN_LEARNINGS_LINES: usize = 10;

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("repair", REPAIR_TEMPLATE)
            .context("load repair template")?;
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system template")?;
        Ok(Self { env })
    }

    /// Task prompt for one issue; `instructions.prompt` is embedded verbatim.
    pub fn render_repair(&self, issue: &Issue, instructions: &Instructions) -> Result<String> {
        let template = self.env.get_template("repair")?;
        let rendered = template.render(context! {
            issue_type => issue.canonical_type(),
            severity => issue.severity.as_str(),
            path => issue.path.as_str(),
            view => instructions.view.as_str(),
            docs => instructions.docs_to_read.as_slice(),
            prompt => instructions.prompt.trim(),
        })?;
        Ok(rendered)
    }

    /// System prompt, with the project's global learnings appended when present.
    pub fn render_system(&self, project_root: &Path) -> Result<String> {
        let learnings = load_learnings(project_root)?;
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            learnings => learnings.as_deref().map(str::trim),
        })?;
        Ok(rendered)
    }
}

fn load_learnings(project_root: &Path) -> Result<Option<String>> {
    let path = project_root.join(LEARNINGS_PATH);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let has_section = content.lines().any(|l| l.trim_end() == "## Learnings");
    if has_section && content.lines().count() > MIN_LEARNINGS_LINES {
        debug!(path = %path.display(), "appending global learnings");
        Ok(Some(content))
    } else {
        Ok(None)
    }
}
