//! I/O helpers for the repair orchestrator.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod config;
pub mod console;
pub mod fallback;
pub mod git;
pub mod health;
pub mod process;
pub mod prompt;
pub mod session_dir;

/// Write `contents` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}
