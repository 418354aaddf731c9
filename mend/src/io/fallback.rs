//! Persisted model-fallback state (`.mend/state/model_fallback.json`).
//!
//! Maps an agent identity (`provider:role`) to the model currently in use
//! after rate-limit downgrades. Read once at session start, rewritten
//! atomically on every downgrade before the retry it informs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::types::AgentIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackConfig {
    path: PathBuf,
    models: BTreeMap<String, String>,
}

impl FallbackConfig {
    /// Load state from `path`; a missing file means no downgrades yet.
    pub fn load(path: &Path) -> Result<Self> {
        let models = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read fallback state {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse fallback state {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = models.len(), "fallback state loaded");
        Ok(Self {
            path: path.to_path_buf(),
            models,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Model currently active for `id`, if it was ever downgraded.
    pub fn current_model(&self, id: &AgentIdentity) -> Option<&str> {
        self.models.get(&id.to_string()).map(String::as_str)
    }

    /// Record a downgrade and persist it before returning.
    pub fn record(&mut self, id: &AgentIdentity, model: &str) -> Result<()> {
        info!(agent = %id, model, "persisting model downgrade");
        self.models.insert(id.to_string(), model.to_string());
        let mut buf = serde_json::to_string_pretty(&self.models)?;
        buf.push('\n');
        super::write_atomic(&self.path, &buf)
    }
}
