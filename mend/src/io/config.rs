//! Repair configuration stored under `.mend/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::priority::Depth;
use crate::core::provider::Provider;

/// Repair configuration (TOML).
///
/// Edited by humans; every field has a default so a missing file or a partial
/// file both load. CLI flags override these per invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MendConfig {
    /// Agent CLI used for repairs.
    pub provider: Provider,

    /// Maximum number of agents running at once.
    pub parallel: usize,

    /// Issue types eligible for repair.
    pub depth: Depth,

    /// Hard wall-clock limit per agent run, in seconds.
    pub agent_timeout_secs: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Ask the provider to resume its previous session on the first attempt.
    pub continue_session: bool,

    /// Provider-native tool allowlist passed through verbatim.
    pub allowed_tools: Option<String>,

    pub fallback: FallbackSettings,
    pub report: ReportSettings,
    pub health: HealthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FallbackSettings {
    /// Model downgrade chain, best first.
    pub models: Vec<String>,
    /// Runs allowed per request when rate limited (including the first).
    pub max_attempts: u32,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            models: vec![
                "gemini-3-flash-preview".to_string(),
                "gemini-2.5-flash".to_string(),
                "gemini-2.5-flash-lite".to_string(),
            ],
            max_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportSettings {
    /// Ask an agent for a narrative report before falling back to the template.
    pub narrative: bool,
    pub narrative_timeout_secs: u64,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            narrative: true,
            narrative_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSettings {
    /// Discovery command printing the doctor JSON on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            command: vec![
                "ngram".to_string(),
                "doctor".to_string(),
                "--format".to_string(),
                "json".to_string(),
            ],
            timeout_secs: 300,
        }
    }
}

impl Default for MendConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Claude,
            parallel: 5,
            depth: Depth::Docs,
            agent_timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
            continue_session: true,
            allowed_tools: None,
            fallback: FallbackSettings::default(),
            report: ReportSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

impl MendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(anyhow!("parallel must be > 0"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.fallback.max_attempts == 0 {
            return Err(anyhow!("fallback.max_attempts must be > 0"));
        }
        if self.fallback.models.iter().any(|m| m.trim().is_empty()) {
            return Err(anyhow!("fallback.models must not contain empty names"));
        }
        if self.report.narrative_timeout_secs == 0 {
            return Err(anyhow!("report.narrative_timeout_secs must be > 0"));
        }
        if self.health.command.is_empty() || self.health.command[0].trim().is_empty() {
            return Err(anyhow!("health.command must be a non-empty array"));
        }
        if self.health.timeout_secs == 0 {
            return Err(anyhow!("health.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MendConfig::default()`.
pub fn load_config(path: &Path) -> Result<MendConfig> {
    if !path.exists() {
        let cfg = MendConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MendConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MendConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
