//! Health snapshots from the external discovery step.
//!
//! Discovery prints a "doctor" JSON document: a score, per-severity counts,
//! and the issues themselves (a flat list, or grouped by severity). The
//! document is validated against a bundled schema before decoding so a
//! drifting producer fails loudly instead of yielding an empty backlog.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use jsonschema::Draft;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::core::provider::ProviderCommand;
use crate::core::types::{HealthSnapshot, Issue};
use crate::io::process::{ProcessLimits, run_streaming};

const DOCTOR_SCHEMA: &str = include_str!("schemas/doctor_report.schema.json");

/// Output limit for the discovery command; its JSON lists every issue.
const DOCTOR_OUTPUT_LIMIT: usize = 16 * 1024 * 1024;

/// Decoded doctor output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DoctorReport {
    pub snapshot: HealthSnapshot,
    /// Discovery order; grouped input is flattened critical, warning, info.
    pub issues: Vec<Issue>,
}

#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn check(&self) -> Result<DoctorReport>;
}

/// Runs the configured discovery command and parses its stdout.
#[derive(Debug, Clone)]
pub struct CommandHealthSource {
    argv: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CommandHealthSource {
    pub fn new(argv: Vec<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            argv,
            cwd: cwd.into(),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl HealthSource for CommandHealthSource {
    #[instrument(skip_all, fields(command = %self.argv.join(" ")))]
    async fn check(&self) -> Result<DoctorReport> {
        let cmd = ProviderCommand {
            argv: self.argv.clone(),
            stdin: None,
        };
        let limits = ProcessLimits {
            timeout: self.timeout,
            output_limit_bytes: DOCTOR_OUTPUT_LIMIT,
        };
        let out = run_streaming(&cmd, &self.cwd, limits, &self.cancel, None, &mut |_| {}).await?;
        if out.timed_out {
            bail!("health command timed out after {}s", self.timeout.as_secs());
        }
        if out.cancelled {
            bail!("health command cancelled");
        }
        if out.exit_code != Some(0) {
            // Discovery commonly exits non-zero when it finds critical issues.
            debug!(exit_code = ?out.exit_code, "health command exited non-zero");
        }
        parse_doctor_report(&out.stdout).with_context(|| {
            format!(
                "parse health command output (exit code {:?}): {}",
                out.exit_code,
                out.stderr.trim()
            )
        })
    }
}

/// Reads a previously captured doctor JSON document.
#[derive(Debug, Clone)]
pub struct FileHealthSource {
    path: PathBuf,
}

impl FileHealthSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HealthSource for FileHealthSource {
    async fn check(&self) -> Result<DoctorReport> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        parse_doctor_report(&contents).with_context(|| format!("parse {}", self.path.display()))
    }
}

#[derive(Deserialize)]
struct RawReport {
    score: i64,
    summary: RawSummary,
    #[serde(default)]
    issues: RawIssues,
}

#[derive(Deserialize)]
struct RawSummary {
    critical: usize,
    warning: usize,
    #[serde(default)]
    info: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIssues {
    Flat(Vec<Issue>),
    Grouped {
        #[serde(default)]
        critical: Vec<Issue>,
        #[serde(default)]
        warning: Vec<Issue>,
        #[serde(default)]
        info: Vec<Issue>,
    },
}

impl Default for RawIssues {
    fn default() -> Self {
        RawIssues::Flat(Vec::new())
    }
}

/// Validate and decode a doctor JSON document.
pub fn parse_doctor_report(json: &str) -> Result<DoctorReport> {
    let value: Value = serde_json::from_str(json.trim()).context("doctor output is not JSON")?;
    validate_doctor_schema(&value)?;
    let raw: RawReport = serde_json::from_value(value).context("decode doctor report")?;
    let issues = match raw.issues {
        RawIssues::Flat(issues) => issues,
        RawIssues::Grouped {
            critical,
            warning,
            info,
        } => critical.into_iter().chain(warning).chain(info).collect(),
    };
    let declared = raw.summary.critical + raw.summary.warning + raw.summary.info;
    if !issues.is_empty() && declared != issues.len() {
        warn!(declared, listed = issues.len(), "doctor summary disagrees with issue list");
    }
    Ok(DoctorReport {
        snapshot: HealthSnapshot {
            score: raw.score,
            critical: raw.summary.critical,
            warning: raw.summary.warning,
            info: raw.summary.info,
        },
        issues,
    })
}

fn validate_doctor_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(DOCTOR_SCHEMA).context("parse bundled doctor schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| anyhow!("compile doctor schema: {e}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("doctor report failed schema validation:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
