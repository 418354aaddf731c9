//! Session report generation with an optional narrative delegate.
//!
//! The narrative is best-effort: any failure, timeout, or empty answer falls
//! back to the deterministic renderer, so generating a report never fails.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::core::provider::{CommandRequest, OutputMode, Provider};
use crate::core::report::{ReportInput, header, narrative_appendix, narrative_prompt, render};
use crate::core::types::{AgentIdentity, AgentRole};
use crate::io::write_atomic;
use crate::policy::{RetryPolicy, RunTarget};

pub const REPORT_FILE: &str = "REPAIR_REPORT.md";

#[async_trait]
pub trait NarrativeWriter: Send + Sync {
    /// Short name recorded in the report header.
    fn label(&self) -> String;

    async fn write(&self, prompt: &str) -> Result<String>;
}

/// Asks the configured provider, in plain-text mode, for the narrative.
pub struct AgentNarrativeWriter {
    policy: RetryPolicy,
    provider: Provider,
    project_root: PathBuf,
    timeout: Duration,
}

impl AgentNarrativeWriter {
    pub fn new(
        policy: RetryPolicy,
        provider: Provider,
        project_root: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            policy,
            provider,
            project_root: project_root.into(),
            timeout,
        }
    }
}

#[async_trait]
impl NarrativeWriter for AgentNarrativeWriter {
    fn label(&self) -> String {
        self.provider.to_string()
    }

    #[instrument(skip_all, fields(provider = %self.provider))]
    async fn write(&self, prompt: &str) -> Result<String> {
        let request = CommandRequest {
            prompt: prompt.to_string(),
            output: OutputMode::Text,
            ..CommandRequest::default()
        };
        let target = RunTarget {
            cwd: self.project_root.clone(),
            artifacts: None,
            timeout: Some(self.timeout),
        };
        let identity = AgentIdentity::new(self.provider, AgentRole::Narrative);
        let outcome = self.policy.run(identity, &request, &target, &mut |_| {}).await?;
        let result = outcome.result;
        if !result.success {
            bail!(
                "narrative agent failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        if result.output.trim().is_empty() {
            bail!("narrative agent returned no text");
        }
        Ok(result.output)
    }
}

/// Narrative report if the delegate delivers, deterministic report otherwise.
///
/// A narrative report still ends with the decisions and failed-repairs
/// sections rendered from the results themselves.
pub async fn generate(input: &ReportInput<'_>, narrative: Option<&dyn NarrativeWriter>) -> String {
    if let Some(writer) = narrative {
        match writer.write(&narrative_prompt(input)).await {
            Ok(text) => {
                info!(by = %writer.label(), "narrative report generated");
                let mut out = header(input, Some(&writer.label()));
                out.push_str(text.trim());
                out.push_str("\n\n---\n\n");
                out.push_str(&narrative_appendix(input));
                return out;
            }
            Err(e) => warn!(err = %format!("{e:#}"), "narrative report failed, using template"),
        }
    }
    render(input)
}

/// Write the report to `.mend/state/` and, if given, the session folder.
pub fn write_report(report: &str, state_dir: &Path, session_dir: Option<&Path>) -> Result<PathBuf> {
    let primary = state_dir.join(REPORT_FILE);
    write_atomic(&primary, report)?;
    if let Some(dir) = session_dir {
        write_atomic(&dir.join(REPORT_FILE), report)?;
    }
    Ok(primary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EscalationDecision, HealthSnapshot, RepairResult};
    use crate::test_support::{StaticNarrative, issue};
    use std::fs;

    fn input<'a>(
        before: &'a HealthSnapshot,
        after: &'a HealthSnapshot,
        results: &'a [RepairResult],
    ) -> ReportInput<'a> {
        ReportInput {
            project: "demo",
            generated_at: "2026-01-01 00:00",
            before,
            after,
            results,
        }
    }

    #[tokio::test]
    async fn narrative_is_used_when_available() {
        let before = HealthSnapshot::default();
        let after = HealthSnapshot::default();
        let results = [RepairResult::synthetic(&issue("MONOLITH", "a.rs"), "", Vec::new())];
        let writer = StaticNarrative::ok("## Executive Summary\n\nAll fixed.");
        let report = generate(&input(&before, &after, &results), Some(&writer)).await;
        assert!(report.starts_with("# Repair Report"));
        assert!(report.contains("GENERATED_BY: static"));
        assert!(report.contains("All fixed."));
        assert!(report.contains("### Failed Repairs Need Attention\n\nNone.\n"));
    }

    #[tokio::test]
    async fn narrative_report_keeps_failures_and_decisions() {
        let before = HealthSnapshot::default();
        let after = HealthSnapshot::default();
        let mut decided = RepairResult::synthetic(&issue("ESCALATION", "docs/api"), "", Vec::new());
        decided.decisions_made.push(EscalationDecision {
            conflict_title: "Naming".to_string(),
            decision_text: "rename it".to_string(),
            passed: false,
        });
        let results = [
            decided,
            RepairResult::not_attempted(&issue("MONOLITH", "src/big.rs"), "No git commit detected"),
        ];
        let writer = StaticNarrative::ok("## Executive Summary\n\nSome things happened.");
        let report = generate(&input(&before, &after, &results), Some(&writer)).await;

        let (narrative, appendix) = report.split_once("Some things happened.").expect("narrative");
        assert!(narrative.contains("GENERATED_BY: static"));
        assert!(appendix.contains("## Decisions Made"));
        assert!(appendix.contains("- **Naming** (`docs/api`): rename it"));
        assert!(appendix.contains("### Failed Repairs Need Attention"));
        assert!(appendix.contains("- `src/big.rs` (MONOLITH): No git commit detected"));
    }

    #[tokio::test]
    async fn narrative_failure_falls_back_to_template() {
        let before = HealthSnapshot::default();
        let after = HealthSnapshot::default();
        let results = [RepairResult::not_attempted(&issue("MONOLITH", "a.rs"), "boom")];
        let writer = StaticNarrative::failing("timed out");
        let report = generate(&input(&before, &after, &results), Some(&writer)).await;
        assert!(report.contains("### Failed Repairs Need Attention"));
        assert!(report.contains("boom"));
        assert!(!report.contains("GENERATED_BY"));
    }

    #[test]
    fn report_is_written_to_both_locations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = temp.path().join("state");
        let session = temp.path().join("sessions").join("s");
        let path = write_report("# Repair Report\n", &state, Some(&session)).expect("write");
        assert_eq!(fs::read_to_string(path).expect("read"), "# Repair Report\n");
        assert!(session.join(REPORT_FILE).exists());
    }
}
