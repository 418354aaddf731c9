//! Deterministic session report rendering.
//!
//! Everything time- or environment-dependent (generation timestamp, project
//! name) is passed in, so the same input always renders the same markdown.

use std::fmt::Write as _;
use std::time::Duration;

use crate::core::types::{HealthSnapshot, RepairResult, Verification};

/// Inputs for one session report.
#[derive(Debug, Clone, Copy)]
pub struct ReportInput<'a> {
    pub project: &'a str,
    pub generated_at: &'a str,
    pub before: &'a HealthSnapshot,
    pub after: &'a HealthSnapshot,
    pub results: &'a [RepairResult],
}

impl ReportInput<'_> {
    pub fn score_change(&self) -> i64 {
        self.after.score - self.before.score
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &RepairResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &RepairResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn total_duration(&self) -> Duration {
        self.results.iter().map(|r| r.duration).sum()
    }
}

/// Header block shared by the deterministic and narrative reports.
pub fn header(input: &ReportInput<'_>, generated_by: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("# Repair Report\n\n```\n");
    let _ = writeln!(out, "GENERATED: {}", input.generated_at);
    let _ = writeln!(out, "PROJECT: {}", input.project);
    if let Some(by) = generated_by {
        let _ = writeln!(out, "GENERATED_BY: {by}");
    }
    out.push_str("```\n\n---\n\n");
    out
}

pub fn render(input: &ReportInput<'_>) -> String {
    let mut out = header(input, None);
    let succeeded: Vec<&RepairResult> = input.succeeded().collect();
    let failed: Vec<&RepairResult> = input.failed().collect();

    out.push_str("## Summary\n\n");
    out.push_str("| Metric | Before | After | Change |\n");
    out.push_str("|--------|--------|-------|--------|\n");
    let _ = writeln!(
        out,
        "| Health Score | {}/100 | {}/100 | {:+} |",
        input.before.score,
        input.after.score,
        input.score_change()
    );
    let _ = writeln!(
        out,
        "| Critical Issues | {} | {} | {:+} |",
        input.before.critical,
        input.after.critical,
        input.after.critical as i64 - input.before.critical as i64
    );
    let _ = writeln!(
        out,
        "| Warnings | {} | {} | {:+} |",
        input.before.warning,
        input.after.warning,
        input.after.warning as i64 - input.before.warning as i64
    );
    out.push('\n');

    out.push_str("## Repairs Attempted\n\n");
    let _ = writeln!(out, "**Total:** {} issues", input.results.len());
    let _ = writeln!(out, "**Successful:** {}", succeeded.len());
    let _ = writeln!(out, "**Failed:** {}", failed.len());
    let _ = writeln!(
        out,
        "**Duration:** {:.1} seconds",
        input.total_duration().as_secs_f64()
    );
    out.push('\n');

    if !succeeded.is_empty() {
        out.push_str("### Successful Repairs\n\n");
        for r in &succeeded {
            let _ = writeln!(
                out,
                "- **{}**: `{}` ({:.1}s){}",
                r.issue_type,
                r.target_path,
                r.duration.as_secs_f64(),
                verification_note(&r.verification)
            );
        }
        out.push('\n');
    }

    if !failed.is_empty() {
        out.push_str("### Failed Repairs\n\n");
        for r in &failed {
            let _ = writeln!(out, "- **{}**: `{}`", r.issue_type, r.target_path);
            if let Some(err) = &r.error {
                let _ = writeln!(out, "  - Error: {err}");
            }
            if let Some(code) = r.exit_code {
                let _ = writeln!(out, "  - Exit code: {code}");
            }
        }
        out.push('\n');
    }

    decisions_section(&mut out, input.results);

    let weak: Vec<&&RepairResult> = succeeded
        .iter()
        .filter(|r| r.verification.is_weak())
        .collect();
    if !weak.is_empty() {
        out.push_str("## Weakly Verified\n\n");
        out.push_str(
            "No repository head was available; these succeeded on exit status alone:\n\n",
        );
        for r in weak {
            let _ = writeln!(out, "- **{}**: `{}`", r.issue_type, r.target_path);
        }
        out.push('\n');
    }

    if input.after.critical > 0 || input.after.warning > 0 {
        out.push_str("## Remaining Issues\n\n");
        let _ = writeln!(
            out,
            "{} critical and {} warnings remain. Re-run discovery for details.",
            input.after.critical, input.after.warning
        );
        out.push('\n');
    }

    out.push_str("## Recommendations\n\n");
    out.push_str(recommendation(input.after.score));
    out.push_str("\n\n");

    attention_section(&mut out, &failed);
    out.push_str("\n---\n\n*Generated by `mend run`*\n");
    out
}

/// Sections appended after an agent-written narrative: the narrative may
/// summarize freely, but decisions and failures are always listed verbatim.
pub fn narrative_appendix(input: &ReportInput<'_>) -> String {
    let failed: Vec<&RepairResult> = input.failed().collect();
    let mut out = String::new();
    decisions_section(&mut out, input.results);
    attention_section(&mut out, &failed);
    out
}

fn attention_section(out: &mut String, failed: &[&RepairResult]) {
    out.push_str("### Failed Repairs Need Attention\n\n");
    if failed.is_empty() {
        out.push_str("None.\n");
        return;
    }
    out.push_str("The following issues could not be repaired automatically:\n\n");
    for r in failed {
        let _ = writeln!(
            out,
            "- `{}` ({}): {}",
            r.target_path,
            r.issue_type,
            r.error.as_deref().unwrap_or("unknown error")
        );
    }
    out.push_str("\nConsider fixing these manually using the appropriate VIEW.\n");
}

fn decisions_section(out: &mut String, results: &[RepairResult]) {
    let human: Vec<_> = results
        .iter()
        .flat_map(|r| r.decisions_made.iter().filter(|d| !d.passed).map(move |d| (r, d)))
        .collect();
    let agent: Vec<_> = results
        .iter()
        .flat_map(|r| r.agent_decisions.iter().map(move |d| (r, d)))
        .collect();
    if human.is_empty() && agent.is_empty() {
        return;
    }

    out.push_str("## Decisions Made\n\n");
    if !human.is_empty() {
        out.push_str("Decisions provided during escalation review:\n\n");
        for (r, d) in human {
            let _ = writeln!(
                out,
                "- **{}** (`{}`): {}",
                d.conflict_title, r.target_path, d.decision_text
            );
        }
        out.push('\n');
    }
    if !agent.is_empty() {
        out.push_str("Agents made the following decisions to resolve conflicts:\n\n");
        for (r, d) in agent {
            let _ = writeln!(out, "### {}", d.name);
            let _ = writeln!(out, "- **Issue:** {} `{}`", r.issue_type, r.target_path);
            if !d.conflict.is_empty() {
                let _ = writeln!(out, "- **Conflict:** {}", d.conflict);
            }
            if !d.resolution.is_empty() {
                let _ = writeln!(out, "- **Resolution:** {}", d.resolution);
            }
            if !d.reasoning.is_empty() {
                let _ = writeln!(out, "- **Reasoning:** {}", d.reasoning);
            }
            if let Some(updated) = &d.updated {
                let _ = writeln!(out, "- **Updated:** {updated}");
            }
            out.push('\n');
        }
    }
}

fn verification_note(verification: &Verification) -> &'static str {
    match verification {
        Verification::ExitStatusOnly => " [exit status only]",
        Verification::NotRun => " [no agent run]",
        Verification::CommitDetected { .. } | Verification::NoCommit { .. } => "",
    }
}

fn recommendation(score: i64) -> &'static str {
    if score >= 80 {
        "Project health is good. Continue with normal development."
    } else if score >= 50 {
        "Project health is improving. Consider running repair again to address remaining issues."
    } else {
        "Project still has critical issues. Manual intervention may be needed for complex cases."
    }
}

/// Prompt handed to the narrative delegate.
pub fn narrative_prompt(input: &ReportInput<'_>) -> String {
    let list = |results: Vec<&RepairResult>, with_error: bool| -> String {
        if results.is_empty() {
            return "None".to_string();
        }
        results
            .iter()
            .map(|r| {
                if with_error {
                    format!(
                        "- {}: `{}`: {}",
                        r.issue_type,
                        r.target_path,
                        r.error.as_deref().unwrap_or("unknown error")
                    )
                } else {
                    format!(
                        "- {}: `{}` ({:.1}s)",
                        r.issue_type,
                        r.target_path,
                        r.duration.as_secs_f64()
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let mut decisions = String::new();
    decisions_section(&mut decisions, input.results);

    let mut out = String::new();
    out.push_str(
        "You are writing the report for an automated repair session. Analyze the data below \
         and write a specific, insightful markdown report: executive summary, what was fixed, \
         decisions made, what failed and why, patterns observed, recommended next steps, and \
         handoff notes for the next agent.\n\n",
    );
    let _ = writeln!(out, "**Project:** {}", input.project);
    let _ = writeln!(out, "**Date:** {}\n", input.generated_at);
    let _ = writeln!(
        out,
        "Health score: {} -> {} ({:+})",
        input.before.score,
        input.after.score,
        input.score_change()
    );
    let _ = writeln!(
        out,
        "Critical: {} -> {}; warnings: {} -> {}\n",
        input.before.critical, input.after.critical, input.before.warning, input.after.warning
    );
    let _ = writeln!(
        out,
        "Successful repairs:\n{}\n",
        list(input.succeeded().collect(), false)
    );
    let _ = writeln!(
        out,
        "Failed repairs:\n{}\n",
        list(input.failed().collect(), true)
    );
    let _ = writeln!(
        out,
        "Total duration: {:.1} seconds\n",
        input.total_duration().as_secs_f64()
    );
    if decisions.is_empty() {
        out.push_str("Decisions: None\n");
    } else {
        out.push_str(&decisions);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AgentDecision, EscalationDecision};

    fn result(issue_type: &str, path: &str, success: bool) -> RepairResult {
        RepairResult {
            issue_type: issue_type.to_string(),
            target_path: path.to_string(),
            success,
            agent_output: String::new(),
            duration: Duration::from_millis(1500),
            error: (!success).then(|| "No git commit detected".to_string()),
            exit_code: (!success).then_some(0),
            decisions_made: Vec::new(),
            agent_decisions: Vec::new(),
            provider_used: None,
            verification: Verification::CommitDetected {
                before: "a".to_string(),
                after: "b".to_string(),
            },
        }
    }

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

    #[test]
    fn render_is_deterministic_and_complete() {
        let before = HealthSnapshot {
            score: 40,
            critical: 3,
            warning: 5,
            info: 0,
        };
        let after = HealthSnapshot {
            score: 55,
            critical: 1,
            warning: 5,
            info: 0,
        };
        let mut ok = result("MONOLITH", "src/big.rs", true);
        ok.decisions_made.push(EscalationDecision {
            conflict_title: "Retry count".to_string(),
            decision_text: "use 5".to_string(),
            passed: false,
        });
        ok.agent_decisions.push(AgentDecision {
            name: "Naming".to_string(),
            conflict: "Foo vs Bar".to_string(),
            resolution: "Bar".to_string(),
            reasoning: "matches code".to_string(),
            updated: None,
        });
        let results = vec![ok, result("STALE_SYNC", "SYNC.md", false)];
        let input = input(&before, &after, &results);

        let report = render(&input);
        assert_eq!(report, render(&input));
        assert!(report.starts_with("# Repair Report"));
        assert!(report.contains("| Health Score | 40/100 | 55/100 | +15 |"));
        assert!(report.contains("| Critical Issues | 3 | 1 | -2 |"));
        assert!(report.contains("**Successful:** 1"));
        assert!(report.contains("- **Retry count** (`src/big.rs`): use 5"));
        assert!(report.contains("### Naming"));
        assert!(report.contains("## Remaining Issues"));
        assert!(report.contains("Project health is improving."));
        let attention = report
            .split("### Failed Repairs Need Attention")
            .nth(1)
            .expect("attention section");
        assert!(attention.contains("- `SYNC.md` (STALE_SYNC): No git commit detected"));
    }

    #[test]
    fn attention_section_present_without_failures() {
        let snapshot = HealthSnapshot {
            score: 90,
            ..HealthSnapshot::default()
        };
        let report = render(&input(&snapshot, &snapshot, &[]));
        assert!(report.contains("### Failed Repairs Need Attention\n\nNone.\n"));
        assert!(!report.contains("## Decisions Made"));
        assert!(!report.contains("## Remaining Issues"));
    }

    #[test]
    fn weak_verification_is_flagged() {
        let snapshot = HealthSnapshot::default();
        let mut weak = result("NO_DOCS_REF", "a.rs", true);
        weak.verification = Verification::ExitStatusOnly;
        let results = [weak];
        let report = render(&input(&snapshot, &snapshot, &results));
        assert!(report.contains("## Weakly Verified"));
        assert!(report.contains("[exit status only]"));
    }

    #[test]
    fn narrative_prompt_lists_failures() {
        let snapshot = HealthSnapshot::default();
        let results = [result("STALE_SYNC", "SYNC.md", false)];
        let prompt = narrative_prompt(&input(&snapshot, &snapshot, &results));
        assert!(prompt.contains("- STALE_SYNC: `SYNC.md`: No git commit detected"));
        assert!(prompt.contains("Successful repairs:\nNone"));
    }
}
