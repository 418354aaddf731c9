//! One end-to-end repair session.
//!
//! before-snapshot -> plan -> interactive phase -> worker pool ->
//! after-snapshot -> report. The interactive phase settles every escalation
//! and suggestion before the pool opens; issues that end up with nothing to
//! do get a synthetic successful result instead of an agent.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::escalation::{DECISIONS_PLACEHOLDER, has_decisions, inject_decisions, render_decisions};
use crate::core::instructions::instructions_for;
use crate::core::priority::{Depth, prioritize};
use crate::core::report::ReportInput;
use crate::core::scheduler::SchedulerCounts;
use crate::core::types::{EscalationDecision, HealthSnapshot, Interaction, Issue, RepairResult};
use crate::interactive::InteractiveResolver;
use crate::io::health::HealthSource;
use crate::io::prompt::PromptEngine;
use crate::orchestrator::{Job, Orchestrator, SessionEvent};
use crate::report::{NarrativeWriter, generate, write_report};

/// Which issues a session takes on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanOptions {
    pub depth: Depth,
    /// Explicit issue-type allowlist; empty means every type in `depth`.
    pub types: Vec<String>,
    /// Cap on the number of issues, applied after ordering.
    pub max: Option<usize>,
}

/// Ordered, filtered, capped dispatch list.
pub fn plan(issues: &[Issue], options: &PlanOptions) -> Vec<Issue> {
    let mut ordered = prioritize(issues, options.depth, &options.types);
    if let Some(max) = options.max {
        ordered.truncate(max);
    }
    ordered
}

/// Rendered task prompt for `issue` with any human decisions substituted.
pub fn render_prompt(
    prompts: &PromptEngine,
    issue: &Issue,
    decisions: &[EscalationDecision],
) -> Result<String> {
    let mut instructions = instructions_for(issue);
    if issue.interaction() == Interaction::Escalation {
        if instructions.prompt.contains(DECISIONS_PLACEHOLDER) {
            instructions.prompt = inject_decisions(&instructions.prompt, decisions);
        } else if !decisions.is_empty() {
            // explicit instructions without the placeholder
            instructions.prompt = format!(
                "{}\n\n## Human Decisions\n\n{}\n",
                instructions.prompt.trim_end(),
                render_decisions(decisions)
            );
        }
    }
    prompts
        .render_repair(issue, &instructions)
        .with_context(|| format!("render prompt for {} {}", issue.canonical_type(), issue.path))
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// One result per handled issue, in plan order.
    pub results: Vec<RepairResult>,
    /// Issues planned but never dispatched (cancelled session).
    pub not_dispatched: usize,
    pub counts: SchedulerCounts,
    pub cancelled: bool,
    pub before: HealthSnapshot,
    pub after: HealthSnapshot,
    pub report_path: Option<PathBuf>,
}

impl SessionSummary {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

pub struct Session<W: Write> {
    pub project_root: PathBuf,
    pub health: Arc<dyn HealthSource>,
    pub prompts: PromptEngine,
    pub resolver: InteractiveResolver<W>,
    pub orchestrator: Orchestrator,
    pub narrative: Option<Box<dyn NarrativeWriter>>,
    pub cancel: CancellationToken,
}

impl<W: Write> Session<W> {
    #[instrument(skip_all, fields(project = %self.project_root.display()))]
    pub async fn run(mut self, options: &PlanOptions) -> Result<SessionSummary> {
        let before = self.health.check().await.context("initial health check")?;
        let planned = plan(&before.issues, options);
        info!(discovered = before.issues.len(), planned = planned.len(), "plan ready");

        let mut slots: Vec<Option<RepairResult>> = vec![None; planned.len()];
        let jobs = self.interactive_phase(&planned, &mut slots).await?;
        let job_slots: Vec<usize> = jobs.iter().map(|j| j.index).collect();

        let pool = self.orchestrator.run_pool(jobs).await;
        for (job, result) in pool.results.into_iter().enumerate() {
            if let Some(result) = result {
                slots[job_slots[job]] = Some(result);
            }
        }
        let cancelled = pool.cancelled || self.cancel.is_cancelled();
        let not_dispatched = slots.iter().filter(|s| s.is_none()).count();
        let results: Vec<RepairResult> = slots.into_iter().flatten().collect();

        let after = if cancelled {
            before.snapshot
        } else {
            match self.health.check().await {
                Ok(report) => report.snapshot,
                Err(e) => {
                    warn!(err = %format!("{e:#}"), "final health check failed, reusing initial snapshot");
                    before.snapshot
                }
            }
        };

        let report_path = self.write_report(&before.snapshot, &after, &results, cancelled).await;
        Ok(SessionSummary {
            results,
            not_dispatched,
            counts: pool.counts,
            cancelled,
            before: before.snapshot,
            after,
            report_path,
        })
    }

    /// Settle escalations and suggestions; return everything left to dispatch.
    async fn interactive_phase(
        &mut self,
        planned: &[Issue],
        slots: &mut [Option<RepairResult>],
    ) -> Result<Vec<Job>> {
        let mut decided: Vec<Option<Vec<EscalationDecision>>> = vec![None; planned.len()];
        for (index, issue) in planned.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let interaction = issue.interaction();
            let settled = match interaction {
                Interaction::None => continue,
                Interaction::Escalation => {
                    let decisions = tokio::select! {
                        d = self.resolver.resolve(issue) => d?,
                        () = self.cancel.cancelled() => break,
                    };
                    if has_decisions(&decisions) {
                        decided[index] = Some(decisions);
                        None
                    } else {
                        let note = if decisions.is_empty() {
                            "No conflicts to resolve"
                        } else {
                            "All conflicts passed"
                        };
                        Some(RepairResult::synthetic(issue, note, decisions))
                    }
                }
                Interaction::Suggestion => {
                    let accepted = tokio::select! {
                        a = self.resolver.accept(issue) => a?,
                        () = self.cancel.cancelled() => break,
                    };
                    if accepted {
                        decided[index] = Some(Vec::new());
                        None
                    } else {
                        Some(RepairResult::synthetic(issue, "Suggestion rejected", Vec::new()))
                    }
                }
            };
            self.orchestrator.emit(SessionEvent::Resolved {
                issue_type: issue.canonical_type(),
                path: issue.path.clone(),
                dispatched: settled.is_none(),
            });
            if let Some(result) = settled {
                slots[index] = Some(result);
            }
        }
        if self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for (index, issue) in planned.iter().enumerate() {
            if slots[index].is_some() {
                continue;
            }
            let decisions = match (issue.interaction(), decided[index].take()) {
                (Interaction::None, _) => Vec::new(),
                (_, Some(decisions)) => decisions,
                (_, None) => continue,
            };
            match render_prompt(&self.prompts, issue, &decisions) {
                Ok(prompt) => jobs.push(Job {
                    index,
                    issue: issue.clone(),
                    prompt,
                    decisions,
                }),
                Err(e) => {
                    warn!(err = %format!("{e:#}"), "skipping issue");
                    slots[index] = Some(RepairResult::not_attempted(issue, format!("{e:#}")));
                }
            }
        }
        Ok(jobs)
    }

    async fn write_report(
        &self,
        before: &HealthSnapshot,
        after: &HealthSnapshot,
        results: &[RepairResult],
        cancelled: bool,
    ) -> Option<PathBuf> {
        let project = project_name(&self.project_root);
        let generated_at = Local::now().format("%Y-%m-%d %H:%M").to_string();
        let input = ReportInput {
            project: &project,
            generated_at: &generated_at,
            before,
            after,
            results,
        };
        let narrative = if cancelled {
            None
        } else {
            self.narrative.as_deref()
        };
        let report = generate(&input, narrative).await;
        let state_dir = self.project_root.join(".mend").join("state");
        let session_dir = self.orchestrator.session_dir().path();
        match write_report(&report, &state_dir, Some(session_dir)) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(err = %format!("{e:#}"), "failed to write report");
                None
            }
        }
    }
}

fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string())
}
