//! Synchronous human input for escalations and suggestions.
//!
//! Runs strictly before the worker pool opens, so blocking on the console
//! never overlaps agent output. Answers arrive on a bounded channel fed by
//! the console reader; a closed channel counts as "pass" / "reject".

use std::io::Write;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::escalation::{Conflict, conflicts, suggestion_source, suggestion_text};
use crate::core::types::{EscalationDecision, Issue};

pub struct InteractiveResolver<W: Write> {
    input: mpsc::Receiver<String>,
    out: W,
    input_closed: bool,
    skip_remaining_suggestions: bool,
}

impl<W: Write> InteractiveResolver<W> {
    pub fn new(input: mpsc::Receiver<String>, out: W) -> Self {
        Self {
            input,
            out,
            input_closed: false,
            skip_remaining_suggestions: false,
        }
    }

    /// Ask for a decision on every conflict in an escalation issue.
    ///
    /// Passed conflicts are returned with `passed == true` and no text.
    pub async fn resolve(&mut self, issue: &Issue) -> Result<Vec<EscalationDecision>> {
        let conflicts = conflicts(issue);
        writeln!(self.out, "\n=== ESCALATION: {} ===", issue.path).context("write console")?;
        if conflicts.is_empty() {
            writeln!(self.out, "(no conflicts listed)").context("write console")?;
            return Ok(Vec::new());
        }

        let mut decisions = Vec::with_capacity(conflicts.len());
        for (i, conflict) in conflicts.iter().enumerate() {
            self.show_conflict(i + 1, conflicts.len(), conflict)?;
            let prompt = if conflict.needs_context() {
                "Your answer (Enter to pass): "
            } else {
                "Your decision (Enter to pass): "
            };
            let answer = self.ask(prompt).await?;
            let passed = answer.is_empty() || answer.eq_ignore_ascii_case("pass");
            debug!(conflict = %conflict.title, passed, "escalation answered");
            decisions.push(EscalationDecision {
                conflict_title: conflict.title.clone(),
                decision_text: if passed { String::new() } else { answer },
                passed,
            });
        }
        info!(
            path = %issue.path,
            decided = decisions.iter().filter(|d| !d.passed).count(),
            "escalation resolved"
        );
        Ok(decisions)
    }

    /// Ask whether to implement a suggestion. `q` rejects this and every
    /// remaining suggestion without asking again.
    pub async fn accept(&mut self, issue: &Issue) -> Result<bool> {
        if self.skip_remaining_suggestions {
            return Ok(false);
        }
        writeln!(self.out, "\n=== SUGGESTION: {} ===", issue.path).context("write console")?;
        writeln!(self.out, "{}", suggestion_text(issue)).context("write console")?;
        if let Some(source) = suggestion_source(issue) {
            writeln!(self.out, "Source: {source}").context("write console")?;
        }
        let answer = self.ask("Implement? [y/N/q]: ").await?.to_ascii_lowercase();
        let accepted = match answer.as_str() {
            "y" | "yes" => true,
            "q" => {
                self.skip_remaining_suggestions = true;
                false
            }
            _ => false,
        };
        info!(path = %issue.path, accepted, "suggestion answered");
        Ok(accepted)
    }

    fn show_conflict(&mut self, n: usize, total: usize, conflict: &Conflict) -> Result<()> {
        let out = &mut self.out;
        writeln!(out, "\n[{n}/{total}] {}", conflict.title).context("write console")?;
        for line in &conflict.context {
            writeln!(out, "  {line}").context("write console")?;
        }
        for option in &conflict.options {
            writeln!(out, "  {}", option.label).context("write console")?;
            for pro in &option.pros {
                writeln!(out, "      + {pro}").context("write console")?;
            }
            for con in &option.cons {
                writeln!(out, "      - {con}").context("write console")?;
            }
        }
        if let Some(rec) = &conflict.recommendation {
            writeln!(out, "  Recommendation: {rec}").context("write console")?;
        }
        let asks = [
            ("Trying to", &conflict.trying_to),
            ("Need to know", &conflict.need_to_know),
            ("Context needed", &conflict.context_needed),
        ];
        for (label, value) in asks {
            if let Some(value) = value {
                writeln!(out, "  {label}: {value}").context("write console")?;
            }
        }
        Ok(())
    }

    async fn ask(&mut self, prompt: &str) -> Result<String> {
        write!(self.out, "{prompt}").context("write console")?;
        self.out.flush().context("flush console")?;
        if self.input_closed {
            writeln!(self.out).context("write console")?;
            return Ok(String::new());
        }
        match self.input.recv().await {
            Some(line) => Ok(line.trim().to_string()),
            None => {
                debug!("console input closed");
                self.input_closed = true;
                writeln!(self.out).context("write console")?;
                Ok(String::new())
            }
        }
    }
}
