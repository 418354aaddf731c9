//! Structure of issues that need a human decision.
//!
//! Escalation issues carry `details.items[]`, each with a `title` and free-form
//! `details[]` lines. Suggestion issues carry a single proposal. This module
//! only parses and renders; prompting the human lives in `interactive`.

use serde_json::Value;

use crate::core::types::{EscalationDecision, Issue};

/// Placeholder in escalation prompts replaced by the human's decisions.
pub const DECISIONS_PLACEHOLDER: &str = "{escalation_decisions}";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictOption {
    /// Option line as written, e.g. `(A) keep the docs`.
    pub label: String,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
}

/// One conflict the human has to settle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conflict {
    pub title: String,
    pub context: Vec<String>,
    pub options: Vec<ConflictOption>,
    pub recommendation: Option<String>,
    pub trying_to: Option<String>,
    pub need_to_know: Option<String>,
    pub context_needed: Option<String>,
}

impl Conflict {
    /// The agent is asking for missing information rather than a choice.
    pub fn needs_context(&self) -> bool {
        self.trying_to.is_some() || self.need_to_know.is_some() || self.context_needed.is_some()
    }
}

/// Parse the conflicts embedded in an escalation issue.
pub fn conflicts(issue: &Issue) -> Vec<Conflict> {
    let Some(items) = issue.details.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| {
            let title = item
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("Unknown conflict")
                .to_string();
            let lines: Vec<&str> = item
                .get("details")
                .and_then(Value::as_array)
                .map(|lines| lines.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            parse_conflict(title, &lines)
        })
        .collect()
}

fn parse_conflict(title: String, lines: &[&str]) -> Conflict {
    let mut conflict = Conflict {
        title,
        ..Conflict::default()
    };
    for raw in lines {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if is_option_line(line) {
            conflict.options.push(ConflictOption {
                label: line.to_string(),
                ..ConflictOption::default()
            });
        } else if let Some(pro) = strip_label(line, &lower, "pro:") {
            if let Some(option) = conflict.options.last_mut() {
                option.pros.push(pro);
            }
        } else if let Some(con) = strip_label(line, &lower, "con:") {
            if let Some(option) = conflict.options.last_mut() {
                option.cons.push(con);
            }
        } else if lower.contains("**recommendation") || lower.starts_with("recommendation:") {
            let text = line
                .replace("**Recommendation:**", "")
                .replace("**recommendation:**", "");
            let text = text.trim();
            let text = text.strip_prefix("Recommendation:").unwrap_or(text);
            conflict.recommendation = Some(text.trim().to_string());
        } else if let Some(v) = strip_label(line, &lower, "trying to:") {
            conflict.trying_to = Some(v);
        } else if let Some(v) = strip_label(line, &lower, "need to know:") {
            conflict.need_to_know = Some(v);
        } else if let Some(v) = strip_label(line, &lower, "context needed:") {
            conflict.context_needed = Some(v);
        } else {
            conflict.context.push(line.to_string());
        }
    }
    conflict
}

/// `(A) text` or `(1) text`.
fn is_option_line(line: &str) -> bool {
    line.starts_with('(') && line.chars().take(4).any(|c| c == ')')
}

fn strip_label(line: &str, lower: &str, label: &str) -> Option<String> {
    lower
        .starts_with(label)
        .then(|| line[label.len()..].trim().to_string())
}

/// Text presented for a suggestion issue.
pub fn suggestion_text(issue: &Issue) -> String {
    issue
        .detail_str("suggestion")
        .map(str::to_string)
        .or_else(|| {
            let s = issue.suggestion.trim();
            (!s.is_empty()).then(|| s.to_string())
        })
        .unwrap_or_else(|| issue.message.clone())
}

/// File the suggestion was raised from, if recorded.
pub fn suggestion_source(issue: &Issue) -> Option<&str> {
    issue.detail_str("source_file")
}

/// Bullet list of the decisions that were not passed.
pub fn render_decisions(decisions: &[EscalationDecision]) -> String {
    let lines: Vec<String> = decisions
        .iter()
        .filter(|d| !d.passed)
        .map(|d| format!("- **{}**: {}", d.conflict_title, d.decision_text))
        .collect();
    if lines.is_empty() {
        "(No decisions provided)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Substitute rendered decisions at [`DECISIONS_PLACEHOLDER`].
pub fn inject_decisions(prompt: &str, decisions: &[EscalationDecision]) -> String {
    prompt.replace(DECISIONS_PLACEHOLDER, &render_decisions(decisions))
}

/// True if at least one conflict got an actual decision.
pub fn has_decisions(decisions: &[EscalationDecision]) -> bool {
    decisions.iter().any(|d| !d.passed)
}
