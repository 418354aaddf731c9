//! Extraction of `### DECISION:` blocks from agent output.
//!
//! Agents are asked to record every conflict they resolve on their own as:
//!
//! ```text
//! ### DECISION: {name}
//! - Conflict: {what contradicted what}
//! - Resolution: {what was decided}
//! - Reasoning: {why}
//! - Updated: {files changed}
//! ```

use crate::core::types::AgentDecision;

#[derive(Debug, Clone, Copy)]
enum Field {
    Conflict,
    Resolution,
    Reasoning,
    Updated,
}

const HEADING: &str = "### decision:";

const FIELDS: &[(&str, Field)] = &[
    ("conflict:", Field::Conflict),
    ("resolution:", Field::Resolution),
    ("reasoning:", Field::Reasoning),
    ("updated:", Field::Updated),
];

/// Parse every decision block in `output`, in order of appearance.
pub fn parse_agent_decisions(output: &str) -> Vec<AgentDecision> {
    let mut decisions = Vec::new();
    let mut current: Option<AgentDecision> = None;

    for line in output.lines() {
        let stripped = line.trim();
        let lower = stripped.to_ascii_lowercase();

        if let Some(rest) = lower.strip_prefix(HEADING) {
            let name = &stripped[stripped.len() - rest.len()..];
            push_named(&mut decisions, current.take());
            current = Some(AgentDecision {
                name: name.trim().to_string(),
                conflict: String::new(),
                resolution: String::new(),
                reasoning: String::new(),
                updated: None,
            });
            continue;
        }

        let Some(decision) = current.as_mut() else {
            continue;
        };
        let body = lower.strip_prefix("- ").unwrap_or(&lower);
        let offset = stripped.len() - body.len();
        if let Some((label, field)) = FIELDS.iter().find(|(label, _)| body.starts_with(label)) {
            let value = stripped[offset + label.len()..].trim().to_string();
            match field {
                Field::Conflict => decision.conflict = value,
                Field::Resolution => decision.resolution = value,
                Field::Reasoning => decision.reasoning = value,
                Field::Updated => decision.updated = Some(value),
            }
        } else if stripped.starts_with("###") || stripped.starts_with("## ") {
            push_named(&mut decisions, current.take());
        }
    }
    push_named(&mut decisions, current);
    decisions
}

fn push_named(decisions: &mut Vec<AgentDecision>, decision: Option<AgentDecision>) {
    if let Some(decision) = decision
        && !decision.name.is_empty()
    {
        decisions.push(decision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_blocks_until_next_heading() {
        let output = "\
Working on it.
### DECISION: Retry count
- Conflict: docs say 3, code says 5
- Resolution: keep 5
- Reasoning: production tuned
- Updated: docs/ALGORITHM.md

### Decision: Naming
Conflict: Foo vs Bar
Resolution: Bar
## Summary
Resolution: ignored
";
        let decisions = parse_agent_decisions(output);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].name, "Retry count");
        assert_eq!(decisions[0].conflict, "docs say 3, code says 5");
        assert_eq!(decisions[0].resolution, "keep 5");
        assert_eq!(decisions[0].reasoning, "production tuned");
        assert_eq!(decisions[0].updated.as_deref(), Some("docs/ALGORITHM.md"));
        assert_eq!(decisions[1].name, "Naming");
        assert_eq!(decisions[1].resolution, "Bar");
        assert_eq!(decisions[1].updated, None);
    }

    #[test]
    fn unnamed_blocks_are_dropped() {
        assert!(parse_agent_decisions("### DECISION:\n- Resolution: x\n").is_empty());
        assert!(parse_agent_decisions("no decisions here").is_empty());
    }
}
