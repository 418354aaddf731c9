//! Default `Issue -> Instructions` mapping.
//!
//! Discovery may attach explicit instructions under `details.instructions`;
//! those win. Otherwise a view is chosen per issue family and the task prompt
//! is assembled from a per-type action phrase, the issue message, and any
//! suggestion.

use serde_json::Value;

use crate::core::escalation::{DECISIONS_PLACEHOLDER, suggestion_source, suggestion_text};
use crate::core::types::{ESCALATION, Instructions, Issue, SUGGESTION};

const VIEW_DOCUMENT: &str = "VIEW_Document_Create_Module_Documentation.md";
const VIEW_REFACTOR: &str = "VIEW_Refactor_Improve_Code_Structure.md";
const VIEW_IMPLEMENT: &str = "VIEW_Implement_Write_Or_Modify_Code.md";
const VIEW_TEST: &str = "VIEW_Test_Write_Tests_And_Verify.md";
const VIEW_COLLABORATE: &str = "VIEW_Collaborate_Pair_Program_With_Human.md";
const VIEW_EXTEND: &str = "VIEW_Extend_Add_Features_To_Existing.md";

/// `(prefix, suffix)` around the issue path, e.g. "split {path} into smaller modules".
const ACTIONS: &[(&str, &str, &str)] = &[
    ("MONOLITH", "split", "into smaller modules"),
    ("UNDOCUMENTED", "add module mapping + docs for", ""),
    ("STALE_SYNC", "update outdated SYNC for", ""),
    ("PLACEHOLDER", "fill in placeholders in", ""),
    ("INCOMPLETE_CHAIN", "add missing docs to", ""),
    ("NO_DOCS_REF", "add DOCS: comment to", ""),
    ("BROKEN_IMPL_LINK", "fix broken links in", ""),
    ("STUB_IMPL", "implement stubs in", ""),
    ("INCOMPLETE_IMPL", "complete functions in", ""),
    ("UNDOC_IMPL", "add to IMPLEMENTATION docs:", ""),
    ("LARGE_DOC_MODULE", "reduce size of", "docs"),
    ("YAML_DRIFT", "fix modules.yaml entry for", ""),
    ("MISSING_TESTS", "add tests for", ""),
    ("ORPHAN_DOCS", "link or remove orphan docs in", ""),
    ("STALE_IMPL", "update IMPLEMENTATION doc for", ""),
    ("DOC_GAPS", "complete gaps left in", ""),
    ("ESCALATION", "resolve conflict in", ""),
    ("SUGGESTION", "implement suggestion from", ""),
    ("NEW_UNDOC_CODE", "update docs for", ""),
    ("COMPONENT_NO_STORIES", "add stories for", ""),
    ("HOOK_UNDOC", "document hook", ""),
    ("DOC_DUPLICATION", "consolidate duplicate docs in", ""),
    ("MAGIC_VALUES", "extract magic numbers from", "to constants"),
    ("HARDCODED_CONFIG", "externalize config in", ""),
    ("HARDCODED_SECRET", "remove secret from", ""),
    ("LONG_PROMPT", "externalize prompts in", "to prompts/"),
    ("LONG_SQL", "externalize SQL in", "to .sql files"),
];

/// Short human-readable action, e.g. `split src/big.rs into smaller modules`.
pub fn action(issue: &Issue) -> String {
    let canonical = issue.canonical_type();
    let (prefix, suffix) = ACTIONS
        .iter()
        .find(|(t, _, _)| *t == canonical)
        .map(|(_, p, s)| (*p, *s))
        .unwrap_or(("fix", ""));
    if suffix.is_empty() {
        format!("{prefix} {}", issue.path)
    } else {
        format!("{prefix} {} {suffix}", issue.path)
    }
}

fn view_for(issue_type: &str) -> &'static str {
    match issue_type {
        "MONOLITH" | "LARGE_DOC_MODULE" | "DOC_DUPLICATION" | "MAGIC_VALUES"
        | "HARDCODED_CONFIG" | "LONG_PROMPT" | "LONG_SQL" => VIEW_REFACTOR,
        "STUB_IMPL" | "INCOMPLETE_IMPL" | "HARDCODED_SECRET" => VIEW_IMPLEMENT,
        "MISSING_TESTS" | "COMPONENT_NO_STORIES" => VIEW_TEST,
        ESCALATION => VIEW_COLLABORATE,
        SUGGESTION => VIEW_EXTEND,
        _ => VIEW_DOCUMENT,
    }
}

/// Instructions for `issue`, honoring explicit ones from discovery.
pub fn instructions_for(issue: &Issue) -> Instructions {
    if let Some(explicit) = issue
        .details
        .get("instructions")
        .and_then(|v| serde_json::from_value::<Instructions>(v.clone()).ok())
    {
        return explicit;
    }

    let canonical = issue.canonical_type();
    let mut prompt = format!("## Task\n\nPlease {}.\n\n", action(issue));
    if !issue.message.trim().is_empty() {
        prompt.push_str(&format!("## Problem\n\n{}\n\n", issue.message.trim()));
    }
    match canonical.as_str() {
        ESCALATION => {
            prompt.push_str("## Human Decisions\n\nApply these decisions exactly:\n\n");
            prompt.push_str(DECISIONS_PLACEHOLDER);
            prompt.push_str("\n\n");
        }
        SUGGESTION => {
            prompt.push_str(&format!("## Suggestion\n\n{}\n\n", suggestion_text(issue)));
            if let Some(source) = suggestion_source(issue) {
                prompt.push_str(&format!("Raised from `{source}`.\n\n"));
            }
        }
        _ => {
            let suggestion = issue.suggestion.trim();
            if !suggestion.is_empty() {
                prompt.push_str(&format!("## Suggested Fix\n\n{suggestion}\n\n"));
            }
        }
    }
    prompt.push_str("Report \"REPAIR COMPLETE\" when done, or \"REPAIR FAILED\" with the reason.");

    Instructions {
        view: view_for(&canonical).to_string(),
        docs_to_read: docs_to_read(issue),
        prompt,
    }
}

fn docs_to_read(issue: &Issue) -> Vec<String> {
    let listed: Vec<String> = issue
        .details
        .get("docs")
        .and_then(Value::as_array)
        .map(|docs| {
            docs.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if listed.is_empty() && !issue.path.is_empty() {
        vec![issue.path.clone()]
    } else {
        listed
    }
}
