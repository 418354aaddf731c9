//! Issue queue ordering and depth filtering.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::core::types::{Issue, canonical_issue_type};

/// Priority for issue types missing from [`PRIORITY`].
pub const UNKNOWN_PRIORITY: u32 = 99;

/// Fixed repair order, lower first.
const PRIORITY: &[(&str, u32)] = &[
    ("ESCALATION", 0),
    ("HARDCODED_SECRET", 0),
    ("YAML_DRIFT", 1),
    ("SUGGESTION", 1),
    ("UNDOCUMENTED", 2),
    ("INCOMPLETE_CHAIN", 3),
    ("DOC_GAPS", 3),
    ("PLACEHOLDER", 4),
    ("BROKEN_IMPL_LINK", 5),
    ("NO_DOCS_REF", 6),
    ("DOC_DUPLICATION", 6),
    ("STALE_SYNC", 7),
    ("UNDOC_IMPL", 8),
    ("NEW_UNDOC_CODE", 8),
    ("STALE_IMPL", 9),
    ("MONOLITH", 10),
    ("STUB_IMPL", 11),
    ("INCOMPLETE_IMPL", 12),
    ("HARDCODED_CONFIG", 12),
    ("LARGE_DOC_MODULE", 13),
    ("ORPHAN_DOCS", 14),
    ("MISSING_TESTS", 15),
    ("COMPONENT_NO_STORIES", 16),
    ("HOOK_UNDOC", 16),
    ("MAGIC_VALUES", 17),
    ("LONG_PROMPT", 17),
    ("LONG_SQL", 17),
];

const LINK_TYPES: &[&str] = &[
    "NO_DOCS_REF",
    "BROKEN_IMPL_LINK",
    "YAML_DRIFT",
    "UNDOC_IMPL",
    "ORPHAN_DOCS",
];

const DOC_TYPES: &[&str] = &[
    "UNDOCUMENTED",
    "STALE_SYNC",
    "PLACEHOLDER",
    "INCOMPLETE_CHAIN",
    "LARGE_DOC_MODULE",
    "STALE_IMPL",
    "DOC_GAPS",
    "DOC_DUPLICATION",
    "NEW_UNDOC_CODE",
    "ESCALATION",
    "SUGGESTION",
];

const CODE_TYPES: &[&str] = &[
    "MONOLITH",
    "STUB_IMPL",
    "INCOMPLETE_IMPL",
    "MISSING_TESTS",
    "HARDCODED_SECRET",
    "HARDCODED_CONFIG",
    "MAGIC_VALUES",
    "LONG_PROMPT",
    "LONG_SQL",
    "COMPONENT_NO_STORIES",
    "HOOK_UNDOC",
];

/// Named, nested subset of repairable issue types (`links ⊂ docs ⊂ full`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Links,
    #[default]
    Docs,
    Full,
}

impl Depth {
    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Links => "links",
            Depth::Docs => "docs",
            Depth::Full => "full",
        }
    }

    /// Canonical issue types admitted at this depth.
    pub fn issue_types(self) -> impl Iterator<Item = &'static str> {
        let layers: &'static [&'static [&'static str]] = match self {
            Depth::Links => &[LINK_TYPES],
            Depth::Docs => &[LINK_TYPES, DOC_TYPES],
            Depth::Full => &[LINK_TYPES, DOC_TYPES, CODE_TYPES],
        };
        layers.iter().flat_map(|layer| layer.iter().copied())
    }

    pub fn admits(self, issue_type: &str) -> bool {
        let canonical = canonical_issue_type(issue_type);
        self.issue_types().any(|t| t == canonical)
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Depth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "links" => Ok(Depth::Links),
            "docs" => Ok(Depth::Docs),
            "full" => Ok(Depth::Full),
            other => Err(anyhow!(
                "unknown depth '{other}' (expected links, docs, or full)"
            )),
        }
    }
}

/// Priority of an issue type; unknown types sort last.
pub fn priority(issue_type: &str) -> u32 {
    let canonical = canonical_issue_type(issue_type);
    PRIORITY
        .iter()
        .find(|(name, _)| *name == canonical)
        .map(|(_, p)| *p)
        .unwrap_or(UNKNOWN_PRIORITY)
}

/// Filter `issues` to the active depth (and explicit types, if any) and order
/// them by priority. Ties keep discovery order. The first issue for a given
/// `(type, path)` wins; later duplicates are dropped.
pub fn prioritize(issues: &[Issue], depth: Depth, explicit_types: &[String]) -> Vec<Issue> {
    let explicit: HashSet<String> = explicit_types
        .iter()
        .map(|t| canonical_issue_type(t))
        .collect();
    let mut seen = HashSet::new();
    let mut selected: Vec<Issue> = issues
        .iter()
        .filter(|issue| depth.admits(&issue.issue_type))
        .filter(|issue| explicit.is_empty() || explicit.contains(&issue.canonical_type()))
        .filter(|issue| seen.insert((issue.canonical_type(), issue.path.clone())))
        .cloned()
        .collect();
    selected.sort_by_key(|issue| priority(&issue.issue_type));
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Severity;
    use serde_json::Map;

    fn issue(issue_type: &str, path: &str) -> Issue {
        Issue {
            issue_type: issue_type.to_string(),
            severity: Severity::Warning,
            path: path.to_string(),
            message: String::new(),
            details: Map::new(),
            suggestion: String::new(),
        }
    }

    fn order(issues: &[Issue]) -> Vec<(String, String)> {
        issues
            .iter()
            .map(|i| (i.issue_type.clone(), i.path.clone()))
            .collect()
    }

    #[test]
    fn depth_sets_are_nested() {
        for t in Depth::Links.issue_types() {
            assert!(Depth::Docs.admits(t), "{t} missing from docs");
        }
        for t in Depth::Docs.issue_types() {
            assert!(Depth::Full.admits(t), "{t} missing from full");
        }
        assert!(!Depth::Links.admits("MONOLITH"));
        assert!(!Depth::Docs.admits("MONOLITH"));
        assert!(Depth::Full.admits("monolith"));
        assert!(Depth::Docs.admits("ARBITRAGE"));
    }

    #[test]
    fn every_admitted_type_has_a_priority() {
        for t in Depth::Full.issue_types() {
            assert_ne!(priority(t), UNKNOWN_PRIORITY, "{t}");
        }
        assert_eq!(priority("SOMETHING_NEW"), UNKNOWN_PRIORITY);
    }

    #[test]
    fn sorts_by_priority_with_stable_ties() {
        let issues = vec![
            issue("MONOLITH", "big.rs"),
            issue("NO_DOCS_REF", "a.rs"),
            issue("ESCALATION", "SYNC.md"),
            issue("DOC_DUPLICATION", "b.md"),
            issue("NO_DOCS_REF", "c.rs"),
        ];
        let ordered = prioritize(&issues, Depth::Full, &[]);
        assert_eq!(
            order(&ordered),
            vec![
                ("ESCALATION".to_string(), "SYNC.md".to_string()),
                ("NO_DOCS_REF".to_string(), "a.rs".to_string()),
                ("DOC_DUPLICATION".to_string(), "b.md".to_string()),
                ("NO_DOCS_REF".to_string(), "c.rs".to_string()),
                ("MONOLITH".to_string(), "big.rs".to_string()),
            ]
        );
    }

    #[test]
    fn depth_and_explicit_filter_intersect() {
        let issues = vec![
            issue("MONOLITH", "big.rs"),
            issue("NO_DOCS_REF", "a.rs"),
            issue("STALE_SYNC", "SYNC.md"),
        ];
        let explicit = ["monolith".to_string(), "STALE_SYNC".to_string()];
        let ordered = prioritize(&issues, Depth::Docs, &explicit);
        assert_eq!(
            order(&ordered),
            vec![("STALE_SYNC".to_string(), "SYNC.md".to_string())]
        );
    }

    #[test]
    fn unknown_types_are_dropped_by_depth() {
        let issues = vec![issue("MYSTERY", "x"), issue("YAML_DRIFT", "modules.yaml")];
        assert_eq!(prioritize(&issues, Depth::Full, &[]).len(), 1);
    }

    #[test]
    fn duplicates_keep_first() {
        let mut first = issue("MONOLITH", "big.rs");
        first.message = "first".to_string();
        let mut second = issue("monolith", "big.rs");
        second.message = "second".to_string();
        let ordered = prioritize(&[first, second], Depth::Full, &[]);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].message, "first");
    }

    #[test]
    fn depth_parses_case_insensitively() {
        assert_eq!("FULL".parse::<Depth>().expect("parse"), Depth::Full);
        assert!("deep".parse::<Depth>().is_err());
    }
}
