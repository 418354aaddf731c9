//! Shared deterministic types for the repair core.
//!
//! These types define stable contracts between discovery input, the scheduler,
//! and the report. They carry no I/O and must stay deterministic across runs.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::provider::Provider;

/// Canonical type name of issues that need a per-conflict human decision.
pub const ESCALATION: &str = "ESCALATION";
/// Canonical type name of issues that need a binary accept/reject.
pub const SUGGESTION: &str = "SUGGESTION";

/// Severity assigned by the discovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an issue must be handled before (or instead of) dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    /// Dispatched straight to the pool.
    None,
    /// Each embedded conflict needs a decision or an explicit pass.
    Escalation,
    /// Needs accept/reject; rejected suggestions never spawn an agent.
    Suggestion,
}

/// A single detected codebase health problem.
///
/// Produced by the external discovery step and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_type: String,
    pub severity: Severity,
    pub path: String,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub suggestion: String,
}

impl Issue {
    /// Upper-cased type name with legacy aliases folded in.
    pub fn canonical_type(&self) -> String {
        canonical_issue_type(&self.issue_type)
    }

    pub fn interaction(&self) -> Interaction {
        match self.canonical_type().as_str() {
            ESCALATION => Interaction::Escalation,
            SUGGESTION => Interaction::Suggestion,
            _ => Interaction::None,
        }
    }

    /// String-valued entry of `details`, if present and non-empty.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Normalize an issue type name (`arbitrage` is the older name of `ESCALATION`).
pub fn canonical_issue_type(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    if upper == "ARBITRAGE" {
        ESCALATION.to_string()
    } else {
        upper
    }
}

/// Logical job an agent performs; scopes persisted per-agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Repair,
    Narrative,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Repair => "repair",
            AgentRole::Narrative => "narrative",
        }
    }
}

/// Key for model-fallback state: the same role on two providers never collides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentIdentity {
    pub provider: Provider,
    pub role: AgentRole,
}

impl AgentIdentity {
    pub fn new(provider: Provider, role: AgentRole) -> Self {
        Self { provider, role }
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.role.as_str())
    }
}

/// Per-issue agent instructions, consumed verbatim when building the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructions {
    pub view: String,
    #[serde(default)]
    pub docs_to_read: Vec<String>,
    pub prompt: String,
}

/// A human answer to one escalation conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationDecision {
    pub conflict_title: String,
    pub decision_text: String,
    pub passed: bool,
}

/// A `### DECISION:` block the agent reported in its own output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDecision {
    pub name: String,
    pub conflict: String,
    pub resolution: String,
    pub reasoning: String,
    pub updated: Option<String>,
}

/// How a result's success was established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verification {
    /// Repository head moved during the run.
    CommitDetected { before: String, after: String },
    /// Repository head did not move.
    NoCommit { head: String },
    /// No repository head available; success rests on the exit status alone.
    ExitStatusOnly,
    /// No agent was spawned (resolved interactively, dry run, or never dispatched).
    NotRun,
}

impl Verification {
    /// True when success was not backed by an external side effect.
    pub fn is_weak(&self) -> bool {
        matches!(self, Verification::ExitStatusOnly)
    }
}

/// Outcome of one issue. Exactly one per issue handled in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairResult {
    pub issue_type: String,
    pub target_path: String,
    pub success: bool,
    pub agent_output: String,
    pub duration: Duration,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub decisions_made: Vec<EscalationDecision>,
    pub agent_decisions: Vec<AgentDecision>,
    pub provider_used: Option<Provider>,
    pub verification: Verification,
}

impl RepairResult {
    /// Successful, zero-duration result for an issue that never spawned an agent.
    pub fn synthetic(issue: &Issue, note: &str, decisions: Vec<EscalationDecision>) -> Self {
        Self {
            issue_type: issue.canonical_type(),
            target_path: issue.path.clone(),
            success: true,
            agent_output: note.to_string(),
            duration: Duration::ZERO,
            error: None,
            exit_code: None,
            decisions_made: decisions,
            agent_decisions: Vec::new(),
            provider_used: None,
            verification: Verification::NotRun,
        }
    }

    /// Failed result for an issue whose run could not even be attempted.
    pub fn not_attempted(issue: &Issue, error: impl Into<String>) -> Self {
        Self {
            success: false,
            agent_output: String::new(),
            error: Some(error.into()),
            ..Self::synthetic(issue, "", Vec::new())
        }
    }
}

/// Health summary produced by the external discovery step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub score: i64,
    pub critical: usize,
    pub warning: usize,
    #[serde(default)]
    pub info: usize,
}
