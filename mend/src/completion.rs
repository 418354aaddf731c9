//! Completion detection by external side effect.
//!
//! An agent's own claim of success is never trusted. The single policy here:
//!
//! 1. A run that did not exit zero (non-zero code, signal, timeout,
//!    cancellation) failed, whatever happened to the repository.
//! 2. With a repository head available, a zero exit succeeds only if the head
//!    moved during the run.
//! 3. Without one, a zero exit succeeds but is marked
//!    [`Verification::ExitStatusOnly`], a weaker guarantee the report calls out.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::agent::RunResult;
use crate::core::types::Verification;
use crate::io::git::Git;

pub const NO_COMMIT_ERROR: &str = "No git commit detected";

/// Reads the current repository head; `None` when there is no head concept.
pub trait HeadProbe: Send + Sync {
    fn head(&self) -> Result<Option<String>>;
}

impl HeadProbe for Git {
    fn head(&self) -> Result<Option<String>> {
        self.head_sha()
    }
}

/// Head observed immediately before a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline(Option<String>);

impl Baseline {
    pub fn head(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub success: bool,
    pub verification: Verification,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct CompletionDetector {
    probe: Arc<dyn HeadProbe>,
}

impl CompletionDetector {
    pub fn new(probe: Arc<dyn HeadProbe>) -> Self {
        Self { probe }
    }

    pub fn baseline(&self) -> Baseline {
        Baseline(self.read_head())
    }

    pub fn verdict(&self, baseline: &Baseline, run: &RunResult) -> Verdict {
        let verification = match baseline.head() {
            Some(before) => match self.read_head() {
                Some(after) if after != before => Verification::CommitDetected {
                    before: before.to_string(),
                    after,
                },
                _ => Verification::NoCommit {
                    head: before.to_string(),
                },
            },
            None => Verification::ExitStatusOnly,
        };

        if !run.success {
            let error = run
                .error
                .clone()
                .unwrap_or_else(|| "Agent run failed".to_string());
            return Verdict {
                success: false,
                verification,
                error: Some(error),
            };
        }
        let verdict = match verification {
            Verification::NoCommit { .. } => Verdict {
                success: false,
                verification,
                error: Some(NO_COMMIT_ERROR.to_string()),
            },
            Verification::CommitDetected { .. } | Verification::ExitStatusOnly => Verdict {
                success: true,
                verification,
                error: None,
            },
            Verification::NotRun => Verdict {
                success: false,
                verification,
                error: Some("Agent did not run".to_string()),
            },
        };
        debug!(success = verdict.success, verification = ?verdict.verification, "completion verdict");
        verdict
    }

    fn read_head(&self) -> Option<String> {
        match self.probe.head() {
            Ok(head) => head,
            Err(e) => {
                warn!(err = %format!("{e:#}"), "failed to read repository head");
                None
            }
        }
    }
}
