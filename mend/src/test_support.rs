//! Test-only fakes and fixtures for the repair pipeline.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRunner, RunRequest, RunResult};
use crate::completion::HeadProbe;
use crate::core::protocol::AgentEvent;
use crate::core::types::{HealthSnapshot, Issue, Severity};
use crate::io::git::Git;
use crate::io::health::{DoctorReport, HealthSource};
use crate::report::NarrativeWriter;

/// Minimal warning-level issue of `issue_type` at `path`.
pub fn issue(issue_type: &str, path: &str) -> Issue {
    Issue {
        issue_type: issue_type.to_string(),
        severity: Severity::Warning,
        path: path.to_string(),
        message: format!("{issue_type} at {path}"),
        details: Map::new(),
        suggestion: String::new(),
    }
}

/// Escalation issue with `(title, detail lines)` conflicts.
pub fn escalation_issue(path: &str, items: &[(&str, &[&str])]) -> Issue {
    let items: Vec<Value> = items
        .iter()
        .map(|(title, lines)| json!({ "title": title, "details": lines }))
        .collect();
    let mut details = Map::new();
    details.insert("items".to_string(), Value::Array(items));
    Issue {
        details,
        ..issue("ESCALATION", path)
    }
}

pub fn suggestion_issue(path: &str, text: &str) -> Issue {
    let mut details = Map::new();
    details.insert("suggestion".to_string(), Value::String(text.to_string()));
    Issue {
        details,
        severity: Severity::Info,
        ..issue("SUGGESTION", path)
    }
}

pub fn successful_run(output: &str) -> RunResult {
    RunResult {
        success: true,
        output: output.to_string(),
        exit_code: Some(0),
        ..RunResult::default()
    }
}

pub fn rate_limited_run() -> RunResult {
    RunResult {
        success: false,
        output: String::new(),
        error: Some("Exit code: 1".to_string()),
        exit_code: Some(1),
        rate_limited: true,
        ..RunResult::default()
    }
}

/// Head that only moves when told to.
#[derive(Debug, Default)]
pub struct ScriptedHeadProbe {
    head: Mutex<Option<String>>,
    commits: AtomicUsize,
}

impl ScriptedHeadProbe {
    pub fn at(head: Option<&str>) -> Self {
        Self {
            head: Mutex::new(head.map(str::to_string)),
            commits: AtomicUsize::new(0),
        }
    }

    /// Move the head, if there is one.
    pub fn commit(&self) {
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        let mut head = self.head.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(h) = head.as_mut() {
            *h = format!("{h}.{n}");
        }
    }
}

impl HeadProbe for ScriptedHeadProbe {
    fn head(&self) -> Result<Option<String>> {
        let head = self.head.lock().map_err(|_| anyhow!("head lock poisoned"))?;
        Ok(head.clone())
    }
}

#[derive(Debug, Clone)]
enum StepOutcome {
    Ok(RunResult),
    Err(String),
}

/// What a [`ScriptedRunner`] does for one run.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    outcome: StepOutcome,
    commits: bool,
    delay: Option<Duration>,
}

impl ScriptedStep {
    pub fn ok(result: RunResult) -> Self {
        Self {
            outcome: StepOutcome::Ok(result),
            commits: false,
            delay: None,
        }
    }

    /// The run cannot be carried out at all.
    pub fn error(message: &str) -> Self {
        Self {
            outcome: StepOutcome::Err(message.to_string()),
            commits: false,
            delay: None,
        }
    }

    /// Like [`ScriptedStep::ok`], but moves the runner's head first.
    pub fn committing(result: RunResult) -> Self {
        Self {
            commits: true,
            ..Self::ok(result)
        }
    }

    /// Hold the run open for `delay`, or until the runner is cancelled.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Agent runner driven by queued, routed, and default steps.
///
/// Resolution order per run: the queue (FIFO), the first route whose key
/// appears in the command line, then the default.
#[derive(Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<ScriptedStep>>,
    routes: Mutex<Vec<(String, ScriptedStep)>>,
    default: Option<ScriptedStep>,
    head: Option<Arc<ScriptedHeadProbe>>,
    argvs: Mutex<Vec<Vec<String>>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    cancel: CancellationToken,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_head(mut self, head: Arc<ScriptedHeadProbe>) -> Self {
        self.head = Some(head);
        self
    }

    pub fn with_default(mut self, step: ScriptedStep) -> Self {
        self.default = Some(step);
        self
    }

    pub fn push_ok(&self, result: RunResult) {
        self.push(ScriptedStep::ok(result));
    }

    pub fn push_err(&self, message: &str) {
        self.push(ScriptedStep::error(message));
    }

    pub fn push(&self, step: ScriptedStep) {
        lock(&self.queue).push_back(step);
    }

    pub fn route(&self, key: &str, step: ScriptedStep) {
        lock(&self.routes).push((key.to_string(), step));
    }

    /// Every command line seen, in call order.
    pub fn argvs(&self) -> Vec<Vec<String>> {
        lock(&self.argvs).clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Token that interrupts delayed steps; share it with the orchestrator.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn next_step(&self, argv: &[String]) -> Result<ScriptedStep> {
        if let Some(step) = lock(&self.queue).pop_front() {
            return Ok(step);
        }
        let line = argv.join(" ");
        if let Some((_, step)) = lock(&self.routes).iter().find(|(key, _)| line.contains(key.as_str())) {
            return Ok(step.clone());
        }
        self.default
            .clone()
            .ok_or_else(|| anyhow!("no scripted step for: {line}"))
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(
        &self,
        request: &RunRequest,
        on_event: &mut (dyn FnMut(AgentEvent) + Send),
    ) -> Result<RunResult> {
        let mut argv = request.command.argv.clone();
        if let Some(stdin) = &request.command.stdin {
            argv.push(stdin.clone());
        }
        lock(&self.argvs).push(argv.clone());
        let step = self.next_step(&argv)?;

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let interrupted = match step.delay {
            Some(delay) => tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = self.cancel.cancelled() => true,
            },
            None => false,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        if interrupted {
            return Ok(RunResult {
                success: false,
                error: Some("Cancelled".to_string()),
                cancelled: true,
                duration: Duration::from_millis(1),
                ..RunResult::default()
            });
        }
        match step.outcome {
            StepOutcome::Err(message) => bail!("{message}"),
            StepOutcome::Ok(result) => {
                if step.commits {
                    if let Some(head) = &self.head {
                        head.commit();
                    }
                }
                if !result.output.is_empty() {
                    on_event(AgentEvent::TextDelta {
                        text: result.output.clone(),
                    });
                }
                Ok(result)
            }
        }
    }
}

/// Health source answering from a fixed sequence; the last answer repeats.
pub struct ScriptedHealth {
    reports: Mutex<VecDeque<DoctorReport>>,
    calls: AtomicUsize,
}

impl ScriptedHealth {
    pub fn new(reports: Vec<DoctorReport>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthSource for ScriptedHealth {
    async fn check(&self) -> Result<DoctorReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut reports = lock(&self.reports);
        match reports.len() {
            0 => bail!("no scripted health report"),
            1 => Ok(reports[0].clone()),
            _ => reports.pop_front().ok_or_else(|| anyhow!("no scripted health report")),
        }
    }
}

/// Doctor report with `score` and counts derived from `issues`.
pub fn doctor_report(score: i64, issues: Vec<Issue>) -> DoctorReport {
    let count = |s: Severity| issues.iter().filter(|i| i.severity == s).count();
    DoctorReport {
        snapshot: HealthSnapshot {
            score,
            critical: count(Severity::Critical),
            warning: count(Severity::Warning),
            info: count(Severity::Info),
        },
        issues,
    }
}

/// Narrative writer with a canned answer.
pub struct StaticNarrative {
    answer: std::result::Result<String, String>,
}

impl StaticNarrative {
    pub fn ok(text: &str) -> Self {
        Self {
            answer: Ok(text.to_string()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            answer: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl NarrativeWriter for StaticNarrative {
    fn label(&self) -> String {
        "static".to_string()
    }

    async fn write(&self, _prompt: &str) -> Result<String> {
        self.answer.clone().map_err(|e| anyhow!(e))
    }
}

/// Throwaway git repository with one initial commit.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let repo = Self { dir };
        repo.git_cmd(&["init", "-q"])?;
        repo.git_cmd(&["config", "user.email", "mend@example.com"])?;
        repo.git_cmd(&["config", "user.name", "mend"])?;
        repo.git_cmd(&["config", "commit.gpgsign", "false"])?;
        repo.commit_file("README.md", "# demo\n", "initial")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.dir.path())
    }

    /// Write `name` and commit it.
    pub fn commit_file(&self, name: &str, contents: &str, message: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        let git = self.git();
        git.add_all()?;
        git.commit_staged(message)?;
        Ok(path)
    }

    fn git_cmd(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.dir.path())
            .status()?;
        if !status.success() {
            bail!("git {} failed", args.join(" "));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
