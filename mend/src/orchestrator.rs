//! Bounded, pull-based worker pool.
//!
//! `parallel` workers each loop: take the next queued job from the shared
//! [`SchedulerState`], run it to completion through the retry policy, verify
//! it, record the result, and go back for more. A worker that finds the
//! queue empty (or the session cancelled) exits; the pool returns once every
//! worker has exited. Cancellation kills in-flight agents through the
//! runner's token and leaves undispatched jobs queued.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::completion::CompletionDetector;
use crate::core::decisions::parse_agent_decisions;
use crate::core::protocol::AgentEvent;
use crate::core::provider::{CommandRequest, OutputMode, Provider};
use crate::core::scheduler::{SchedulerCounts, SchedulerState, TransitionError};
use crate::core::types::{AgentIdentity, AgentRole, EscalationDecision, Issue, RepairResult};
use crate::io::session_dir::SessionDir;
use crate::policy::{RetryPolicy, RunTarget};

/// Lifecycle notifications for whoever renders progress.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Queued {
        total: usize,
    },
    Dispatched {
        job: usize,
        issue_type: String,
        path: String,
    },
    Agent {
        job: usize,
        event: AgentEvent,
    },
    Finished {
        job: usize,
        success: bool,
        error: Option<String>,
    },
    /// An escalation or suggestion was settled before the pool opened.
    Resolved {
        issue_type: String,
        path: String,
        dispatched: bool,
    },
    Counts(SchedulerCounts),
}

/// One issue ready for dispatch: prompt rendered, human decisions injected.
#[derive(Debug, Clone)]
pub struct Job {
    /// Position in the session, used to name the agent folder.
    pub index: usize,
    pub issue: Issue,
    pub prompt: String,
    pub decisions: Vec<EscalationDecision>,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub provider: Provider,
    pub parallel: usize,
    pub continue_session: bool,
    pub allowed_tools: Option<String>,
    pub system_prompt: Option<String>,
    pub project_root: PathBuf,
    /// Overrides the runner's default per-run timeout.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct PoolOutcome {
    /// Indexed by job; `None` for jobs never dispatched.
    pub results: Vec<Option<RepairResult>>,
    pub counts: SchedulerCounts,
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    policy: RetryPolicy,
    detector: CompletionDetector,
    session: SessionDir,
    settings: Arc<DispatchSettings>,
    cancel: CancellationToken,
    events: Option<UnboundedSender<SessionEvent>>,
}

type Shared<T> = Arc<Mutex<T>>;

impl Orchestrator {
    pub fn new(
        policy: RetryPolicy,
        detector: CompletionDetector,
        session: SessionDir,
        settings: DispatchSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            policy,
            detector,
            session,
            settings: Arc::new(settings),
            cancel,
            events: None,
        }
    }

    pub fn session_dir(&self) -> &SessionDir {
        &self.session
    }

    pub fn with_events(mut self, events: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            // A gone consumer only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    /// Run `jobs` through the pool and wait for every worker to exit.
    #[instrument(skip_all, fields(jobs = jobs.len(), parallel = self.settings.parallel))]
    pub async fn run_pool(&self, jobs: Vec<Job>) -> PoolOutcome {
        let total = jobs.len();
        let state: Shared<SchedulerState> =
            Arc::new(Mutex::new(SchedulerState::new(total, self.settings.parallel)));
        let results: Shared<Vec<Option<RepairResult>>> = Arc::new(Mutex::new(vec![None; total]));
        let jobs = Arc::new(jobs);
        self.emit(SessionEvent::Queued { total });

        let workers = self.settings.parallel.max(1).min(total);
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let this = self.clone();
            let jobs = Arc::clone(&jobs);
            let state = Arc::clone(&state);
            let results = Arc::clone(&results);
            set.spawn(async move { this.worker(worker, jobs, state, results).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(err = %e, "worker task failed");
            }
        }

        let counts = lock(&state).counts();
        let results = std::mem::take(&mut *lock(&results));
        let cancelled = self.cancel.is_cancelled();
        info!(completed = counts.completed, failed = counts.failed, queued = counts.queued, cancelled, "pool drained");
        PoolOutcome {
            results,
            counts,
            cancelled,
        }
    }

    async fn worker(
        self,
        worker: usize,
        jobs: Arc<Vec<Job>>,
        state: Shared<SchedulerState>,
        results: Shared<Vec<Option<RepairResult>>>,
    ) {
        loop {
            if self.cancel.is_cancelled() {
                debug!(worker, "cancelled, not pulling more work");
                return;
            }
            let (id, counts) = {
                let mut state = lock(&state);
                let Some(id) = state.dispatch_next() else {
                    debug!(worker, "queue empty");
                    return;
                };
                (id, state.counts())
            };
            let job = &jobs[id];
            self.emit(SessionEvent::Dispatched {
                job: id,
                issue_type: job.issue.canonical_type(),
                path: job.issue.path.clone(),
            });
            self.emit(SessionEvent::Counts(counts));

            let result = self.execute(id, job, &state).await;

            let counts = {
                let mut state = lock(&state);
                report_transition(state.finish(id, result.success));
                state.counts()
            };
            self.emit(SessionEvent::Finished {
                job: id,
                success: result.success,
                error: result.error.clone(),
            });
            self.emit(SessionEvent::Counts(counts));
            lock(&results)[id] = Some(result);
        }
    }

    #[instrument(skip_all, fields(job = id, issue_type = %job.issue.issue_type, path = %job.issue.path))]
    async fn execute(&self, id: usize, job: &Job, state: &Shared<SchedulerState>) -> RepairResult {
        let settings = &self.settings;
        let provider = settings.provider;
        let failed = |error: String| RepairResult {
            provider_used: Some(provider),
            decisions_made: job.decisions.clone(),
            ..RepairResult::not_attempted(&job.issue, error)
        };

        let dir = match self.session.seed_agent_dir(
            job.index,
            &job.issue,
            &job.prompt,
            provider,
            &settings.project_root,
        ) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(err = %format!("{e:#}"), "failed to prepare agent folder");
                return failed(format!("prepare agent folder: {e:#}"));
            }
        };
        let request = CommandRequest {
            prompt: job.prompt.clone(),
            system_prompt: settings.system_prompt.clone(),
            continue_session: settings.continue_session,
            model_override: None,
            allowed_tools: settings.allowed_tools.clone(),
            work_dir: Some(settings.project_root.clone()),
            output: OutputMode::Stream,
        };
        let target = RunTarget {
            cwd: dir.path().to_path_buf(),
            artifacts: Some(dir),
            timeout: settings.timeout,
        };

        report_transition(lock(state).mark_running(id));
        let baseline = self.detector.baseline();
        let identity = AgentIdentity::new(provider, AgentRole::Repair);
        let outcome = self
            .policy
            .run(identity, &request, &target, &mut |event| {
                self.emit(SessionEvent::Agent { job: id, event });
            })
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(err = %format!("{e:#}"), "agent run could not be carried out");
                return failed(format!("{e:#}"));
            }
        };

        let verdict = self.detector.verdict(&baseline, &outcome.result);
        let run = outcome.result;
        info!(success = verdict.success, secs = run.duration.as_secs_f64(), "repair finished");
        RepairResult {
            issue_type: job.issue.canonical_type(),
            target_path: job.issue.path.clone(),
            success: verdict.success,
            agent_decisions: parse_agent_decisions(&run.output),
            agent_output: run.output,
            duration: run.duration,
            error: verdict.error,
            exit_code: run.exit_code,
            decisions_made: job.decisions.clone(),
            provider_used: Some(provider),
            verification: verdict.verification,
        }
    }
}

/// Locks even if another worker panicked while holding the guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn report_transition(result: Result<(), TransitionError>) {
    if let Err(e) = result {
        error!(err = %e, "scheduler transition rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::FallbackSettings;
    use crate::io::fallback::FallbackConfig;
    use crate::test_support::{ScriptedHeadProbe, ScriptedRunner, ScriptedStep, issue, successful_run};
    use crate::core::types::Verification;
    use tokio::sync::mpsc;

    struct Harness {
        _temp: tempfile::TempDir,
        runner: Arc<ScriptedRunner>,
        orchestrator: Orchestrator,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn harness(parallel: usize, runner: ScriptedRunner, probe: Arc<ScriptedHeadProbe>) -> Harness {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(runner);
        let fallback = FallbackConfig::load(&temp.path().join("fb.json")).expect("load");
        let policy = RetryPolicy::new(
            runner.clone(),
            Arc::new(Mutex::new(fallback)),
            FallbackSettings::default(),
        );
        let session = SessionDir::create_with_id(&temp.path().join(".mend"), "t").expect("session");
        let settings = DispatchSettings {
            provider: Provider::Claude,
            parallel,
            continue_session: false,
            allowed_tools: None,
            system_prompt: None,
            project_root: temp.path().to_path_buf(),
            timeout: None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(
            policy,
            CompletionDetector::new(probe),
            session,
            settings,
            runner.cancel_token(),
        )
        .with_events(tx);
        Harness {
            _temp: temp,
            runner,
            orchestrator,
            events: rx,
        }
    }

    fn jobs(n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| Job {
                index: i,
                issue: issue("MONOLITH", &format!("src/m{i}.rs")),
                prompt: format!("split src/m{i}.rs"),
                decisions: Vec::new(),
            })
            .collect()
    }

    fn finished(results: Vec<Option<RepairResult>>) -> Vec<RepairResult> {
        results.into_iter().flatten().collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn pool_never_exceeds_capacity_and_counts_stay_consistent() {
        let probe = Arc::new(ScriptedHeadProbe::at(Some("h")));
        let runner = ScriptedRunner::new()
            .with_head(probe.clone())
            .with_default(ScriptedStep::committing(successful_run("ok")).delayed(Duration::from_millis(30)));
        let mut h = harness(2, runner, probe);

        let outcome = h.orchestrator.run_pool(jobs(7)).await;
        assert!(outcome.results.iter().all(Option::is_some));
        assert_eq!(outcome.counts.completed, 7);
        assert_eq!(outcome.counts.running, 0);
        assert!(h.runner.peak_concurrency() <= 2);
        assert!(h.runner.peak_concurrency() >= 1);

        for ev in drain(&mut h.events) {
            if let SessionEvent::Counts(c) = ev {
                assert!(c.running <= 2, "{c:?}");
                assert!(c.is_consistent(), "{c:?}");
            }
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_pool() {
        let probe = Arc::new(ScriptedHeadProbe::at(Some("h")));
        let runner = ScriptedRunner::new()
            .with_head(probe.clone())
            .with_default(ScriptedStep::committing(successful_run("ok")));
        runner.route("src/m1.rs", ScriptedStep::error("pipe broke"));
        let h = harness(3, runner, probe);

        let outcome = h.orchestrator.run_pool(jobs(4)).await;
        let results = finished(outcome.results);
        assert_eq!(results.len(), 4);
        assert_eq!(outcome.counts.failed, 1);
        let failed = &results[1];
        assert!(!failed.success);
        assert!(failed.error.as_deref().unwrap_or_default().contains("pipe broke"));
        assert_eq!(results.iter().filter(|r| r.success).count(), 3);
    }

    #[tokio::test]
    async fn zero_exit_without_commit_is_failed() {
        let probe = Arc::new(ScriptedHeadProbe::at(Some("h")));
        let runner = ScriptedRunner::new().with_default(ScriptedStep::ok(successful_run("REPAIR COMPLETE")));
        let h = harness(1, runner, probe);
        let outcome = h.orchestrator.run_pool(jobs(1)).await;
        let results = finished(outcome.results);
        let result = &results[0];
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("No git commit detected"));
        assert!(matches!(result.verification, Verification::NoCommit { .. }));
        assert_eq!(result.provider_used, Some(Provider::Claude));
    }

    #[tokio::test]
    async fn agent_decisions_are_attached() {
        let probe = Arc::new(ScriptedHeadProbe::at(Some("h")));
        let output = "### DECISION: naming\n- Conflict: a vs b\n- Resolution: a\n- Reasoning: shorter\n";
        let runner = ScriptedRunner::new()
            .with_head(probe.clone())
            .with_default(ScriptedStep::committing(successful_run(output)));
        let h = harness(1, runner, probe);
        let outcome = h.orchestrator.run_pool(jobs(1)).await;
        let results = finished(outcome.results);
        assert_eq!(results[0].agent_decisions.len(), 1);
        assert_eq!(results[0].agent_decisions[0].name, "naming");
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_and_keeps_finished_results() {
        let probe = Arc::new(ScriptedHeadProbe::at(Some("h")));
        let runner = ScriptedRunner::new()
            .with_head(probe.clone())
            .with_default(ScriptedStep::committing(successful_run("ok")).delayed(Duration::from_millis(50)));
        runner.route("src/m2.rs", ScriptedStep::committing(successful_run("slow")).delayed(Duration::from_secs(30)));
        let h = harness(1, runner, probe);

        let cancel = h.runner.cancel_token();
        let mut events = h.events;
        let watcher = tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                if let SessionEvent::Dispatched { job: 2, .. } = ev {
                    cancel.cancel();
                }
            }
        });
        let outcome = h.orchestrator.run_pool(jobs(5)).await;
        drop(h.orchestrator);
        watcher.await.expect("watcher");

        assert!(outcome.cancelled);
        assert_eq!(outcome.counts.running, 0);
        assert_eq!(outcome.counts.queued, 2);
        assert!(outcome.results[3].is_none() && outcome.results[4].is_none());
        let results = finished(outcome.results);
        assert_eq!(results.len(), 3);
        assert!(results[0].success && results[1].success);
        assert!(!results[2].success);
        assert_eq!(results[2].error.as_deref(), Some("Cancelled"));
    }
}
