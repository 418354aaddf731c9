//! Session-level tests: health check through interactive phase, pool, and report.
//!
//! Agents are scripted; the health check answers from a fixed sequence and
//! console answers arrive on a pre-filled channel.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use mend::completion::CompletionDetector;
use mend::core::priority::Depth;
use mend::core::provider::Provider;
use mend::interactive::InteractiveResolver;
use mend::io::config::FallbackSettings;
use mend::io::fallback::FallbackConfig;
use mend::io::prompt::PromptEngine;
use mend::io::session_dir::SessionDir;
use mend::orchestrator::{DispatchSettings, Orchestrator, SessionEvent};
use mend::policy::RetryPolicy;
use mend::report::REPORT_FILE;
use mend::session::{PlanOptions, Session};
use mend::test_support::{
    ScriptedHeadProbe, ScriptedHealth, ScriptedRunner, ScriptedStep, StaticNarrative,
    doctor_report, escalation_issue, issue, successful_run, suggestion_issue,
};

struct Fixture {
    health: Arc<ScriptedHealth>,
    runner: Arc<ScriptedRunner>,
    session: Session<Vec<u8>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

fn fixture(
    root: &Path,
    parallel: usize,
    answers: &[&str],
    runner: ScriptedRunner,
    probe: Arc<ScriptedHeadProbe>,
) -> Fixture {
    let items: [(&str, &[&str]); 1] = [("Naming", &["(A) keep", "(B) rename"])];
    let before = doctor_report(
        40,
        vec![
            issue("MONOLITH", "src/big.rs"),
            escalation_issue("docs/api", &items),
            suggestion_issue("docs/guide.md", "add a glossary"),
        ],
    );
    let after = doctor_report(75, vec![]);
    let health = Arc::new(ScriptedHealth::new(vec![before, after]));

    let runner = Arc::new(runner);
    let cancel = runner.cancel_token();
    let fallback = FallbackConfig::load(&root.join(".mend/state/model_fallback.json")).expect("fallback");
    let policy = RetryPolicy::new(runner.clone(), Arc::new(Mutex::new(fallback)), FallbackSettings::default());
    let session_dir = SessionDir::create_with_id(&root.join(".mend"), "test").expect("session dir");
    let settings = DispatchSettings {
        provider: Provider::Claude,
        parallel,
        continue_session: false,
        allowed_tools: None,
        system_prompt: None,
        project_root: root.to_path_buf(),
        timeout: None,
    };
    let (tx, events) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(
        policy,
        CompletionDetector::new(probe),
        session_dir,
        settings,
        cancel.clone(),
    )
    .with_events(tx);

    let (input_tx, input_rx) = mpsc::channel(answers.len().max(1));
    for a in answers {
        input_tx.try_send((*a).to_string()).expect("answer");
    }
    drop(input_tx);

    let session = Session {
        project_root: root.to_path_buf(),
        health: health.clone(),
        prompts: PromptEngine::new().expect("prompts"),
        resolver: InteractiveResolver::new(input_rx, Vec::new()),
        orchestrator,
        narrative: None,
        cancel,
    };
    Fixture {
        health,
        runner,
        session,
        events,
    }
}

fn full_depth() -> PlanOptions {
    PlanOptions {
        depth: Depth::Full,
        ..PlanOptions::default()
    }
}

fn committing_runner(probe: &Arc<ScriptedHeadProbe>) -> ScriptedRunner {
    ScriptedRunner::new()
        .with_head(probe.clone())
        .with_default(ScriptedStep::committing(successful_run("REPAIR COMPLETE")).delayed(Duration::from_millis(20)))
}

#[tokio::test]
async fn full_session_repairs_everything_in_priority_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedHeadProbe::at(Some("base")));
    let f = fixture(temp.path(), 2, &["rename it", "y"], committing_runner(&probe), probe);

    let summary = f.session.run(&full_depth()).await.expect("session");

    let order: Vec<&str> = summary.results.iter().map(|r| r.issue_type.as_str()).collect();
    assert_eq!(order, vec!["ESCALATION", "SUGGESTION", "MONOLITH"]);
    assert!(summary.all_succeeded());
    assert!(!summary.cancelled);
    assert_eq!(summary.counts.completed, 3);
    assert_eq!(summary.before.score, 40);
    assert_eq!(summary.after.score, 75);
    assert_eq!(f.health.calls(), 2);

    let escalation = &summary.results[0];
    assert_eq!(escalation.decisions_made.len(), 1);
    assert_eq!(escalation.decisions_made[0].decision_text, "rename it");
    let prompts: Vec<String> = f.runner.argvs().iter().map(|argv| argv.join(" ")).collect();
    assert!(prompts.iter().any(|p| p.contains("- **Naming**: rename it")));
    assert!(prompts.iter().any(|p| p.contains("add a glossary")));

    let report_path = summary.report_path.expect("report written");
    let report = fs::read_to_string(&report_path).expect("report");
    assert!(report.starts_with("# Repair Report"));
    assert!(report.contains("### Failed Repairs Need Attention"));
    assert!(temp.path().join(".mend/sessions/test").join(REPORT_FILE).exists());
    let session = temp.path().join(".mend/sessions/test");
    for dir in ["01-escalation", "02-suggestion", "03-monolith"] {
        assert!(session.join(dir).join("ISSUE.md").exists(), "{dir}");
    }
}

#[tokio::test]
async fn passed_and_rejected_issues_never_spawn_agents() {
    let temp = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedHeadProbe::at(Some("base")));
    let mut f = fixture(temp.path(), 2, &["pass", "n"], committing_runner(&probe), probe);

    let summary = f.session.run(&full_depth()).await.expect("session");

    assert_eq!(summary.results.len(), 3);
    assert!(summary.all_succeeded());
    assert_eq!(f.runner.argvs().len(), 1, "only the monolith reaches an agent");
    assert!(f.runner.argvs()[0].join(" ").contains("src/big.rs"));
    assert_eq!(summary.counts.total, 1);

    let mut resolved = Vec::new();
    while let Ok(ev) = f.events.try_recv() {
        if let SessionEvent::Resolved { issue_type, dispatched, .. } = ev {
            resolved.push((issue_type, dispatched));
        }
    }
    assert_eq!(
        resolved,
        vec![("ESCALATION".to_string(), false), ("SUGGESTION".to_string(), false)]
    );
}

#[tokio::test]
async fn failed_repair_is_reported_and_does_not_stop_others() {
    let temp = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedHeadProbe::at(Some("base")));
    let runner = committing_runner(&probe);
    runner.route("src/big.rs", ScriptedStep::ok(successful_run("REPAIR COMPLETE")));
    // one at a time: a shared head cannot attribute concurrent commits
    let f = fixture(temp.path(), 1, &["rename it", "y"], runner, probe);

    let summary = f.session.run(&full_depth()).await.expect("session");

    assert!(!summary.all_succeeded());
    let monolith = summary.results.iter().find(|r| r.issue_type == "MONOLITH").expect("monolith");
    assert_eq!(monolith.error.as_deref(), Some("No git commit detected"));
    assert_eq!(summary.results.iter().filter(|r| r.success).count(), 2);
    let report = fs::read_to_string(summary.report_path.expect("report")).expect("read");
    assert!(report.contains("src/big.rs"));
}

#[tokio::test]
async fn narrative_is_used_for_the_report() {
    let temp = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedHeadProbe::at(Some("base")));
    let mut f = fixture(temp.path(), 1, &["pass", "n"], committing_runner(&probe), probe);
    f.session.narrative = Some(Box::new(StaticNarrative::ok("## Executive Summary\n\nDone.")));

    let summary = f.session.run(&full_depth()).await.expect("session");
    let report = fs::read_to_string(summary.report_path.expect("report")).expect("read");
    assert!(report.contains("GENERATED_BY: static"));
    assert!(report.contains("Done."));
}

#[tokio::test]
async fn narrative_report_still_lists_failures_and_decisions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedHeadProbe::at(Some("base")));
    let runner = committing_runner(&probe);
    runner.route("src/big.rs", ScriptedStep::ok(successful_run("REPAIR COMPLETE")));
    let mut f = fixture(temp.path(), 1, &["rename it", "y"], runner, probe);
    f.session.narrative = Some(Box::new(StaticNarrative::ok(
        "## Executive Summary\n\nSome things happened.",
    )));

    let summary = f.session.run(&full_depth()).await.expect("session");
    let report = fs::read_to_string(summary.report_path.expect("report")).expect("read");

    assert!(report.contains("GENERATED_BY: static"));
    let (_, appendix) = report.split_once("Some things happened.").expect("narrative text");
    assert!(appendix.contains("- **Naming** (`docs/api`): rename it"));
    let attention = appendix
        .split("### Failed Repairs Need Attention")
        .nth(1)
        .expect("attention section");
    assert!(attention.contains("- `src/big.rs` (MONOLITH): No git commit detected"));
}

#[tokio::test]
async fn cancellation_returns_partial_results_and_skips_final_check() {
    let temp = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedHeadProbe::at(Some("base")));
    let runner = ScriptedRunner::new()
        .with_head(probe.clone())
        .with_default(ScriptedStep::committing(successful_run("ok")).delayed(Duration::from_secs(30)));
    let mut f = fixture(temp.path(), 1, &["rename it", "y"], runner, probe);
    f.session.narrative = Some(Box::new(StaticNarrative::ok("never used")));

    let cancel = f.runner.cancel_token();
    let mut events = f.events;
    let watcher = tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            if let SessionEvent::Dispatched { .. } = ev {
                cancel.cancel();
            }
        }
    });

    let summary = tokio::time::timeout(Duration::from_secs(10), f.session.run(&full_depth()))
        .await
        .expect("session stops promptly")
        .expect("session");
    watcher.await.expect("watcher");

    assert!(summary.cancelled);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].error.as_deref(), Some("Cancelled"));
    assert_eq!(summary.not_dispatched, 2);
    assert_eq!(summary.counts.queued, 2);
    assert_eq!(summary.after, summary.before);
    assert_eq!(f.health.calls(), 1);
    let report = fs::read_to_string(summary.report_path.expect("report")).expect("read");
    assert!(!report.contains("GENERATED_BY"));
}
