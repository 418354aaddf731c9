//! Rate-limit downgrade across runs and across sessions.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mend::completion::CompletionDetector;
use mend::core::protocol::AgentEvent;
use mend::core::provider::{CommandRequest, Provider};
use mend::core::types::{AgentIdentity, AgentRole};
use mend::io::config::FallbackSettings;
use mend::io::fallback::FallbackConfig;
use mend::io::session_dir::SessionDir;
use mend::orchestrator::{DispatchSettings, Job, Orchestrator};
use mend::policy::{RetryPolicy, RunTarget};
use mend::test_support::{
    ScriptedHeadProbe, ScriptedRunner, ScriptedStep, issue, rate_limited_run, successful_run,
};

fn fallback_path(root: &Path) -> std::path::PathBuf {
    root.join(".mend/state/model_fallback.json")
}

fn orchestrator(root: &Path, runner: Arc<ScriptedRunner>, probe: Arc<ScriptedHeadProbe>) -> Orchestrator {
    let fallback = FallbackConfig::load(&fallback_path(root)).expect("fallback");
    let policy = RetryPolicy::new(runner, Arc::new(Mutex::new(fallback)), FallbackSettings::default());
    let settings = DispatchSettings {
        provider: Provider::Gemini,
        parallel: 1,
        continue_session: true,
        allowed_tools: None,
        system_prompt: None,
        project_root: root.to_path_buf(),
        timeout: None,
    };
    let session = SessionDir::create_with_id(&root.join(".mend"), "fallback").expect("session");
    Orchestrator::new(
        policy,
        CompletionDetector::new(probe),
        session,
        settings,
        CancellationToken::new(),
    )
}

fn job(index: usize, path: &str) -> Job {
    Job {
        index,
        issue: issue("NO_DOCS_REF", path),
        prompt: format!("link docs for {path}"),
        decisions: Vec::new(),
    }
}

fn model_of(argv: &[String]) -> Option<&str> {
    argv.iter()
        .position(|a| a == "--model")
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

#[tokio::test]
async fn later_runs_start_on_the_downgraded_model() {
    let temp = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedHeadProbe::at(Some("h")));
    let runner = Arc::new(
        ScriptedRunner::new()
            .with_head(probe.clone())
            .with_default(ScriptedStep::committing(successful_run("done"))),
    );
    runner.push_ok(rate_limited_run());

    let outcome = orchestrator(temp.path(), runner.clone(), probe)
        .run_pool(vec![job(0, "src/a.rs"), job(1, "src/b.rs")])
        .await;
    assert!(outcome.results.iter().flatten().all(|r| r.success));

    let models: Vec<Option<String>> = runner
        .argvs()
        .iter()
        .map(|argv| model_of(argv).map(str::to_string))
        .collect();
    assert_eq!(
        models,
        vec![
            Some("gemini-3-flash-preview".to_string()),
            Some("gemini-2.5-flash".to_string()),
            Some("gemini-2.5-flash".to_string()),
        ]
    );
    // gemini ignores continuation instead of failing the build
    assert!(runner.argvs().iter().all(|argv| !argv.contains(&"--continue".to_string())));
}

#[tokio::test]
async fn downgrade_survives_a_new_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedHeadProbe::at(Some("h")));
    let first = Arc::new(ScriptedRunner::new().with_head(probe.clone()));
    first.push_ok(rate_limited_run());
    first.push(ScriptedStep::committing(successful_run("done")));
    orchestrator(temp.path(), first, probe.clone())
        .run_pool(vec![job(0, "src/a.rs")])
        .await;

    let reloaded = FallbackConfig::load(&fallback_path(temp.path())).expect("reload");
    let id = AgentIdentity::new(Provider::Gemini, AgentRole::Repair);
    assert_eq!(reloaded.current_model(&id), Some("gemini-2.5-flash"));
    let narrative = AgentIdentity::new(Provider::Gemini, AgentRole::Narrative);
    assert_eq!(reloaded.current_model(&narrative), None);

    let second = Arc::new(
        ScriptedRunner::new()
            .with_head(probe.clone())
            .with_default(ScriptedStep::committing(successful_run("done"))),
    );
    orchestrator(temp.path(), second.clone(), probe)
        .run_pool(vec![job(0, "src/c.rs")])
        .await;
    assert_eq!(model_of(&second.argvs()[0]), Some("gemini-2.5-flash"));
}

#[tokio::test]
async fn concurrent_downgrades_never_move_back_up_the_chain() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = fallback_path(temp.path());
    let runner = Arc::new(ScriptedRunner::new());
    // both start on the top model; "fix a" walks the whole chain while "fix b" is still running
    runner.route("gemini-2.5-flash-lite", ScriptedStep::ok(successful_run("done")));
    runner.route("gemini-2.5-flash", ScriptedStep::ok(rate_limited_run()));
    runner.route("fix a", ScriptedStep::ok(rate_limited_run()).delayed(Duration::from_millis(50)));
    runner.route("fix b", ScriptedStep::ok(rate_limited_run()).delayed(Duration::from_millis(400)));

    let settings = FallbackSettings {
        max_attempts: 3,
        ..FallbackSettings::default()
    };
    let fallback = Arc::new(Mutex::new(FallbackConfig::load(&path).expect("fallback")));
    let policy = RetryPolicy::new(runner.clone(), fallback, settings);
    let id = AgentIdentity::new(Provider::Gemini, AgentRole::Repair);
    let target = RunTarget {
        cwd: temp.path().to_path_buf(),
        artifacts: None,
        timeout: None,
    };
    let request = |prompt: &str| CommandRequest {
        prompt: prompt.to_string(),
        ..CommandRequest::default()
    };
    let (fast_req, slow_req) = (request("fix a"), request("fix b"));
    let mut on_fast = |_: AgentEvent| {};
    let mut on_slow = |_: AgentEvent| {};

    let (fast, slow) = tokio::join!(
        policy.run(id, &fast_req, &target, &mut on_fast),
        policy.run(id, &slow_req, &target, &mut on_slow),
    );
    let (fast, slow) = (fast.expect("fast"), slow.expect("slow"));

    assert_eq!(fast.model.as_deref(), Some("gemini-2.5-flash-lite"));
    assert!(fast.result.success);
    // the slow worker would have stepped to 2.5-flash; it joins lite instead
    assert_eq!(slow.model.as_deref(), Some("gemini-2.5-flash-lite"));
    assert!(slow.result.success);
    let argvs = runner.argvs();
    let slow_models: Vec<Option<&str>> = argvs
        .iter()
        .filter(|argv| argv.contains(&"fix b".to_string()))
        .map(|argv| model_of(argv))
        .collect();
    assert_eq!(
        slow_models,
        vec![Some("gemini-3-flash-preview"), Some("gemini-2.5-flash-lite")]
    );

    let reloaded = FallbackConfig::load(&path).expect("reload");
    assert_eq!(reloaded.current_model(&id), Some("gemini-2.5-flash-lite"));
}
