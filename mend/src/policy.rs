//! Retry and model-fallback policy around an [`AgentRunner`].
//!
//! Two independent layers compose here:
//!
//! - **Continuation retry**: the first run asks the provider to resume its
//!   previous session; if that run cannot be carried out at all (`Err`), it is
//!   retried once without continuation. A run that merely fails, times out,
//!   or is cancelled is not retried.
//! - **Rate-limit downgrade**: for providers that accept a model override, a
//!   rate-limit signal moves the agent identity one step down the configured
//!   model chain, persists that choice, and re-runs the same request. Bounded
//!   by `fallback.max_attempts`. A successful run is never re-run, and the
//!   persisted model only ever moves down the chain.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentRunner, RunRequest, RunResult};
use crate::core::protocol::AgentEvent;
use crate::core::provider::{CommandRequest, build};
use crate::core::types::AgentIdentity;
use crate::io::config::FallbackSettings;
use crate::io::fallback::FallbackConfig;
use crate::io::session_dir::AgentDir;

/// Where and how long a policy-wrapped request runs.
#[derive(Debug, Clone)]
pub struct RunTarget {
    pub cwd: PathBuf,
    pub artifacts: Option<AgentDir>,
    pub timeout: Option<Duration>,
}

/// Final run plus what the policy did to get there.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub result: RunResult,
    /// Model override used for the final run.
    pub model: Option<String>,
    /// Physical runs, counting continuation retries.
    pub runs: u32,
}

#[derive(Clone)]
pub struct RetryPolicy {
    runner: Arc<dyn AgentRunner>,
    fallback: Arc<Mutex<FallbackConfig>>,
    settings: FallbackSettings,
}

impl RetryPolicy {
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        fallback: Arc<Mutex<FallbackConfig>>,
        settings: FallbackSettings,
    ) -> Self {
        Self {
            runner,
            fallback,
            settings,
        }
    }

    /// Model the next run for `identity` starts with, if the provider takes one.
    pub fn starting_model(&self, identity: &AgentIdentity) -> Result<Option<String>> {
        if !identity.provider.supports_model_override() {
            return Ok(None);
        }
        let fallback = self
            .fallback
            .lock()
            .map_err(|_| anyhow!("fallback state lock poisoned"))?;
        Ok(fallback
            .current_model(identity)
            .map(str::to_string)
            .or_else(|| self.settings.models.first().cloned()))
    }

    #[instrument(skip_all, fields(agent = %identity))]
    pub async fn run(
        &self,
        identity: AgentIdentity,
        base: &CommandRequest,
        target: &RunTarget,
        on_event: &mut (dyn FnMut(AgentEvent) + Send),
    ) -> Result<PolicyOutcome> {
        let mut model = self.starting_model(&identity)?;
        let max_attempts = self.settings.max_attempts.max(1);
        let mut runs = 0;
        let mut attempt = 1;
        loop {
            let request = CommandRequest {
                model_override: model.clone(),
                ..base.clone()
            };
            let (result, used) = self
                .run_with_continuation(identity, &request, target, on_event)
                .await?;
            runs += used;

            if result.success || !result.rate_limited || attempt >= max_attempts {
                if result.rate_limited && !result.success {
                    warn!(attempt, "rate limited, no attempts left");
                }
                return Ok(PolicyOutcome {
                    result,
                    model,
                    runs,
                });
            }
            let Some(current) = model.as_deref() else {
                warn!("rate limited, provider has no model fallback");
                return Ok(PolicyOutcome {
                    result,
                    model,
                    runs,
                });
            };
            let Some(next) = next_model(&self.settings.models, current) else {
                warn!(model = current, "rate limited, fallback chain exhausted");
                return Ok(PolicyOutcome {
                    result,
                    model,
                    runs,
                });
            };

            info!(from = current, to = next, attempt, "downgrading model after rate limit");
            model = Some(self.advance(&identity, next)?);
            attempt += 1;
        }
    }

    /// Persist `next` unless a concurrent run already moved `identity` at least
    /// as far down the chain; returns the model the retry should use.
    fn advance(&self, identity: &AgentIdentity, next: &str) -> Result<String> {
        let mut fallback = self
            .fallback
            .lock()
            .map_err(|_| anyhow!("fallback state lock poisoned"))?;
        let rank = |model: &str| self.settings.models.iter().position(|m| m == model);
        if let Some(persisted) = fallback.current_model(identity)
            && let (Some(have), Some(want)) = (rank(persisted), rank(next))
            && have >= want
        {
            debug!(persisted, skipped = next, "already downgraded further by another run");
            return Ok(persisted.to_string());
        }
        fallback.record(identity, next)?;
        Ok(next.to_string())
    }

    /// Returns the result and the number of physical runs it took (1 or 2).
    async fn run_with_continuation(
        &self,
        identity: AgentIdentity,
        request: &CommandRequest,
        target: &RunTarget,
        on_event: &mut (dyn FnMut(AgentEvent) + Send),
    ) -> Result<(RunResult, u32)> {
        let provider = identity.provider;
        let continuation = request.continue_session && provider.supports_continuation();
        let first = CommandRequest {
            continue_session: continuation,
            ..request.clone()
        };
        let run_request = self.run_request(identity, &first, target)?;
        match self.runner.run(&run_request, &mut *on_event).await {
            Ok(result) => Ok((result, 1)),
            Err(err) if continuation => {
                warn!(err = %format!("{err:#}"), "continuation run failed, retrying fresh");
                let fresh = CommandRequest {
                    continue_session: false,
                    ..request.clone()
                };
                let run_request = self.run_request(identity, &fresh, target)?;
                let result = self.runner.run(&run_request, &mut *on_event).await?;
                Ok((result, 2))
            }
            Err(err) => Err(err),
        }
    }

    fn run_request(
        &self,
        identity: AgentIdentity,
        request: &CommandRequest,
        target: &RunTarget,
    ) -> Result<RunRequest> {
        let command = build(identity.provider, request)?;
        Ok(RunRequest {
            command,
            protocol: identity.provider.protocol(),
            output: request.output,
            cwd: target.cwd.clone(),
            artifacts: target.artifacts.clone(),
            timeout: target.timeout,
        })
    }
}

/// The model after `current` in `chain`; unknown models restart at the top.
pub fn next_model<'a>(chain: &'a [String], current: &str) -> Option<&'a str> {
    match chain.iter().position(|m| m == current) {
        Some(i) => chain.get(i + 1).map(String::as_str),
        None => chain.first().map(String::as_str).filter(|m| *m != current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::Provider;
    use crate::core::types::AgentRole;
    use crate::test_support::{ScriptedRunner, rate_limited_run, successful_run};

    fn chain() -> Vec<String> {
        FallbackSettings::default().models
    }

    fn policy(runner: Arc<ScriptedRunner>, path: &std::path::Path) -> RetryPolicy {
        let fallback = FallbackConfig::load(path).expect("load");
        RetryPolicy::new(runner, Arc::new(Mutex::new(fallback)), FallbackSettings::default())
    }

    fn target(dir: &std::path::Path) -> RunTarget {
        RunTarget {
            cwd: dir.to_path_buf(),
            artifacts: None,
            timeout: None,
        }
    }

    fn request(continue_session: bool) -> CommandRequest {
        CommandRequest {
            prompt: "fix it".to_string(),
            continue_session,
            ..CommandRequest::default()
        }
    }

    #[test]
    fn next_model_walks_the_chain() {
        let chain = chain();
        assert_eq!(next_model(&chain, "gemini-3-flash-preview"), Some("gemini-2.5-flash"));
        assert_eq!(next_model(&chain, "gemini-2.5-flash-lite"), None);
        assert_eq!(next_model(&chain, "custom"), Some("gemini-3-flash-preview"));
        assert_eq!(next_model(&[], "x"), None);
    }

    #[tokio::test]
    async fn continuation_error_retries_once_without_continuation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_err("spawn failed");
        runner.push_ok(successful_run("done"));
        let policy = policy(runner.clone(), &temp.path().join("fb.json"));

        let id = AgentIdentity::new(Provider::Claude, AgentRole::Repair);
        let outcome = policy
            .run(id, &request(true), &target(temp.path()), &mut |_| {})
            .await
            .expect("run");
        assert!(outcome.result.success);
        assert_eq!(outcome.runs, 2);

        let argvs = runner.argvs();
        assert!(argvs[0].contains(&"--continue".to_string()));
        assert!(!argvs[1].contains(&"--continue".to_string()));
    }

    #[tokio::test]
    async fn failed_run_is_not_retried() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok(RunResult {
            success: false,
            timed_out: true,
            error: Some("Timed out after 600s".to_string()),
            ..RunResult::default()
        });
        let policy = policy(runner.clone(), &temp.path().join("fb.json"));
        let id = AgentIdentity::new(Provider::Claude, AgentRole::Repair);
        let outcome = policy
            .run(id, &request(true), &target(temp.path()), &mut |_| {})
            .await
            .expect("run");
        assert!(outcome.result.timed_out);
        assert_eq!(runner.argvs().len(), 1);
    }

    #[tokio::test]
    async fn second_error_propagates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_err("first");
        runner.push_err("second");
        let policy = policy(runner.clone(), &temp.path().join("fb.json"));
        let id = AgentIdentity::new(Provider::Codex, AgentRole::Repair);
        let err = policy
            .run(id, &request(true), &target(temp.path()), &mut |_| {})
            .await
            .expect_err("both runs fail");
        assert!(err.to_string().contains("second"));
        assert_eq!(runner.argvs().len(), 2);
    }

    #[tokio::test]
    async fn rate_limit_downgrades_and_persists_before_retry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("model_fallback.json");
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok(rate_limited_run());
        runner.push_ok(successful_run("ok"));
        let policy = policy(runner.clone(), &path);

        let id = AgentIdentity::new(Provider::Gemini, AgentRole::Repair);
        let outcome = policy
            .run(id, &request(true), &target(temp.path()), &mut |_| {})
            .await
            .expect("run");
        assert!(outcome.result.success);
        assert_eq!(outcome.model.as_deref(), Some("gemini-2.5-flash"));

        let argvs = runner.argvs();
        assert!(argvs[0].contains(&"gemini-3-flash-preview".to_string()));
        assert!(argvs[1].contains(&"gemini-2.5-flash".to_string()));
        assert!(!argvs[0].contains(&"--continue".to_string()));

        let persisted = FallbackConfig::load(&path).expect("reload");
        assert_eq!(persisted.current_model(&id), Some("gemini-2.5-flash"));
    }

    #[tokio::test]
    async fn successful_run_is_kept_despite_rate_limit_signal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fb.json");
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok(RunResult {
            rate_limited: true,
            ..successful_run("fixed, after a 429 warning")
        });
        runner.push_ok(successful_run("second run"));
        let policy = policy(runner.clone(), &path);

        let id = AgentIdentity::new(Provider::Gemini, AgentRole::Repair);
        let outcome = policy
            .run(id, &request(false), &target(temp.path()), &mut |_| {})
            .await
            .expect("run");
        assert!(outcome.result.success);
        assert_eq!(outcome.runs, 1);
        assert_eq!(outcome.model.as_deref(), Some("gemini-3-flash-preview"));
        assert_eq!(runner.argvs().len(), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rate_limit_is_ignored_for_providers_without_override() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fb.json");
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok(rate_limited_run());
        let policy = policy(runner.clone(), &path);
        let id = AgentIdentity::new(Provider::Claude, AgentRole::Repair);
        let outcome = policy
            .run(id, &request(false), &target(temp.path()), &mut |_| {})
            .await
            .expect("run");
        assert!(outcome.result.rate_limited);
        assert_eq!(runner.argvs().len(), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn downgrade_loop_is_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new());
        for _ in 0..5 {
            runner.push_ok(rate_limited_run());
        }
        let policy = policy(runner.clone(), &temp.path().join("fb.json"));
        let id = AgentIdentity::new(Provider::Gemini, AgentRole::Narrative);
        let outcome = policy
            .run(id, &request(false), &target(temp.path()), &mut |_| {})
            .await
            .expect("run");
        assert!(!outcome.result.success);
        assert_eq!(runner.argvs().len(), 2);
    }
}
