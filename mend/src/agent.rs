//! Agent runner: owns one provider subprocess end to end.
//!
//! The [`AgentRunner`] trait is the seam between the retry policy and the
//! actual process backend. Tests use scripted runners that return
//! predetermined results without spawning processes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::protocol::{
    AgentEvent, ErrorKind, parse_line, plain_text_signals_rate_limit,
};
use crate::core::provider::{OutputMode, Protocol, ProviderCommand};
use crate::io::process::{ProcessLimits, run_streaming};
use crate::io::session_dir::AgentDir;

/// One physical agent run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: ProviderCommand,
    pub protocol: Protocol,
    pub output: OutputMode,
    /// Process working directory; one per agent so runs never share files.
    pub cwd: PathBuf,
    /// Seeded agent folder receiving the raw stream and the log.
    pub artifacts: Option<AgentDir>,
    /// Overrides the runner's default timeout.
    pub timeout: Option<Duration>,
}

/// Outcome of one physical run, as observed from the process alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    /// A rate-limit signal was seen on stdout or stderr.
    pub rate_limited: bool,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run `request`, calling `on_event` for every decoded event in stream order.
    ///
    /// `Err` means the run could not be carried out (spawn failure, broken
    /// pipe). A process that ran and failed is an `Ok` with `success == false`.
    async fn run(
        &self,
        request: &RunRequest,
        on_event: &mut (dyn FnMut(AgentEvent) + Send),
    ) -> Result<RunResult>;
}

/// Runner that spawns the provider CLI.
#[derive(Debug, Clone)]
pub struct ProcessAgentRunner {
    limits: ProcessLimits,
    cancel: CancellationToken,
}

impl ProcessAgentRunner {
    pub fn new(limits: ProcessLimits, cancel: CancellationToken) -> Self {
        Self { limits, cancel }
    }
}

/// Accumulates output while events stream past.
#[derive(Default)]
struct Observed {
    text: String,
    final_result: Option<String>,
    events: usize,
    rate_limited: bool,
}

impl Observed {
    fn observe(&mut self, event: &AgentEvent) {
        self.events += 1;
        match event {
            AgentEvent::TextDelta { text } => self.text.push_str(text),
            AgentEvent::RawLine { text } => {
                self.text.push_str(text);
                self.text.push('\n');
            }
            AgentEvent::Result { text } => self.final_result = Some(text.clone()),
            AgentEvent::Error {
                kind: ErrorKind::RateLimit,
                message,
                ..
            } => {
                warn!(message = %message, "rate limit signalled by agent");
                self.rate_limited = true;
            }
            AgentEvent::Error {
                kind: ErrorKind::UnknownRecord,
                message,
                ..
            } => warn!(record = %message, "unknown protocol record"),
            AgentEvent::Error {
                kind: ErrorKind::Malformed,
                message,
                ..
            } => debug!(message = %message, "malformed protocol record"),
            AgentEvent::Error { message, .. } => warn!(message = %message, "agent reported error"),
            AgentEvent::ToolCall { .. } | AgentEvent::Thinking { .. } => {}
        }
    }

    fn into_output(self) -> String {
        if self.text.trim().is_empty() {
            self.final_result.unwrap_or_default()
        } else {
            self.text
        }
    }
}

/// Decode one stdout line according to the requested output mode.
fn decode(protocol: Protocol, output: OutputMode, line: &str) -> Vec<AgentEvent> {
    match output {
        OutputMode::Stream => parse_line(protocol, line),
        OutputMode::Text => {
            let mut events = vec![AgentEvent::RawLine {
                text: line.to_string(),
            }];
            if plain_text_signals_rate_limit(line) {
                events.push(AgentEvent::Error {
                    kind: ErrorKind::RateLimit,
                    code: None,
                    message: line.to_string(),
                });
            }
            events
        }
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    #[instrument(skip_all, fields(program = request.command.program(), cwd = %request.cwd.display()))]
    async fn run(
        &self,
        request: &RunRequest,
        on_event: &mut (dyn FnMut(AgentEvent) + Send),
    ) -> Result<RunResult> {
        let limits = ProcessLimits {
            timeout: request.timeout.unwrap_or(self.limits.timeout),
            ..self.limits
        };
        let stream_path = request.artifacts.as_ref().map(AgentDir::stream_path);
        let started = Instant::now();
        let mut observed = Observed::default();

        info!("starting agent");
        let out = run_streaming(
            &request.command,
            &request.cwd,
            limits,
            &self.cancel,
            stream_path.as_deref(),
            &mut |line| {
                for event in decode(request.protocol, request.output, line) {
                    observed.observe(&event);
                    on_event(event);
                }
            },
        )
        .await?;
        let duration = started.elapsed();

        if out.stderr.lines().any(plain_text_signals_rate_limit) {
            warn!("rate limit signalled on stderr");
            observed.rate_limited = true;
        }
        if observed.events == 0 && out.stdout.trim().is_empty() {
            warn!("agent produced no output");
        }
        if let Some(dir) = &request.artifacts {
            let stdout = format!("{}{}", out.stdout, out.truncated_notice());
            if let Err(e) = dir.write_log(&stdout, &out.stderr) {
                warn!(err = %e, "failed to write agent log");
            }
        }

        let error = if out.timed_out {
            Some(format!("Timed out after {}s", limits.timeout.as_secs()))
        } else if out.cancelled {
            Some("Cancelled".to_string())
        } else {
            match out.exit_code {
                Some(0) => None,
                Some(code) => Some(format!("Exit code: {code}")),
                None => Some("Terminated by signal".to_string()),
            }
        };
        let rate_limited = observed.rate_limited;
        debug!(exit_code = ?out.exit_code, rate_limited, secs = duration.as_secs_f64(), "agent finished");
        Ok(RunResult {
            success: out.succeeded(),
            output: observed.into_output(),
            error,
            duration,
            exit_code: out.exit_code,
            timed_out: out.timed_out,
            cancelled: out.cancelled,
            rate_limited,
        })
    }
}
