//! Async child process execution with streaming stdout, a hard timeout, and
//! cooperative cancellation.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::core::protocol::LineBuffer;
use crate::core::provider::ProviderCommand;

const CHUNK_SIZE: usize = 8192;

/// How long to keep draining stderr after the child was killed.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Least time given to stderr after a normal exit, even at the deadline.
const EXIT_DRAIN_FLOOR: Duration = Duration::from_millis(200);

/// Limits applied to one child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Captured child process output.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    /// `None` when the child was killed or terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ProcessOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    pub fn truncated_notice(&self) -> String {
        let mut notice = String::new();
        if self.stdout_truncated > 0 {
            notice.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        if self.stderr_truncated > 0 {
            notice.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        notice
    }
}

enum Ended {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

/// Bounded in-memory copy of a stream; bytes past the limit are counted and dropped.
struct Capped {
    buf: Vec<u8>,
    limit: usize,
    truncated: usize,
}

impl Capped {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: 0,
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.buf.len());
        let keep = chunk.len().min(remaining);
        self.buf.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }

    fn into_parts(self) -> (String, usize) {
        (String::from_utf8_lossy(&self.buf).into_owned(), self.truncated)
    }
}

/// Run `cmd` in `cwd`, calling `on_line` for every complete stdout line in
/// stream order.
///
/// `cmd.stdin` is written and then closed. Stdout is read in fixed-size
/// chunks (a single record may be arbitrarily long) and, if `stream_path` is
/// given, tee'd to that file as it arrives. Stderr is buffered on its own
/// task. On timeout or cancellation the child is killed and whatever was
/// captured so far is returned; neither is an `Err`.
///
/// The timeout bounds the whole call: a grandchild that inherited stderr
/// and outlives the child does not hold the call open past the deadline
/// (plus a short drain floor), and cancellation still cuts it short.
#[instrument(skip_all, fields(program = cmd.program(), timeout_secs = limits.timeout.as_secs()))]
pub async fn run_streaming(
    cmd: &ProviderCommand,
    cwd: &Path,
    limits: ProcessLimits,
    cancel: &CancellationToken,
    stream_path: Option<&Path>,
    on_line: &mut (dyn FnMut(&str) + Send),
) -> Result<ProcessOutput> {
    if cmd.program().is_empty() {
        return Err(anyhow!("empty command"));
    }
    if cancel.is_cancelled() {
        debug!("cancelled before spawn");
        return Ok(ProcessOutput {
            cancelled: true,
            ..ProcessOutput::default()
        });
    }

    let mut tee = match stream_path {
        Some(path) => Some(
            File::create(path)
                .await
                .with_context(|| format!("create stream file {}", path.display()))?,
        ),
        None => None,
    };

    let mut command = Command::new(cmd.program());
    command
        .args(cmd.args())
        .current_dir(cwd)
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {}", cmd.program()));
        }
    };

    if let Some(input) = cmd.stdin.clone() {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // Written concurrently with the drain so a chatty child cannot deadlock us.
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                warn!(err = %e, "failed to write child stdin");
            }
            drop(stdin);
        });
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = limits.output_limit_bytes;
    let stderr_buf = Arc::new(Mutex::new(Capped::new(limit)));
    let mut stderr_task = tokio::spawn(read_shared(stderr, stderr_buf.clone()));
    let deadline = Instant::now() + limits.timeout;

    let mut captured = Capped::new(limit);
    let mut lines = LineBuffer::with_limit(limit);
    let ended = tokio::select! {
        res = drain_and_wait(&mut child, &mut stdout, &mut captured, &mut lines, tee.as_mut(), on_line) => {
            Ended::Exited(res?)
        }
        () = tokio::time::sleep_until(deadline) => Ended::TimedOut,
        () = cancel.cancelled() => Ended::Cancelled,
    };
    if let Some(rest) = lines.finish() {
        on_line(&rest);
    }
    if lines.truncated() > 0 {
        warn!(dropped = lines.truncated(), "over-long stdout lines cut at the output limit");
    }

    let (exit_code, timed_out, cancelled) = match ended {
        Ended::Exited(code) => (code, false, false),
        Ended::TimedOut => {
            warn!(timeout_secs = limits.timeout.as_secs(), "command timed out, killing");
            kill(&mut child).await;
            (None, true, false)
        }
        Ended::Cancelled => {
            warn!("command cancelled, killing");
            kill(&mut child).await;
            (None, false, true)
        }
    };

    // A surviving grandchild may keep stderr open; never wait on it past the deadline.
    let drain_for = if timed_out || cancelled {
        KILL_DRAIN_GRACE
    } else {
        deadline
            .saturating_duration_since(Instant::now())
            .clamp(EXIT_DRAIN_FLOOR, KILL_DRAIN_GRACE)
    };
    let drained = tokio::select! {
        joined = &mut stderr_task => Some(joined),
        () = tokio::time::sleep(drain_for) => None,
        () = cancel.cancelled(), if !cancelled => None,
    };
    match drained {
        Some(joined) => joined.context("join stderr reader")??,
        None => {
            warn!("stderr still open after the child ended, abandoning drain");
            stderr_task.abort();
        }
    }
    let (stderr, stderr_truncated) = std::mem::replace(
        &mut *stderr_buf.lock().unwrap_or_else(PoisonError::into_inner),
        Capped::new(0),
    )
    .into_parts();
    let (stdout, stdout_truncated) = captured.into_parts();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }
    debug!(exit_code = ?exit_code, timed_out, cancelled, "command finished");
    Ok(ProcessOutput {
        exit_code,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

async fn drain_and_wait(
    child: &mut Child,
    stdout: &mut ChildStdout,
    captured: &mut Capped,
    lines: &mut LineBuffer,
    mut tee: Option<&mut File>,
    on_line: &mut (dyn FnMut(&str) + Send),
) -> Result<Option<i32>> {
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = stdout.read(&mut chunk).await.context("read stdout")?;
        if n == 0 {
            break;
        }
        if let Some(file) = tee.as_deref_mut()
            && let Err(e) = file.write_all(&chunk[..n]).await
        {
            warn!(err = %e, "failed to write stream file");
        }
        captured.extend(&chunk[..n]);
        for line in lines.push(&chunk[..n]) {
            on_line(&line);
        }
    }
    if let Some(file) = tee
        && let Err(e) = file.flush().await
    {
        warn!(err = %e, "failed to flush stream file");
    }
    let status = child.wait().await.context("wait for command")?;
    Ok(status.code())
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(err = %e, "failed to kill child process");
    }
}

/// Copy `reader` into the shared buffer until EOF; the buffer stays readable
/// if this task is abandoned midway.
async fn read_shared<R: AsyncRead + Unpin>(mut reader: R, buf: Arc<Mutex<Capped>>) -> Result<()> {
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            return Ok(());
        }
        buf.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(&chunk[..n]);
    }
}
