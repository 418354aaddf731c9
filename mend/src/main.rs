//! Autonomous repair orchestrator CLI.
//!
//! Reads issues from the project's health check (or a doctor JSON file),
//! settles escalations and suggestions with the human, and dispatches the
//! rest to coding-agent subprocesses, `parallel` at a time.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mend::agent::ProcessAgentRunner;
use mend::completion::CompletionDetector;
use mend::core::priority::{Depth, priority};
use mend::core::protocol::AgentEvent;
use mend::core::provider::Provider;
use mend::exit_codes;
use mend::interactive::InteractiveResolver;
use mend::io::config::{MendConfig, load_config, write_config};
use mend::io::console::spawn_stdin_reader;
use mend::io::fallback::FallbackConfig;
use mend::io::git::Git;
use mend::io::health::{CommandHealthSource, FileHealthSource, HealthSource};
use mend::io::process::ProcessLimits;
use mend::io::prompt::PromptEngine;
use mend::io::session_dir::SessionDir;
use mend::logging;
use mend::orchestrator::{DispatchSettings, Orchestrator, SessionEvent};
use mend::policy::RetryPolicy;
use mend::report::{AgentNarrativeWriter, NarrativeWriter};
use mend::session::{PlanOptions, Session, SessionSummary, plan, render_prompt};

const MEND_DIR: &str = ".mend";
const CONFIG_FILE: &str = "config.toml";
const FALLBACK_FILE: &str = "model_fallback.json";

#[derive(Parser)]
#[command(
    name = "mend",
    version,
    about = "Autonomous repair orchestrator for coding-agent CLIs"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Log dispatch and retry decisions to stderr (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one repair session.
    Run(RunArgs),
    /// Print the ordered dispatch list without running anything.
    Plan(SelectArgs),
    /// Write the default `.mend/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct SelectArgs {
    /// Issue types eligible for repair: links, docs, or full.
    #[arg(long)]
    depth: Option<Depth>,
    /// Repair only these issue types (repeatable).
    #[arg(long = "type", value_name = "TYPE")]
    types: Vec<String>,
    /// Cap on the number of issues, applied after ordering.
    #[arg(long)]
    max: Option<usize>,
    /// Read doctor JSON from this file instead of running the health command.
    #[arg(long, value_name = "FILE")]
    issues: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    select: SelectArgs,
    #[arg(long)]
    provider: Option<Provider>,
    /// Maximum number of agents running at once.
    #[arg(long)]
    parallel: Option<usize>,
    /// Print the plan and every rendered prompt; spawn nothing.
    #[arg(long)]
    dry_run: bool,
    /// Skip the agent-written report narrative.
    #[arg(long)]
    no_narrative: bool,
    /// Per-agent timeout in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(logging::default_directive(cli.verbose));
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("resolve project root {}", cli.root.display()))?;
    let config_path = root.join(MEND_DIR).join(CONFIG_FILE);
    match cli.command {
        Command::Init { force } => cmd_init(&config_path, force),
        Command::Plan(select) => {
            let config = load_config(&config_path)?;
            cmd_plan(&root, &config, &select).await
        }
        Command::Run(args) => {
            let mut config = load_config(&config_path)?;
            apply_overrides(&mut config, &args)?;
            if args.dry_run {
                cmd_dry_run(&root, &config, &args.select).await
            } else {
                cmd_run(&root, config, &args).await
            }
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config_path.display());
    }
    write_config(config_path, &MendConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

async fn cmd_plan(root: &Path, config: &MendConfig, select: &SelectArgs) -> Result<i32> {
    let health = health_source(root, config, select, CancellationToken::new());
    let report = health.check().await?;
    let planned = plan(&report.issues, &plan_options(config, select));
    println!(
        "score {} | {} discovered | {} planned",
        report.snapshot.score,
        report.issues.len(),
        planned.len()
    );
    for (i, issue) in planned.iter().enumerate() {
        println!(
            "{:>3}. [{:>2}] {:<20} {}",
            i + 1,
            priority(&issue.issue_type),
            issue.canonical_type(),
            issue.path
        );
    }
    Ok(exit_codes::OK)
}

async fn cmd_dry_run(root: &Path, config: &MendConfig, select: &SelectArgs) -> Result<i32> {
    let health = health_source(root, config, select, CancellationToken::new());
    let report = health.check().await?;
    let planned = plan(&report.issues, &plan_options(config, select));
    let prompts = PromptEngine::new()?;
    println!("dry run: {} issue(s) planned, provider {}", planned.len(), config.provider);
    for (i, issue) in planned.iter().enumerate() {
        println!("\n===== {:02} {} {} =====", i + 1, issue.canonical_type(), issue.path);
        println!("{}", render_prompt(&prompts, issue, &[])?);
    }
    Ok(exit_codes::OK)
}

async fn cmd_run(root: &Path, config: MendConfig, args: &RunArgs) -> Result<i32> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, stopping agents...");
            on_interrupt.cancel();
        }
    });

    let mend_dir = root.join(MEND_DIR);
    let limits = ProcessLimits {
        timeout: Duration::from_secs(config.agent_timeout_secs),
        output_limit_bytes: config.output_limit_bytes,
    };
    let runner = Arc::new(ProcessAgentRunner::new(limits, cancel.clone()));
    let fallback = FallbackConfig::load(&mend_dir.join("state").join(FALLBACK_FILE))?;
    let policy = RetryPolicy::new(runner, Arc::new(Mutex::new(fallback)), config.fallback.clone());
    let detector = CompletionDetector::new(Arc::new(Git::new(root)));
    let session_dir = SessionDir::create(&mend_dir)?;
    let prompts = PromptEngine::new()?;
    let settings = DispatchSettings {
        provider: config.provider,
        parallel: config.parallel,
        continue_session: config.continue_session,
        allowed_tools: config.allowed_tools.clone(),
        system_prompt: Some(prompts.render_system(root)?),
        project_root: root.to_path_buf(),
        timeout: None,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));
    let orchestrator =
        Orchestrator::new(policy.clone(), detector, session_dir, settings, cancel.clone()).with_events(tx);
    let dir = orchestrator.session_dir();
    println!("session {} ({})", dir.id(), dir.path().display());

    let narrative: Option<Box<dyn NarrativeWriter>> = if config.report.narrative && !args.no_narrative {
        Some(Box::new(AgentNarrativeWriter::new(
            policy,
            config.provider,
            root,
            Duration::from_secs(config.report.narrative_timeout_secs),
        )))
    } else {
        None
    };
    let session = Session {
        project_root: root.to_path_buf(),
        health: health_source(root, &config, &args.select, cancel.clone()),
        prompts,
        resolver: InteractiveResolver::new(spawn_stdin_reader()?, std::io::stdout()),
        orchestrator,
        narrative,
        cancel,
    };

    let summary = session.run(&plan_options(&config, &args.select)).await;
    // the session owned the last event sender
    if let Err(e) = printer.await {
        debug!(err = %e, "event printer stopped");
    }
    let summary = summary?;
    print_summary(&summary);

    Ok(if summary.cancelled {
        exit_codes::INTERRUPTED
    } else if summary.all_succeeded() {
        exit_codes::OK
    } else {
        exit_codes::REPAIRS_FAILED
    })
}

fn apply_overrides(config: &mut MendConfig, args: &RunArgs) -> Result<()> {
    if let Some(provider) = args.provider {
        config.provider = provider;
    }
    if let Some(parallel) = args.parallel {
        config.parallel = parallel;
    }
    if let Some(depth) = args.select.depth {
        config.depth = depth;
    }
    if let Some(secs) = args.timeout {
        config.agent_timeout_secs = secs;
    }
    config.validate()
}

fn plan_options(config: &MendConfig, select: &SelectArgs) -> PlanOptions {
    PlanOptions {
        depth: select.depth.unwrap_or(config.depth),
        types: select.types.clone(),
        max: select.max,
    }
}

fn health_source(
    root: &Path,
    config: &MendConfig,
    select: &SelectArgs,
    cancel: CancellationToken,
) -> Arc<dyn HealthSource> {
    match &select.issues {
        Some(path) => Arc::new(FileHealthSource::new(path.clone())),
        None => Arc::new(
            CommandHealthSource::new(
                config.health.command.clone(),
                root,
                Duration::from_secs(config.health.timeout_secs),
            )
            .with_cancel(cancel),
        ),
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::Queued { total } => println!("queued {total} repair(s)"),
            SessionEvent::Dispatched {
                job,
                issue_type,
                path,
            } => println!("[{job:02}] start {issue_type} {path}"),
            SessionEvent::Agent { job, event } => match event {
                AgentEvent::ToolCall { name, .. } => println!("[{job:02}]   tool {name}"),
                AgentEvent::Error { message, .. } => println!("[{job:02}]   error: {message}"),
                _ => {}
            },
            SessionEvent::Finished {
                job,
                success: true,
                ..
            } => println!("[{job:02}] done"),
            SessionEvent::Finished { job, error, .. } => println!(
                "[{job:02}] FAILED: {}",
                error.as_deref().unwrap_or("unknown error")
            ),
            SessionEvent::Resolved {
                issue_type,
                path,
                dispatched,
            } => println!(
                "{issue_type} {path}: {}",
                if dispatched { "queued for repair" } else { "settled, no agent" }
            ),
            SessionEvent::Counts(counts) => debug!(?counts, "scheduler counts"),
        }
    }
}

fn print_summary(summary: &SessionSummary) {
    let succeeded = summary.results.iter().filter(|r| r.success).count();
    let failed = summary.results.len() - succeeded;
    println!(
        "\n{succeeded} succeeded, {failed} failed, {} not dispatched | score {} -> {}",
        summary.not_dispatched, summary.before.score, summary.after.score
    );
    for result in summary.results.iter().filter(|r| !r.success) {
        println!(
            "  FAILED {} {}: {}",
            result.issue_type,
            result.target_path,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    if let Some(path) = &summary.report_path {
        println!("report: {}", path.display());
    }
    if summary.cancelled {
        println!("interrupted: remaining issues were left queued");
    }
}
