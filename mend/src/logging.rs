//! Development-time tracing for debugging repair sessions.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of mend's product output.
//!
//! - **Session artifacts (`io/session_dir`, `report`)**: `ISSUE.md`,
//!   `stream.jsonl`, `agent.log` and `REPAIR_REPORT.md` under `.mend/`.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` applies (`warn`
/// normally, `mend=info` under `--verbose` so dispatch and retry decisions
/// show up next to the progress lines).
///
/// ```bash
/// RUST_LOG=mend=debug mend run --dry-run
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

/// Default filter for the CLI's verbosity flag.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "mend=info,warn" } else { "warn" }
}
