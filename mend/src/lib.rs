//! Autonomous repair orchestrator for coding-agent CLIs.
//!
//! A session takes the issues reported by an external health check, orders
//! and filters them, settles the ones that need a human, and fans the rest
//! out to a bounded pool of agent subprocesses. Success is judged by what an
//! agent did to the repository, never by what it says. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (ordering, protocol decoding,
//!   scheduler state, report rendering). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution,
//!   console). Isolated to enable fakes in tests.
//!
//! Orchestration modules ([`agent`], [`policy`], [`completion`],
//! [`orchestrator`], [`interactive`], [`report`], [`session`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod agent;
pub mod completion;
pub mod core;
pub mod exit_codes;
pub mod interactive;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod policy;
pub mod report;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
