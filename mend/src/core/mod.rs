//! Deterministic, pure logic shared by the repair orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod decisions;
pub mod escalation;
pub mod instructions;
pub mod priority;
pub mod protocol;
pub mod provider;
pub mod report;
pub mod scheduler;
pub mod types;
