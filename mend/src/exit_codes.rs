//! Stable exit codes for mend CLI commands.

/// Command succeeded; for `run`, every handled issue succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, unreadable health input, or other errors.
pub const INVALID: i32 = 1;
/// `mend run` finished but at least one repair failed.
pub const REPAIRS_FAILED: i32 = 2;
/// `mend run` was interrupted (Ctrl-C); partial results were reported.
pub const INTERRUPTED: i32 = 130;
