//! Stable exit codes for learnloop CLI commands.

/// Run succeeded, or a reported failure was analyzed and persisted.
pub const OK: i32 = 0;
/// Invalid config/workspace, or the run aborted on an unrecoverable error.
pub const INVALID: i32 = 1;
/// `learnloop run` used every allowed attempt without passing verification.
pub const EXHAUSTED: i32 = 2;
/// `learnloop run` stopped after a failed attempt with auto-retry disabled.
pub const AWAITING_REVIEW: i32 = 3;
