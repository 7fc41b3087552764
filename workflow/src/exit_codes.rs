//! Stable exit codes for workflow CLI commands.

/// Command succeeded; a driven run finished `Done`.
pub const OK: i32 = 0;
/// Invalid input, config, run id or any other error.
pub const INVALID: i32 = 1;
/// The run is (or already was) `Failed`.
pub const FAILED: i32 = 2;
/// The run is suspended at the approval gate.
pub const AWAITING_APPROVAL: i32 = 3;
/// Another caller is driving the same run.
pub const BUSY: i32 = 4;
