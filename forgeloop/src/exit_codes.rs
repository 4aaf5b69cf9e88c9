//! Stable exit codes for forgeloop CLI commands.

/// Command succeeded; the task completed, awaits approval, or was closed.
pub const OK: i32 = 0;
/// Invalid input, unknown workspace, non-resumable task, or any other error.
pub const INVALID: i32 = 1;
/// The task stopped in a failure status and needs `resume`.
pub const RECOVERY_NEEDED: i32 = 2;
/// The run was interrupted with Ctrl-C; state was saved.
pub const INTERRUPTED: i32 = 130;
