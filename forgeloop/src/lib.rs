//! Task lifecycle and recovery engine for AI-assisted development tasks.
//!
//! Each task runs in its own git worktree ("workspace") through an ordered
//! list of steps (implement, validate, commit, push, PR, CI wait). Failures
//! park the task in a recoverable status; `resume` offers a recovery menu and
//! continues where the task stopped. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (status table, recovery menus,
//!   record types). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state files, git, `gh`, agent and
//!   validation processes, terminal, notifications). Behind traits where the
//!   orchestration needs fakes.
//!
//! Orchestration modules ([`pipeline`], [`recovery`], [`interrupt`],
//! [`resume`], [`start`], [`status`]) coordinate the two through an
//! [`engine::Engine`].

pub mod cancel;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod interrupt;
pub mod io;
pub mod logging;
pub mod output;
pub mod pipeline;
pub mod recovery;
pub mod resume;
pub mod start;
pub mod status;
pub mod steps;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
