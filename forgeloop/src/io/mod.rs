//! I/O adapters: filesystem stores, git/gh, processes, and the terminal.

pub mod ai;
pub mod config;
pub mod git;
pub mod github;
pub mod notify;
pub mod process;
pub mod store;
pub mod task_store;
pub mod terminal;
pub mod workspace_store;
