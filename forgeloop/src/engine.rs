//! Shared handles for one command invocation.

use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::cancel::CancellationToken;
use crate::core::types::{Task, Workspace};
use crate::io::config::Config;
use crate::io::git::BranchSync;
use crate::io::notify::{LifecycleEvent, Notification, Notifier};
use crate::io::task_store::{TaskLogEntry, TaskStore};
use crate::io::terminal::Terminal;
use crate::io::workspace_store::WorkspaceStore;
use crate::output::OutputFormat;
use crate::pipeline::StepExecutor;

/// Everything the lifecycle operations need, borrowed from `main` (or from a
/// test environment).
pub struct Engine<'a> {
    pub repo_root: &'a Path,
    pub config: &'a Config,
    pub tasks: &'a dyn TaskStore,
    pub workspaces: &'a dyn WorkspaceStore,
    pub steps: &'a dyn StepExecutor,
    pub terminal: &'a dyn Terminal,
    pub notifier: &'a dyn Notifier,
    pub branch_sync: &'a dyn BranchSync,
    pub cancel: CancellationToken,
    pub output: OutputFormat,
}

impl Engine<'_> {
    /// Print operator guidance. Suppressed in JSON mode so stdout carries
    /// only the envelope.
    pub fn say(&self, line: &str) -> Result<()> {
        if self.output.is_json() {
            return Ok(());
        }
        self.terminal.write_line(line)
    }

    /// Literal command that continues `workspace`.
    pub fn resume_command(&self, workspace: &str) -> String {
        format!("{} resume {workspace}", self.config.cli_name)
    }

    /// Append to the task's event log. Best effort.
    pub fn log_event(&self, task: &Task, event: &str, message: &str) {
        let entry = TaskLogEntry::now(event, message);
        if let Err(err) = self
            .tasks
            .append_log(&task.workspace_id, &task.id, &entry)
        {
            warn!(task_id = %task.id, err = %format!("{err:#}"), "failed to append task log");
        }
    }

    pub fn notify(&self, event: LifecycleEvent, task: &Task, workspace: &Workspace, message: &str) {
        self.notifier.notify(&Notification {
            event,
            workspace: workspace.name.clone(),
            task_id: task.id.clone(),
            status: task.status.to_string(),
            message: message.to_string(),
        });
    }
}
