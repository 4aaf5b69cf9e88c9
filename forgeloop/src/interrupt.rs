//! Interruption capture.

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::core::state_machine::force_status;
use crate::core::types::{StepStatus, Task, TaskStatus, Workspace, WorkspaceStatus};
use crate::engine::Engine;
use crate::io::notify::LifecycleEvent;

/// Returned when a run stops on cancellation. State has already been
/// persisted as resumable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {task_id} in workspace '{workspace}' was interrupted; run `{resume_command}` to continue")]
pub struct TaskInterrupted {
    pub workspace: String,
    pub task_id: String,
    pub resume_command: String,
}

/// Force the task to Interrupted and the workspace to Paused, persist both,
/// and tell the operator how to continue.
///
/// Bypasses the transition table: cancellation can land in any non-terminal
/// status. Both records are written even if one write fails; the first
/// failure is returned after the operator has seen the resume command.
#[instrument(skip_all, fields(workspace = %workspace.name, task_id = %task.id))]
pub fn handle_interruption(
    engine: &Engine<'_>,
    task: &mut Task,
    workspace: &mut Workspace,
) -> Result<TaskInterrupted> {
    if let Some(step) = task.current_mut()
        && step.status == StepStatus::Running
    {
        step.status = StepStatus::Pending;
    }
    force_status(task, TaskStatus::Interrupted);
    workspace.status = WorkspaceStatus::Paused;
    workspace.current_task_id = Some(task.id.clone());
    workspace.touch();

    let task_saved = engine.tasks.update(task);
    let workspace_saved = engine.workspaces.update(workspace);
    info!(step = task.current_step, "task interrupted");
    engine.log_event(task, "interrupted", "run canceled by operator");

    let interrupted = TaskInterrupted {
        workspace: workspace.name.clone(),
        task_id: task.id.clone(),
        resume_command: engine.resume_command(&workspace.name),
    };
    engine.say("")?;
    engine.say("Interrupted. Task state saved.")?;
    engine.say(&format!("  Resume with: {}", interrupted.resume_command))?;
    engine.say(&format!("  Task ID:     {}", interrupted.task_id))?;
    engine.notify(
        LifecycleEvent::Interrupted,
        task,
        workspace,
        "run interrupted",
    );

    if let Err(err) = &task_saved {
        error!(err = %format!("{err:#}"), "failed to persist interrupted task");
    }
    if let Err(err) = &workspace_saved {
        error!(err = %format!("{err:#}"), "failed to persist paused workspace");
    }
    task_saved?;
    workspace_saved?;
    Ok(interrupted)
}
