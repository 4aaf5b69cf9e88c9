//! Sequential step pipeline.
//!
//! Runs a task's steps from `current_step`, records each result, and maps a
//! failing step to the matching error status. Cancellation is checked before
//! every step and after any step that did not succeed.

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::core::metadata::LAST_ERROR;
use crate::core::state_machine::transition;
use crate::core::types::{StepKind, StepStatus, Task, TaskStatus, Workspace, WorkspaceStatus};
use crate::engine::Engine;
use crate::interrupt::handle_interruption;
use crate::io::notify::LifecycleEvent;
use crate::io::task_store::{TaskStore, transition_and_save};

/// Result of executing one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failed { error: String },
    /// Only distinguished for `ci_wait`; elsewhere it counts as a failure.
    TimedOut { error: String },
    /// The step noticed cancellation and stopped early.
    Canceled,
}

/// Mutable view a step executor works against.
pub struct StepContext<'a> {
    pub task: &'a mut Task,
    pub workspace: &'a mut Workspace,
    pub tasks: &'a dyn TaskStore,
    pub cancel: &'a CancellationToken,
}

pub trait StepExecutor {
    fn execute(&self, kind: StepKind, ctx: &mut StepContext<'_>) -> StepOutcome;
}

/// How a pipeline run ended. Interruption is reported as an error instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    AwaitingApproval,
    Failed {
        status: TaskStatus,
        step: String,
        error: String,
    },
}

/// Status a failed step moves the task into.
pub fn failure_status(kind: StepKind, timed_out: bool) -> TaskStatus {
    match kind {
        StepKind::Implement | StepKind::Validate => TaskStatus::ValidationFailed,
        StepKind::CiWait if timed_out => TaskStatus::CiTimeout,
        StepKind::CiWait => TaskStatus::CiFailed,
        StepKind::Commit | StepKind::Push | StepKind::Pr | StepKind::Unknown => {
            TaskStatus::GhFailed
        }
    }
}

/// Run the task's remaining steps.
///
/// The task must be Pending or Running. Returns an error wrapping
/// [`crate::interrupt::TaskInterrupted`] when canceled.
#[instrument(skip_all, fields(workspace = %workspace.name, task_id = %task.id))]
pub fn run_pipeline(
    engine: &Engine<'_>,
    task: &mut Task,
    workspace: &mut Workspace,
) -> Result<PipelineOutcome> {
    if task.status == TaskStatus::Pending {
        transition_and_save(engine.tasks, task, TaskStatus::Running)?;
    }
    if task.status != TaskStatus::Running {
        bail!(
            "task {} must be running to execute steps (status '{}')",
            task.id,
            task.status
        );
    }

    while let Some(index) = task.step_index() {
        if engine.cancel.is_cancelled() {
            return Err(handle_interruption(engine, task, workspace)?.into());
        }

        let kind = task.steps[index].kind();
        let name = task.steps[index].name.clone();
        let attempt = {
            let step = &mut task.steps[index];
            step.status = StepStatus::Running;
            step.error = None;
            step.attempts += 1;
            step.attempts
        };
        if kind == StepKind::Validate {
            transition(task, TaskStatus::Validating)?;
        }
        task.touch();
        engine.tasks.update(task).context("persist running step")?;
        engine.log_event(task, "step_started", &name);
        info!(step = %name, attempt, "step started");
        engine.say(&format!("==> {name}"))?;

        let outcome = {
            let mut ctx = StepContext {
                task: &mut *task,
                workspace: &mut *workspace,
                tasks: engine.tasks,
                cancel: &engine.cancel,
            };
            engine.steps.execute(kind, &mut ctx)
        };

        let (error, timed_out) = match outcome {
            StepOutcome::Success => {
                record_success(engine, task, workspace, index)?;
                continue;
            }
            StepOutcome::Canceled => {
                return Err(handle_interruption(engine, task, workspace)?.into());
            }
            // A step that fails while the token is set was most likely killed
            // by the same Ctrl-C.
            _ if engine.cancel.is_cancelled() => {
                return Err(handle_interruption(engine, task, workspace)?.into());
            }
            StepOutcome::Failed { error } => (error, false),
            StepOutcome::TimedOut { error } => (error, true),
        };
        return record_failure(engine, task, workspace, index, kind, error, timed_out);
    }

    finish(engine, task, workspace)
}

fn record_success(
    engine: &Engine<'_>,
    task: &mut Task,
    workspace: &mut Workspace,
    index: usize,
) -> Result<()> {
    task.steps[index].status = StepStatus::Success;
    task.steps[index].error = None;
    if task.status == TaskStatus::Validating {
        transition(task, TaskStatus::Running)?;
    }
    task.current_step += 1;
    task.touch();
    engine.tasks.update(task).context("persist step success")?;
    workspace.touch();
    engine
        .workspaces
        .update(workspace)
        .context("persist workspace")?;
    engine.log_event(task, "step_succeeded", &task.steps[index].name);
    info!(step = %task.steps[index].name, "step succeeded");
    Ok(())
}

fn record_failure(
    engine: &Engine<'_>,
    task: &mut Task,
    workspace: &mut Workspace,
    index: usize,
    kind: StepKind,
    error: String,
    timed_out: bool,
) -> Result<PipelineOutcome> {
    let name = task.steps[index].name.clone();
    task.steps[index].status = StepStatus::Failed;
    task.steps[index].error = Some(error.clone());
    task.metadata.insert(LAST_ERROR, error.clone());

    let target = failure_status(kind, timed_out);
    // Implement failures reach ValidationFailed through Validating.
    if target == TaskStatus::ValidationFailed && task.status == TaskStatus::Running {
        transition(task, TaskStatus::Validating)?;
    }
    transition(task, target)?;
    engine.tasks.update(task).context("persist failed step")?;

    workspace.status = WorkspaceStatus::Paused;
    workspace.touch();
    engine
        .workspaces
        .update(workspace)
        .context("persist paused workspace")?;

    warn!(step = %name, status = %target, error = %error, "step failed");
    engine.log_event(task, "step_failed", &error);
    engine.notify(LifecycleEvent::Failed, task, workspace, &error);
    engine.say(&format!("Step '{name}' failed: {error}"))?;
    engine.say(&format!(
        "Task is {target}. Run `{}` to recover.",
        engine.resume_command(&workspace.name)
    ))?;
    Ok(PipelineOutcome::Failed {
        status: target,
        step: name,
        error,
    })
}

fn finish(
    engine: &Engine<'_>,
    task: &mut Task,
    workspace: &mut Workspace,
) -> Result<PipelineOutcome> {
    let needs_approval = engine
        .config
        .template(&task.template_id)
        .is_ok_and(|template| template.require_approval)
        && !task.metadata.approved();

    if needs_approval {
        transition(task, TaskStatus::Validating)?;
        transition(task, TaskStatus::AwaitingApproval)?;
        engine.tasks.update(task).context("persist awaiting approval")?;
        workspace.status = WorkspaceStatus::Paused;
        workspace.touch();
        engine.workspaces.update(workspace).context("persist workspace")?;
        info!("task awaiting approval");
        engine.log_event(task, "awaiting_approval", "all steps finished");
        engine.notify(
            LifecycleEvent::AwaitingApproval,
            task,
            workspace,
            "waiting for approval",
        );
        engine.say(&format!(
            "All steps finished. Approve or reject with `{}`.",
            engine.resume_command(&workspace.name)
        ))?;
        return Ok(PipelineOutcome::AwaitingApproval);
    }

    transition(task, TaskStatus::Completed)?;
    engine.tasks.update(task).context("persist completed task")?;
    workspace.status = WorkspaceStatus::Active;
    workspace.touch();
    engine.workspaces.update(workspace).context("persist workspace")?;
    info!("task completed");
    engine.log_event(task, "completed", "all steps finished");
    engine.notify(LifecycleEvent::Completed, task, workspace, "task completed");
    engine.say(&format!("Task {} completed.", task.id))?;
    Ok(PipelineOutcome::Completed)
}
