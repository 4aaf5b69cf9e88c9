//! `resume`: pick a paused task back up.
//!
//! Loads the workspace and its current task, lets the operator (or `--ai-fix`)
//! choose a recovery action when the task stopped on an error, then re-enters
//! the pipeline at `current_step`.

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::core::recovery::{RecoveryAction, recovery_context_lines, recovery_options};
use crate::core::types::{Task, TaskStatus, Workspace, WorkspaceStatus};
use crate::engine::Engine;
use crate::io::store::StoreError;
use crate::io::task_store::transition_and_save;
use crate::io::terminal::{MenuCanceled, prompt_menu};
use crate::pipeline::{PipelineOutcome, run_pipeline};
use crate::recovery::execute_recovery_action_with_resume;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRequest {
    pub workspace: String,
    /// Take the first recovery option without prompting.
    pub ai_fix: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("workspace '{0}' not found")]
    WorkspaceNotFound(String),
    #[error("workspace '{0}' has no tasks")]
    NoTasksFound(String),
    #[error("task {task_id} is {status} and cannot be resumed")]
    InvalidState { task_id: String, status: TaskStatus },
    #[error("task {task_id} is awaiting approval; run `{resume_command}` interactively to approve or reject it")]
    ApprovalRequired {
        task_id: String,
        resume_command: String,
    },
    #[error("task {task_id} is {status} and needs a recovery choice; rerun with --ai-fix or without --output json")]
    RecoveryRequired { task_id: String, status: TaskStatus },
}

impl ResumeError {
    /// Stable code for the JSON envelope's `error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            ResumeError::WorkspaceNotFound(_) => "workspace_not_found",
            ResumeError::NoTasksFound(_) => "no_tasks_found",
            ResumeError::InvalidState { .. } => "invalid_state",
            ResumeError::ApprovalRequired { .. } => "approval_required",
            ResumeError::RecoveryRequired { .. } => "recovery_required",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOutcome {
    Completed,
    AwaitingApproval,
    Failed,
    /// Recovery ended without re-entering the pipeline.
    Stopped,
}

/// What a resume did, printed as the JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub workspace: String,
    pub task_id: String,
    pub action: Option<RecoveryAction>,
    pub outcome: ResumeOutcome,
    pub status: TaskStatus,
    pub current_step: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResumeReport {
    /// The task is still parked in a failure status.
    pub fn needs_recovery(&self) -> bool {
        self.status.is_error()
    }
}

#[instrument(skip_all, fields(workspace = %request.workspace, ai_fix = request.ai_fix))]
pub fn resume_task(engine: &Engine<'_>, request: &ResumeRequest) -> Result<ResumeReport> {
    let mut workspace = load_workspace(engine, &request.workspace)?;
    let mut task = load_current_task(engine, &workspace)?;
    if !task.status.is_resumable() {
        return Err(ResumeError::InvalidState {
            task_id: task.id,
            status: task.status,
        }
        .into());
    }
    info!(task_id = %task.id, status = %task.status, "resuming task");

    let options = recovery_options(&task);
    let mut chosen = None;
    let auto_resume = if options.is_empty() {
        true
    } else if request.ai_fix {
        if task.status == TaskStatus::AwaitingApproval {
            return Err(ResumeError::ApprovalRequired {
                task_id: task.id.clone(),
                resume_command: engine.resume_command(&workspace.name),
            }
            .into());
        }
        show_context(engine, &task)?;
        let action = options[0].action;
        engine.say(&format!("Auto-selecting: {}", options[0].label))?;
        chosen = Some(action);
        execute_recovery_action_with_resume(engine, &mut task, &mut workspace, action)?
            .auto_resume
    } else if engine.output.is_json() {
        return Err(ResumeError::RecoveryRequired {
            task_id: task.id.clone(),
            status: task.status,
        }
        .into());
    } else {
        show_context(engine, &task)?;
        loop {
            let options = recovery_options(&task);
            let action = prompt_menu(
                engine.terminal,
                &engine.cancel,
                "Choose a recovery action:",
                &options,
            )?;
            if engine.cancel.is_cancelled() {
                return Err(MenuCanceled::ByUser.into());
            }
            chosen = Some(action);
            let result =
                execute_recovery_action_with_resume(engine, &mut task, &mut workspace, action)?;
            if result.done {
                break result.auto_resume;
            }
        }
    };

    if !auto_resume {
        return Ok(report(&workspace, &task, chosen, ResumeOutcome::Stopped, None));
    }

    workspace.status = WorkspaceStatus::Active;
    workspace.current_task_id = Some(task.id.clone());
    workspace.touch();
    engine
        .workspaces
        .update(&workspace)
        .context("persist resumed workspace")?;
    if task.status != TaskStatus::Running {
        transition_and_save(engine.tasks, &mut task, TaskStatus::Running)?;
    }
    engine.log_event(&task, "resumed", &format!("resuming at step {}", task.current_step));
    engine.say(&format!("Resuming task {} at step {}.", task.id, task.current_step))?;

    let outcome = run_pipeline(engine, &mut task, &mut workspace)?;
    let (outcome, failure) = match outcome {
        PipelineOutcome::Completed => (ResumeOutcome::Completed, None),
        PipelineOutcome::AwaitingApproval => (ResumeOutcome::AwaitingApproval, None),
        PipelineOutcome::Failed { step, error, .. } => (ResumeOutcome::Failed, Some((step, error))),
    };
    Ok(report(&workspace, &task, chosen, outcome, failure))
}

fn load_workspace(engine: &Engine<'_>, name: &str) -> Result<Workspace> {
    match engine.workspaces.get(name) {
        Ok(workspace) => Ok(workspace),
        Err(err) if is_not_found(&err) => Err(ResumeError::WorkspaceNotFound(name.to_string()).into()),
        Err(err) => Err(err),
    }
}

/// The workspace's current task, or its newest task when the pointer is
/// missing or stale.
fn load_current_task(engine: &Engine<'_>, workspace: &Workspace) -> Result<Task> {
    if let Some(task_id) = &workspace.current_task_id {
        match engine.tasks.get(&workspace.name, task_id) {
            Ok(task) => return Ok(task),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err),
        }
    }
    engine
        .tasks
        .latest(&workspace.name)?
        .ok_or_else(|| ResumeError::NoTasksFound(workspace.name.clone()).into())
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::NotFound { .. })
    )
}

fn show_context(engine: &Engine<'_>, task: &Task) -> Result<()> {
    engine.say("")?;
    for line in recovery_context_lines(task) {
        engine.say(&line)?;
    }
    Ok(())
}

fn report(
    workspace: &Workspace,
    task: &Task,
    action: Option<RecoveryAction>,
    outcome: ResumeOutcome,
    failure: Option<(String, String)>,
) -> ResumeReport {
    let (failed_step, error) = match failure {
        Some((step, error)) => (Some(step), Some(error)),
        None => (None, None),
    };
    ResumeReport {
        workspace: workspace.name.clone(),
        task_id: task.id.clone(),
        action,
        outcome,
        status: task.status,
        current_step: task.current_step,
        failed_step,
        error,
    }
}
