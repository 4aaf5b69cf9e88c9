//! `status`: show a workspace and its current task.

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;

use crate::core::recovery::truncate_error;
use crate::core::types::{StepStatus, Task, TaskStatus, WorkspaceStatus};
use crate::engine::Engine;
use crate::io::store::StoreError;
use crate::resume::ResumeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub name: String,
    pub status: StepStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub template: String,
    pub description: String,
    pub status: TaskStatus,
    pub current_step: i64,
    pub steps: Vec<StepSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            template: task.template_id.clone(),
            description: task.description.clone(),
            status: task.status,
            current_step: task.current_step,
            steps: task
                .steps
                .iter()
                .map(|step| StepSummary {
                    name: step.name.clone(),
                    status: step.status,
                    attempts: step.attempts,
                })
                .collect(),
            error: task
                .status
                .is_error()
                .then(|| task.error_message())
                .flatten(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub workspace: String,
    pub branch: String,
    pub base_branch: String,
    pub worktree_path: PathBuf,
    pub workspace_status: WorkspaceStatus,
    /// Remote URL recorded when the workspace was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    pub task: Option<TaskSummary>,
    /// Set when the task can be continued with `resume`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_command: Option<String>,
}

pub fn workspace_status(engine: &Engine<'_>, name: &str) -> Result<StatusReport> {
    let workspace = match engine.workspaces.get(name) {
        Ok(workspace) => workspace,
        Err(err)
            if matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::NotFound { .. })
            ) =>
        {
            return Err(ResumeError::WorkspaceNotFound(name.to_string()).into());
        }
        Err(err) => return Err(err),
    };
    let task = match &workspace.current_task_id {
        Some(id) => Some(engine.tasks.get(&workspace.name, id)?),
        None => engine.tasks.latest(&workspace.name)?,
    };
    let resume_command = task
        .as_ref()
        .filter(|task| task.status.is_resumable())
        .map(|_| engine.resume_command(&workspace.name));
    let repository = workspace.metadata.repository().map(str::to_string);
    Ok(StatusReport {
        workspace: workspace.name,
        branch: workspace.branch,
        base_branch: workspace.base_branch,
        worktree_path: workspace.worktree_path,
        workspace_status: workspace.status,
        repository,
        task: task.as_ref().map(TaskSummary::from),
        resume_command,
    })
}

/// Text rendering of a [`StatusReport`].
pub fn render_status(report: &StatusReport) -> Vec<String> {
    let mut lines = vec![
        format!("Workspace: {} ({})", report.workspace, report.workspace_status),
        format!("Branch:    {} (base {})", report.branch, report.base_branch),
        format!("Worktree:  {}", report.worktree_path.display()),
    ];
    if let Some(url) = &report.repository {
        lines.push(format!("Remote:    {url}"));
    }
    let Some(task) = &report.task else {
        lines.push("No tasks.".to_string());
        return lines;
    };
    lines.push(format!("Task:      {} [{}]", task.id, task.status));
    lines.push(format!("           {}", task.description.lines().next().unwrap_or("")));
    for (index, step) in task.steps.iter().enumerate() {
        let marker = if index as i64 == task.current_step {
            ">"
        } else {
            " "
        };
        let retries = if step.attempts > 1 {
            format!(" ({} attempts)", step.attempts)
        } else {
            String::new()
        };
        lines.push(format!(
            "  {marker} {:<12} {}{retries}",
            step.name,
            step_label(step.status)
        ));
    }
    if let Some(error) = &task.error {
        lines.push(format!("Error: {}", truncate_error(error)));
    }
    if let Some(command) = &report.resume_command {
        lines.push(format!("Resume with: {command}"));
    }
    lines
}

fn step_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Success => "success",
        StepStatus::Failed => "failed",
    }
}
