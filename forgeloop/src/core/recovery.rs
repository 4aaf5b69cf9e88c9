//! Recovery menu resolution and recovery context formatting.
//!
//! Pure functions: given a task, decide which actions an operator may take
//! and which diagnostics to show alongside the menu.

use std::fmt;

use serde::Serialize;

use crate::core::types::{StepKind, Task, TaskStatus};

/// Maximum characters of error text shown in the recovery context.
pub const ERROR_PREVIEW_CHARS: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryAi,
    RetryGh,
    RetryCommit,
    RebaseRetry,
    FixManually,
    ViewErrors,
    ViewLogs,
    ContinueWaiting,
    Abandon,
    Approve,
    Reject,
    /// Anything not recognized. Executing it is a no-op.
    Unknown,
}

impl RecoveryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::RetryAi => "retry_ai",
            RecoveryAction::RetryGh => "retry_gh",
            RecoveryAction::RetryCommit => "retry_commit",
            RecoveryAction::RebaseRetry => "rebase_retry",
            RecoveryAction::FixManually => "fix_manually",
            RecoveryAction::ViewErrors => "view_errors",
            RecoveryAction::ViewLogs => "view_logs",
            RecoveryAction::ContinueWaiting => "continue_waiting",
            RecoveryAction::Abandon => "abandon",
            RecoveryAction::Approve => "approve",
            RecoveryAction::Reject => "reject",
            RecoveryAction::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "retry_ai" => RecoveryAction::RetryAi,
            "retry_gh" => RecoveryAction::RetryGh,
            "retry_commit" => RecoveryAction::RetryCommit,
            "rebase_retry" => RecoveryAction::RebaseRetry,
            "fix_manually" => RecoveryAction::FixManually,
            "view_errors" => RecoveryAction::ViewErrors,
            "view_logs" => RecoveryAction::ViewLogs,
            "continue_waiting" => RecoveryAction::ContinueWaiting,
            "abandon" => RecoveryAction::Abandon,
            "approve" => RecoveryAction::Approve,
            "reject" => RecoveryAction::Reject,
            _ => RecoveryAction::Unknown,
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOption {
    pub action: RecoveryAction,
    pub label: String,
    pub description: String,
}

impl RecoveryOption {
    fn new(action: RecoveryAction, label: &str, description: &str) -> Self {
        Self {
            action,
            label: label.to_string(),
            description: description.to_string(),
        }
    }
}

fn retry_ai() -> RecoveryOption {
    RecoveryOption::new(
        RecoveryAction::RetryAi,
        "Retry with AI fix",
        "Run the implement step again with the last error as context",
    )
}

fn fix_manually() -> RecoveryOption {
    RecoveryOption::new(
        RecoveryAction::FixManually,
        "Fix manually",
        "Edit the worktree yourself, then resume",
    )
}

fn view_errors() -> RecoveryOption {
    RecoveryOption::new(
        RecoveryAction::ViewErrors,
        "View errors",
        "Show the latest validation output",
    )
}

fn view_logs() -> RecoveryOption {
    RecoveryOption::new(
        RecoveryAction::ViewLogs,
        "View CI logs",
        "Open or print the CI run URL",
    )
}

fn abandon() -> RecoveryOption {
    RecoveryOption::new(
        RecoveryAction::Abandon,
        "Abandon task",
        "Stop the task and keep the branch",
    )
}

fn retry_gh(step: StepKind) -> RecoveryOption {
    let (label, description) = match step {
        StepKind::Push => ("Retry push", "Push the branch again"),
        StepKind::Pr => ("Retry PR creation", "Create the pull request again"),
        _ => (
            "Retry GitHub operation",
            "Run the failed push or PR step again",
        ),
    };
    RecoveryOption::new(RecoveryAction::RetryGh, label, description)
}

/// Name of the step at `current_step`, or `""` when the index is out of range.
pub fn task_step_name(task: &Task) -> &str {
    task.current().map_or("", |step| step.name.as_str())
}

/// Kind of the step at `current_step`; out-of-range indexes are `Unknown`.
pub fn task_step_kind(task: &Task) -> StepKind {
    StepKind::from_name(task_step_name(task))
}

/// Push-error-aware menu. Returns `None` (not handled) unless
/// `push_error_type` is a non-empty string.
pub fn try_select_push_error_recovery(
    task: &Task,
    step: StepKind,
) -> Option<Vec<RecoveryOption>> {
    let error_type = task.metadata.push_error_type()?;
    let rebase = RecoveryOption::new(
        RecoveryAction::RebaseRetry,
        "Rebase and retry",
        &format!("Rebase onto the base branch ({error_type}), then push again"),
    );
    Some(vec![
        rebase,
        retry_gh(step),
        fix_manually(),
        view_errors(),
        abandon(),
    ])
}

fn gh_failed_options(task: &Task) -> Vec<RecoveryOption> {
    let step = task_step_kind(task);
    match step {
        StepKind::Commit => vec![
            RecoveryOption::new(
                RecoveryAction::RetryCommit,
                "Retry commit",
                "Stage and commit the worktree again",
            ),
            fix_manually(),
            view_errors(),
            abandon(),
        ],
        StepKind::Push => try_select_push_error_recovery(task, step)
            .unwrap_or_else(|| vec![retry_gh(step), fix_manually(), view_errors(), abandon()]),
        _ => vec![retry_gh(step), fix_manually(), view_errors(), abandon()],
    }
}

/// Ordered recovery menu for the task's status. Empty when no operator
/// choice is needed (interrupted) or possible (non-resumable).
pub fn recovery_options(task: &Task) -> Vec<RecoveryOption> {
    match task.status {
        TaskStatus::GhFailed => gh_failed_options(task),
        TaskStatus::ValidationFailed => vec![retry_ai(), fix_manually(), view_errors(), abandon()],
        TaskStatus::CiFailed => vec![retry_ai(), fix_manually(), view_logs(), abandon()],
        TaskStatus::CiTimeout => vec![
            RecoveryOption::new(
                RecoveryAction::ContinueWaiting,
                "Continue waiting",
                "Keep polling CI for the current run",
            ),
            retry_ai(),
            fix_manually(),
            view_logs(),
            abandon(),
        ],
        TaskStatus::AwaitingApproval => vec![
            RecoveryOption::new(
                RecoveryAction::Approve,
                "Approve and complete",
                "Accept the validated changes and finish the task",
            ),
            RecoveryOption::new(
                RecoveryAction::Reject,
                "Reject",
                "Reject the changes and close the task",
            ),
            view_errors(),
            abandon(),
        ],
        _ => Vec::new(),
    }
}

/// Truncate to [`ERROR_PREVIEW_CHARS`] characters, appending `...` when cut.
pub fn truncate_error(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(ERROR_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Human-readable diagnostics shown above the recovery menu.
pub fn recovery_context_lines(task: &Task) -> Vec<String> {
    let mut lines = vec![format!("Task {} is {}", task.id, task.status)];
    let step = task_step_name(task);
    if !step.is_empty() {
        lines.push(format!("Failed step: {step}"));
    }
    if let Some(error) = task.error_message() {
        lines.push(format!("Error: {}", truncate_error(&error)));
    }
    match task.status {
        TaskStatus::ValidationFailed => {
            if let Some(count) = task.metadata.validation_error_count() {
                lines.push(format!("{count} validation failures"));
            }
        }
        TaskStatus::GhFailed => {
            if let Some(kind) = task.metadata.push_error_type() {
                lines.push(format!("Push error: {kind}"));
            }
        }
        TaskStatus::CiFailed | TaskStatus::CiTimeout => {
            if let Some(url) = task
                .metadata
                .ci_url()
                .or_else(|| task.metadata.github_actions_url())
            {
                lines.push(format!("CI: {url}"));
            }
        }
        _ => {}
    }
    lines
}
