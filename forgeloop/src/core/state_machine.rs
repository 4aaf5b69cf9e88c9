//! Task status state machine.
//!
//! The allowed-transition table is the single authority for status changes
//! driven by the pipeline and the recovery executor. The interruption path is
//! the one exception and goes through [`force_status`].

use thiserror::Error;

use crate::core::types::{Task, TaskStatus};

impl TaskStatus {
    /// Failure-like statuses that carry a recovery menu.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            TaskStatus::ValidationFailed
                | TaskStatus::GhFailed
                | TaskStatus::CiFailed
                | TaskStatus::CiTimeout
                | TaskStatus::Interrupted
        )
    }

    /// Statuses from which `resume` may continue a task.
    pub fn is_resumable(self) -> bool {
        self.is_error() || self == TaskStatus::AwaitingApproval
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Rejected | TaskStatus::Abandoned
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task is in terminal status '{from}' and cannot move to '{to}'")]
    Terminal { from: TaskStatus, to: TaskStatus },
    #[error("transition from '{from}' to '{to}' is not allowed")]
    NotAllowed { from: TaskStatus, to: TaskStatus },
}

/// True when the table permits `from -> to`.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    check_transition(from, to).is_ok()
}

pub fn check_transition(from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
    if from.is_terminal() {
        return Err(TransitionError::Terminal { from, to });
    }
    let allowed = match (from, to) {
        (_, TaskStatus::Abandoned) => true,
        (from, TaskStatus::Running) if from.is_resumable() => true,
        (TaskStatus::Pending, TaskStatus::Running) => true,
        (
            TaskStatus::Running,
            TaskStatus::Validating
            | TaskStatus::GhFailed
            | TaskStatus::CiFailed
            | TaskStatus::CiTimeout
            | TaskStatus::Completed
            | TaskStatus::Interrupted,
        ) => true,
        (
            TaskStatus::Validating,
            TaskStatus::AwaitingApproval | TaskStatus::ValidationFailed | TaskStatus::Running,
        ) => true,
        (TaskStatus::AwaitingApproval, TaskStatus::Rejected) => true,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(TransitionError::NotAllowed { from, to })
    }
}

/// Apply a table-checked transition in memory. On error the task is left
/// untouched; persisting is the caller's job.
pub fn transition(task: &mut Task, to: TaskStatus) -> Result<(), TransitionError> {
    check_transition(task.status, to)?;
    task.status = to;
    task.touch();
    Ok(())
}

/// Set the status without consulting the table.
pub fn force_status(task: &mut Task, to: TaskStatus) {
    task.status = to;
    task.touch();
}
