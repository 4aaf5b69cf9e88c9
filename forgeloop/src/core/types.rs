//! Shared deterministic types for the task lifecycle.
//!
//! These types define the persisted shape of tasks and workspaces. They are
//! consumed by JSON rendering and by anything that reads the stores, so field
//! and variant names are part of the stable contract.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::metadata::Metadata;

/// Lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Validating,
    AwaitingApproval,
    ValidationFailed,
    GhFailed,
    CiFailed,
    CiTimeout,
    Interrupted,
    Completed,
    Rejected,
    Abandoned,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 12] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Validating,
        TaskStatus::AwaitingApproval,
        TaskStatus::ValidationFailed,
        TaskStatus::GhFailed,
        TaskStatus::CiFailed,
        TaskStatus::CiTimeout,
        TaskStatus::Interrupted,
        TaskStatus::Completed,
        TaskStatus::Rejected,
        TaskStatus::Abandoned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Validating => "validating",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::ValidationFailed => "validation_failed",
            TaskStatus::GhFailed => "gh_failed",
            TaskStatus::CiFailed => "ci_failed",
            TaskStatus::CiTimeout => "ci_timeout",
            TaskStatus::Interrupted => "interrupted",
            TaskStatus::Completed => "completed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a single [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl StepStatus {
    /// Success and failure are the only statuses a step may hold once the
    /// task has moved past it.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failed)
    }
}

/// Known step kinds. Unrecognized step names map to [`StepKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Implement,
    Validate,
    Commit,
    Push,
    Pr,
    CiWait,
    Unknown,
}

impl StepKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "implement" => StepKind::Implement,
            "validate" => StepKind::Validate,
            "git_commit" => StepKind::Commit,
            "git_push" => StepKind::Push,
            "git_pr" => StepKind::Pr,
            "ci_wait" => StepKind::CiWait,
            _ => StepKind::Unknown,
        }
    }

    /// Canonical step name, `None` for [`StepKind::Unknown`].
    pub fn name(self) -> Option<&'static str> {
        match self {
            StepKind::Implement => Some("implement"),
            StepKind::Validate => Some("validate"),
            StepKind::Commit => Some("git_commit"),
            StepKind::Push => Some("git_push"),
            StepKind::Pr => Some("git_pr"),
            StepKind::CiWait => Some("ci_wait"),
            StepKind::Unknown => None,
        }
    }
}

/// A named phase of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of times the pipeline has started this step.
    #[serde(default)]
    pub attempts: u32,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            error: None,
            attempts: 0,
        }
    }

    pub fn kind(&self) -> StepKind {
        StepKind::from_name(&self.name)
    }
}

/// A unit of AI-assisted work progressing through ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub template_id: String,
    pub description: String,
    pub status: TaskStatus,
    /// Index of the step to run next. Signed so that corrupted records with a
    /// negative index still load and are reported as "no current step".
    pub current_step: i64,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        template_id: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<Step>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            template_id: template_id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            current_step: 0,
            steps,
            metadata: Metadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Index of the current step when it points at an existing step.
    pub fn step_index(&self) -> Option<usize> {
        let index = usize::try_from(self.current_step).ok()?;
        (index < self.steps.len()).then_some(index)
    }

    pub fn current(&self) -> Option<&Step> {
        self.step_index().map(|index| &self.steps[index])
    }

    pub fn current_mut(&mut self) -> Option<&mut Step> {
        self.step_index().map(move |index| &mut self.steps[index])
    }

    /// Most relevant error text: the current step's error, then the last
    /// failed step's error, then `metadata.last_error`.
    pub fn error_message(&self) -> Option<String> {
        if let Some(error) = self.current().and_then(|step| step.error.clone()) {
            return Some(error);
        }
        if let Some(error) = self
            .steps
            .iter()
            .rev()
            .find(|step| step.status == StepStatus::Failed)
            .and_then(|step| step.error.clone())
        {
            return Some(error);
        }
        self.metadata.last_error().map(str::to_string)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Whether a workspace is being driven or is waiting for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Active,
    Paused,
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceStatus::Active => f.write_str("active"),
            WorkspaceStatus::Paused => f.write_str("paused"),
        }
    }
}

/// An isolated git worktree bound to a task's working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub branch: String,
    pub base_branch: String,
    pub worktree_path: PathBuf,
    pub status: WorkspaceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(
        name: impl Into<String>,
        branch: impl Into<String>,
        base_branch: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            branch: branch.into(),
            base_branch: base_branch.into(),
            worktree_path: worktree_path.into(),
            status: WorkspaceStatus::Active,
            current_task_id: None,
            metadata: Metadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::GhFailed).expect("serialize");
        assert_eq!(json, "\"gh_failed\"");
        let json = serde_json::to_string(&TaskStatus::AwaitingApproval).expect("serialize");
        assert_eq!(json, "\"awaiting_approval\"");
        for status in TaskStatus::ALL {
            let json = serde_json::to_string(&status).expect("serialize");
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn unknown_step_names_map_to_unknown_kind() {
        assert_eq!(StepKind::from_name("git_push"), StepKind::Push);
        assert_eq!(StepKind::from_name("deploy"), StepKind::Unknown);
        assert_eq!(StepKind::from_name(""), StepKind::Unknown);
        assert_eq!(StepKind::Unknown.name(), None);
    }

    #[test]
    fn step_index_rejects_out_of_range() {
        let mut task = Task::new("t", "ws", "feature", "d", vec![Step::new("implement")]);
        assert_eq!(task.step_index(), Some(0));
        task.current_step = 1;
        assert_eq!(task.step_index(), None);
        task.current_step = -1;
        assert_eq!(task.step_index(), None);
    }

    #[test]
    fn error_message_prefers_current_step() {
        let mut task = Task::new(
            "t",
            "ws",
            "feature",
            "d",
            vec![Step::new("implement"), Step::new("validate")],
        );
        task.metadata.insert("last_error", "from metadata");
        assert_eq!(task.error_message().as_deref(), Some("from metadata"));

        task.steps[0].status = StepStatus::Failed;
        task.steps[0].error = Some("older failure".to_string());
        assert_eq!(task.error_message().as_deref(), Some("older failure"));

        task.current_step = 1;
        task.steps[1].error = Some("current failure".to_string());
        assert_eq!(task.error_message().as_deref(), Some("current failure"));
    }
}
