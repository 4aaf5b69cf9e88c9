//! `start`: create a workspace and run a new task in it.
//!
//! A workspace is a named git worktree next to the main checkout
//! (`<repo>-<workspace>`) on its own branch. Starting one records the
//! workspace and a Pending task built from the chosen template, then runs the
//! pipeline until it completes, fails into a recoverable status, or is
//! interrupted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::metadata::REPOSITORY;
use crate::core::types::{Task, TaskStatus, Workspace};
use crate::engine::Engine;
use crate::io::git::{Git, calculate_worktree_path, create_worktree_for_branch};
use crate::io::store::{STATE_DIR, StoreError, validate_key};
use crate::pipeline::{PipelineOutcome, run_pipeline};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub workspace: String,
    pub description: String,
    pub template: String,
    /// Defaults to `<template>/<workspace>`.
    pub branch: Option<String>,
}

/// Outcome of `start`, printed as the JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub workspace: String,
    pub task_id: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub status: TaskStatus,
    pub current_step: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartReport {
    pub fn needs_recovery(&self) -> bool {
        self.status.is_error()
    }
}

#[instrument(skip_all, fields(workspace = %request.workspace, template = %request.template))]
pub fn start_task(engine: &Engine<'_>, request: &StartRequest) -> Result<StartReport> {
    validate_key("workspace", &request.workspace)?;
    if engine.workspaces.exists(&request.workspace)? {
        return Err(StoreError::AlreadyExists {
            kind: "workspace",
            key: request.workspace.clone(),
        }
        .into());
    }
    let template = engine.config.template(&request.template)?;
    let description = request.description.trim();
    if description.is_empty() {
        bail!("task description must not be empty");
    }

    ensure_state_gitignore(engine.repo_root)?;

    let branch = request
        .branch
        .clone()
        .unwrap_or_else(|| format!("{}/{}", request.template, request.workspace));
    let worktree_path = calculate_worktree_path(engine.repo_root, &request.workspace);
    let base = &engine.config.base_branch;
    create_worktree_for_branch(engine.repo_root, &worktree_path, &branch, base)?;
    engine.say(&format!(
        "Created worktree {} on branch {branch}",
        worktree_path.display()
    ))?;

    let mut task = Task::new(
        new_task_id(),
        &request.workspace,
        &request.template,
        description,
        template.build_steps(),
    );
    let mut workspace = Workspace::new(&request.workspace, &branch, base, &worktree_path);
    workspace.current_task_id = Some(task.id.clone());
    if let Some(url) = Git::new(engine.repo_root).remote_url(&engine.config.remote)? {
        workspace.metadata.insert(REPOSITORY, url);
    }
    engine
        .workspaces
        .create(&workspace)
        .context("record workspace")?;
    engine.tasks.create(&task).context("record task")?;
    engine.log_event(&task, "created", &task.description);
    info!(task_id = %task.id, branch = %branch, steps = task.steps.len(), "task created");
    engine.say(&format!("Started task {} in workspace {}", task.id, workspace.name))?;

    let outcome = run_pipeline(engine, &mut task, &mut workspace)?;
    let (failed_step, error) = match outcome {
        PipelineOutcome::Failed { step, error, .. } => (Some(step), Some(error)),
        PipelineOutcome::Completed | PipelineOutcome::AwaitingApproval => (None, None),
    };
    Ok(StartReport {
        workspace: workspace.name,
        task_id: task.id,
        branch,
        worktree_path,
        status: task.status,
        current_step: task.current_step,
        failed_step,
        error,
    })
}

fn new_task_id() -> String {
    Utc::now().format("task-%Y%m%d-%H%M%S").to_string()
}

/// Keep the state directory out of `git status` in the main checkout.
fn ensure_state_gitignore(repo_root: &Path) -> Result<()> {
    let dir = repo_root.join(STATE_DIR);
    let path = dir.join(".gitignore");
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    std::fs::write(&path, "*\n").with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::git::check_branch_exists;
    use crate::io::task_store::TaskStore;
    use crate::io::workspace_store::WorkspaceStore;
    use crate::pipeline::StepOutcome;
    use crate::test_support::TestEnv;

    fn request(workspace: &str) -> StartRequest {
        StartRequest {
            workspace: workspace.to_string(),
            description: "Add a greeting endpoint".to_string(),
            template: "feature".to_string(),
            branch: None,
        }
    }

    #[test]
    fn start_creates_worktree_records_and_runs_steps() {
        let env = TestEnv::with_repo();
        let report = start_task(&env.engine(), &request("greet")).expect("start");

        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.branch, "feature/greet");
        assert_eq!(
            report.worktree_path,
            calculate_worktree_path(env.root(), "greet")
        );
        assert!(report.worktree_path.join("README.md").exists());
        assert!(check_branch_exists(env.root(), "feature/greet"));

        let ws = env.workspace_store.get("greet").expect("workspace");
        assert_eq!(ws.current_task_id.as_deref(), Some(report.task_id.as_str()));
        let task = env.task_store.get("greet", &report.task_id).expect("task");
        assert_eq!(task.steps.len(), 6);
        assert_eq!(task.current_step, 6);
        assert!(task.id.starts_with("task-"));
        assert_eq!(
            env.steps.calls(),
            vec!["implement", "validate", "git_commit", "git_push", "git_pr", "ci_wait"]
        );
    }

    /// An existing branch is checked out into the new worktree as is.
    #[test]
    fn start_reuses_existing_branch() {
        let env = TestEnv::with_repo();
        let status = std::process::Command::new("git")
            .args(["branch", "feature/greet"])
            .current_dir(env.root())
            .status()
            .expect("git branch");
        assert!(status.success());

        let report = start_task(&env.engine(), &request("greet")).expect("start");
        assert_eq!(report.branch, "feature/greet");
        assert_eq!(report.status, TaskStatus::Completed);
        assert!(report.worktree_path.join("README.md").exists());
    }

    #[test]
    fn start_refuses_existing_workspace() {
        let env = TestEnv::with_repo();
        start_task(&env.engine(), &request("greet")).expect("first");
        let err = start_task(&env.engine(), &request("greet")).expect_err("duplicate");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn start_rejects_bad_input_before_touching_git() {
        let env = TestEnv::with_repo();
        let mut bad_template = request("greet");
        bad_template.template = "deploy".to_string();
        assert!(start_task(&env.engine(), &bad_template).is_err());

        let bad_name = request("a/b");
        assert!(start_task(&env.engine(), &bad_name).is_err());

        assert!(!check_branch_exists(env.root(), "deploy/greet"));
        assert!(!calculate_worktree_path(env.root(), "greet").exists());
    }

    #[test]
    fn start_reports_failed_step() {
        let env = TestEnv::with_repo();
        env.steps.script(
            "validate",
            StepOutcome::Failed {
                error: "1 of 1 validation commands failed: just ci".to_string(),
            },
        );
        let mut req = request("fix-login");
        req.template = "fix".to_string();
        req.branch = Some("bugfix/login".to_string());

        let report = start_task(&env.engine(), &req).expect("start");
        assert_eq!(report.status, TaskStatus::ValidationFailed);
        assert_eq!(report.failed_step.as_deref(), Some("validate"));
        assert!(report.needs_recovery());
        assert!(check_branch_exists(env.root(), "bugfix/login"));
    }
}
