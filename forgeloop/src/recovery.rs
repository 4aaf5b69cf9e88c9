//! Applies an operator-selected recovery action.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::metadata::{
    APPROVED, CI_URL, GITHUB_ACTIONS_URL, PUSH_ERROR_TYPE, RETRY_CONTEXT, VALIDATION_ERROR_COUNT,
};
use crate::core::recovery::RecoveryAction;
use crate::core::state_machine::check_transition;
use crate::core::types::{StepKind, StepStatus, Task, TaskStatus, Workspace, WorkspaceStatus};
use crate::engine::Engine;
use crate::io::notify::LifecycleEvent;
use crate::io::task_store::transition_and_save;
use crate::steps::{VALIDATION_ARTIFACT, ValidationReport};

/// `done` ends the recovery loop; `auto_resume` re-enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionResult {
    pub done: bool,
    pub auto_resume: bool,
}

impl ActionResult {
    const RESUME: Self = Self {
        done: true,
        auto_resume: true,
    };
    const STOP: Self = Self {
        done: true,
        auto_resume: false,
    };
    const AGAIN: Self = Self {
        done: false,
        auto_resume: false,
    };
}

/// Apply `action`. Status-changing actions check the transition table first
/// and persist before returning; a rejected transition has no side effects.
#[instrument(skip_all, fields(workspace = %workspace.name, task_id = %task.id, %action))]
pub fn execute_recovery_action_with_resume(
    engine: &Engine<'_>,
    task: &mut Task,
    workspace: &mut Workspace,
    action: RecoveryAction,
) -> Result<ActionResult> {
    if action == RecoveryAction::Unknown {
        debug!("ignoring unknown recovery action");
        return Ok(ActionResult::AGAIN);
    }
    info!(status = %task.status, "executing recovery action");
    engine.log_event(task, "recovery_action", action.as_str());
    match action {
        RecoveryAction::RetryAi => {
            check_transition(task.status, TaskStatus::Running)?;
            let mut retried = task.clone();
            let context = task
                .error_message()
                .unwrap_or_else(|| format!("previous attempt ended in status {}", task.status));
            retried.metadata.insert(RETRY_CONTEXT, context);
            rewind_to_implement(&mut retried);
            transition_and_save(engine.tasks, &mut retried, TaskStatus::Running)?;
            *task = retried;
            engine.say("Retrying with the last error as context.")?;
            Ok(ActionResult::RESUME)
        }
        RecoveryAction::RetryGh | RecoveryAction::RetryCommit | RecoveryAction::ContinueWaiting => {
            transition_and_save(engine.tasks, task, TaskStatus::Running)?;
            Ok(ActionResult::RESUME)
        }
        RecoveryAction::RebaseRetry => {
            check_transition(task.status, TaskStatus::Running)?;
            engine.say(&format!(
                "Rebasing {} onto {}/{}...",
                workspace.branch, engine.config.remote, workspace.base_branch
            ))?;
            engine
                .branch_sync
                .rebase_onto_base(workspace, &engine.config.remote)
                .context("rebase before retry")?;
            task.metadata.remove(PUSH_ERROR_TYPE);
            transition_and_save(engine.tasks, task, TaskStatus::Running)?;
            Ok(ActionResult::RESUME)
        }
        RecoveryAction::FixManually => {
            engine.say("")?;
            engine.say(&format!(
                "Fix the problem in the worktree: {}",
                workspace.worktree_path.display()
            ))?;
            engine.say(&format!(
                "Then continue with: {}",
                engine.resume_command(&workspace.name)
            ))?;
            Ok(ActionResult::STOP)
        }
        RecoveryAction::ViewErrors => {
            show_validation_errors(engine, task, workspace)?;
            Ok(ActionResult::AGAIN)
        }
        RecoveryAction::ViewLogs => {
            show_ci_logs(engine, task, workspace)?;
            Ok(ActionResult::AGAIN)
        }
        RecoveryAction::Abandon => {
            transition_and_save(engine.tasks, task, TaskStatus::Abandoned)?;
            release_workspace(engine, workspace)?;
            engine.notify(LifecycleEvent::Abandoned, task, workspace, "task abandoned");
            engine.say(&format!(
                "Task {} abandoned. Branch '{}' is kept at {}.",
                task.id,
                workspace.branch,
                workspace.worktree_path.display()
            ))?;
            Ok(ActionResult::STOP)
        }
        RecoveryAction::Approve => {
            check_transition(task.status, TaskStatus::Running)?;
            task.metadata.insert(APPROVED, true);
            transition_and_save(engine.tasks, task, TaskStatus::Running)?;
            Ok(ActionResult::RESUME)
        }
        RecoveryAction::Reject => {
            transition_and_save(engine.tasks, task, TaskStatus::Rejected)?;
            release_workspace(engine, workspace)?;
            engine.say(&format!("Task {} rejected.", task.id))?;
            Ok(ActionResult::STOP)
        }
        RecoveryAction::Unknown => Ok(ActionResult::AGAIN),
    }
}

/// Move `current_step` back to the nearest implement step at or before it
/// and reset everything from there on. Tasks without an implement step
/// retry the current step.
///
/// Validation counts and CI links describe the run being replaced and are
/// dropped.
fn rewind_to_implement(task: &mut Task) {
    for key in [VALIDATION_ERROR_COUNT, CI_URL, GITHUB_ACTIONS_URL] {
        task.metadata.remove(key);
    }
    let upper = match task.step_index() {
        Some(index) => index,
        None => task.steps.len().saturating_sub(1),
    };
    let Some(target) = task.steps[..task.steps.len().min(upper + 1)]
        .iter()
        .rposition(|step| step.kind() == StepKind::Implement)
    else {
        return;
    };
    for step in &mut task.steps[target..] {
        step.status = StepStatus::Pending;
        step.error = None;
    }
    task.current_step = target as i64;
}

fn release_workspace(engine: &Engine<'_>, workspace: &mut Workspace) -> Result<()> {
    workspace.status = WorkspaceStatus::Active;
    workspace.touch();
    engine
        .workspaces
        .update(workspace)
        .context("persist workspace")
}

fn show_validation_errors(engine: &Engine<'_>, task: &Task, workspace: &Workspace) -> Result<()> {
    let loaded = engine
        .tasks
        .load_artifact(&workspace.name, &task.id, VALIDATION_ARTIFACT)
        .and_then(|raw| {
            serde_json::from_slice::<ValidationReport>(&raw).context("parse validation artifact")
        });
    match loaded {
        Ok(report) if report.passed => engine.say("The latest validation run passed."),
        Ok(report) => {
            engine.say(&format!("{} validation failures:", report.error_count))?;
            for line in report.render_failures().lines() {
                engine.say(line)?;
            }
            Ok(())
        }
        Err(err) => engine.say(&format!(
            "Could not load validation errors for task {}: {err:#}",
            task.id
        )),
    }
}

fn show_ci_logs(engine: &Engine<'_>, task: &Task, workspace: &Workspace) -> Result<()> {
    let url = task
        .metadata
        .ci_url()
        .or_else(|| task.metadata.github_actions_url())
        .or_else(|| workspace.metadata.pr_url());
    let Some(url) = url else {
        return engine.say("No URL available for this task's CI logs.");
    };
    if engine.terminal.open_url(url)? {
        engine.say(&format!("Opened {url}"))
    } else {
        engine.say(&format!("CI logs: {url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::PR_URL;
    use crate::core::state_machine::TransitionError;
    use crate::io::task_store::TaskStore;
    use crate::io::workspace_store::WorkspaceStore;
    use crate::test_support::{TaskBuilder, TestEnv};

    const FULL: [&str; 6] = [
        "implement",
        "validate",
        "git_commit",
        "git_push",
        "git_pr",
        "ci_wait",
    ];

    /// Retry-style actions resume resumable tasks and reject completed ones.
    #[test]
    fn retry_actions_resume_or_fail_on_completed() {
        for action in [
            RecoveryAction::RetryAi,
            RecoveryAction::RetryGh,
            RecoveryAction::RetryCommit,
            RecoveryAction::ContinueWaiting,
        ] {
            let env = TestEnv::new();
            let (mut task, mut ws) = env.seed(
                TaskBuilder::new("ws")
                    .steps(&FULL)
                    .current_step(3)
                    .status(TaskStatus::GhFailed),
            );
            let result =
                execute_recovery_action_with_resume(&env.engine(), &mut task, &mut ws, action)
                    .expect("action");
            assert_eq!(result, ActionResult::RESUME, "{action}");
            assert_eq!(task.status, TaskStatus::Running);
            assert_eq!(
                env.task_store.get("ws", &task.id).expect("stored").status,
                TaskStatus::Running
            );

            let env = TestEnv::new();
            let (mut task, mut ws) = env.seed(
                TaskBuilder::new("ws")
                    .steps(&FULL)
                    .current_step(6)
                    .status(TaskStatus::Completed),
            );
            let before = task.clone();
            let err =
                execute_recovery_action_with_resume(&env.engine(), &mut task, &mut ws, action)
                    .expect_err("completed");
            assert!(matches!(
                err.downcast_ref::<TransitionError>(),
                Some(TransitionError::Terminal { .. })
            ));
            assert_eq!(task, before, "{action}");
            assert_eq!(
                env.task_store.get("ws", &task.id).expect("stored").status,
                TaskStatus::Completed
            );
        }
    }

    #[test]
    fn retry_ai_rewinds_to_implement_with_context() {
        let env = TestEnv::new();
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("ws")
                .steps(&FULL)
                .current_step(1)
                .status(TaskStatus::ValidationFailed)
                .step_status(0, StepStatus::Success)
                .step_error(1, "3 lint errors found")
                .metadata(VALIDATION_ERROR_COUNT, 3)
                .metadata(CI_URL, "https://ci.example/run/7"),
        );
        execute_recovery_action_with_resume(&env.engine(), &mut task, &mut ws, RecoveryAction::RetryAi)
            .expect("retry");
        assert_eq!(task.current_step, 0);
        assert!(task.steps.iter().all(|s| s.status == StepStatus::Pending && s.error.is_none()));
        assert_eq!(task.metadata.retry_context(), Some("3 lint errors found"));
        assert_eq!(task.metadata.validation_error_count(), None);
        assert_eq!(task.metadata.ci_url(), None);
        assert_eq!(env.task_store.get("ws", &task.id).expect("stored"), task);
    }

    #[test]
    fn retry_ai_leaves_task_untouched_when_save_fails() {
        let env = TestEnv::new();
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("ws")
                .steps(&FULL)
                .current_step(1)
                .status(TaskStatus::ValidationFailed)
                .step_status(0, StepStatus::Success)
                .step_error(1, "3 lint errors found")
                .metadata(VALIDATION_ERROR_COUNT, 3),
        );
        let before = task.clone();
        env.task_store.reject_updates();
        let err = execute_recovery_action_with_resume(
            &env.engine(),
            &mut task,
            &mut ws,
            RecoveryAction::RetryAi,
        )
        .expect_err("save fails");
        assert!(format!("{err:#}").contains("rejected update"));
        assert_eq!(task, before);
    }

    #[test]
    fn rebase_retry_clears_push_error_and_resumes() {
        let env = TestEnv::new();
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("ws")
                .steps(&FULL)
                .current_step(3)
                .status(TaskStatus::GhFailed)
                .metadata(PUSH_ERROR_TYPE, "non_fast_forward"),
        );
        let result = execute_recovery_action_with_resume(
            &env.engine(),
            &mut task,
            &mut ws,
            RecoveryAction::RebaseRetry,
        )
        .expect("rebase");
        assert_eq!(result, ActionResult::RESUME);
        assert_eq!(env.branch_sync.calls(), 1);
        assert_eq!(task.metadata.push_error_type(), None);
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn failed_rebase_leaves_status_unchanged() {
        let env = TestEnv::new();
        env.branch_sync.fail_with("conflict in src/lib.rs");
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("ws")
                .steps(&FULL)
                .current_step(3)
                .status(TaskStatus::GhFailed)
                .metadata(PUSH_ERROR_TYPE, "non_fast_forward"),
        );
        let err = execute_recovery_action_with_resume(
            &env.engine(),
            &mut task,
            &mut ws,
            RecoveryAction::RebaseRetry,
        )
        .expect_err("conflict");
        assert!(format!("{err:#}").contains("conflict in src/lib.rs"));
        assert_eq!(task.status, TaskStatus::GhFailed);
        assert_eq!(task.metadata.push_error_type(), Some("non_fast_forward"));
    }

    #[test]
    fn fix_manually_prints_worktree_and_resume_command() {
        let env = TestEnv::new();
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("feat")
                .steps(&FULL)
                .status(TaskStatus::CiFailed),
        );
        let result = execute_recovery_action_with_resume(
            &env.engine(),
            &mut task,
            &mut ws,
            RecoveryAction::FixManually,
        )
        .expect("fix");
        assert_eq!(result, ActionResult::STOP);
        assert_eq!(task.status, TaskStatus::CiFailed);
        let output = env.terminal.output();
        assert!(output.contains(&ws.worktree_path.display().to_string()));
        assert!(output.contains("forgeloop resume feat"));
    }

    #[test]
    fn view_errors_reports_missing_artifact() {
        let env = TestEnv::new();
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("ws")
                .steps(&FULL)
                .status(TaskStatus::ValidationFailed),
        );
        let result = execute_recovery_action_with_resume(
            &env.engine(),
            &mut task,
            &mut ws,
            RecoveryAction::ViewErrors,
        )
        .expect("view");
        assert_eq!(result, ActionResult::AGAIN);
        assert!(env.terminal.output().contains("Could not load validation errors"));
    }

    #[test]
    fn view_logs_prefers_ci_url_then_actions_then_pr() {
        let env = TestEnv::new();
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("ws")
                .steps(&FULL)
                .status(TaskStatus::CiFailed),
        );
        let engine = env.engine();

        execute_recovery_action_with_resume(&engine, &mut task, &mut ws, RecoveryAction::ViewLogs)
            .expect("none");
        assert!(env.terminal.output().contains("No URL available"));

        ws.metadata.insert(PR_URL, "https://github.com/a/b/pull/1");
        task.metadata.insert(GITHUB_ACTIONS_URL, "https://github.com/a/b/actions/runs/2");
        execute_recovery_action_with_resume(&engine, &mut task, &mut ws, RecoveryAction::ViewLogs)
            .expect("actions");
        assert!(env.terminal.output().contains("CI logs: https://github.com/a/b/actions/runs/2"));

        task.metadata.insert(CI_URL, "https://ci.example/run/3");
        execute_recovery_action_with_resume(&engine, &mut task, &mut ws, RecoveryAction::ViewLogs)
            .expect("ci");
        assert!(env.terminal.output().contains("CI logs: https://ci.example/run/3"));
        assert_eq!(task.status, TaskStatus::CiFailed);
    }

    #[test]
    fn abandon_keeps_workspace_and_prints_branch() {
        let env = TestEnv::new();
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("ws")
                .steps(&FULL)
                .status(TaskStatus::CiTimeout),
        );
        let result = execute_recovery_action_with_resume(
            &env.engine(),
            &mut task,
            &mut ws,
            RecoveryAction::Abandon,
        )
        .expect("abandon");
        assert_eq!(result, ActionResult::STOP);
        assert_eq!(task.status, TaskStatus::Abandoned);
        assert!(env.workspace_store.exists("ws").expect("exists"));
        assert!(env.terminal.output().contains(&ws.branch));
        assert_eq!(env.notifier.events(), vec![LifecycleEvent::Abandoned]);
    }

    #[test]
    fn approve_and_reject_follow_approval_gate() {
        let env = TestEnv::new();
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("ws")
                .steps(&["implement"])
                .current_step(1)
                .status(TaskStatus::AwaitingApproval),
        );
        let mut rejected = task.clone();
        let result =
            execute_recovery_action_with_resume(&env.engine(), &mut task, &mut ws, RecoveryAction::Approve)
                .expect("approve");
        assert_eq!(result, ActionResult::RESUME);
        assert!(task.metadata.approved());

        let result = execute_recovery_action_with_resume(
            &env.engine(),
            &mut rejected,
            &mut ws,
            RecoveryAction::Reject,
        )
        .expect("reject");
        assert_eq!(result, ActionResult::STOP);
        assert_eq!(rejected.status, TaskStatus::Rejected);
    }

    #[test]
    fn unknown_action_is_a_no_op() {
        let env = TestEnv::new();
        let (mut task, mut ws) = env.seed(
            TaskBuilder::new("ws")
                .steps(&FULL)
                .status(TaskStatus::GhFailed),
        );
        let before = task.clone();
        let result = execute_recovery_action_with_resume(
            &env.engine(),
            &mut task,
            &mut ws,
            RecoveryAction::Unknown,
        )
        .expect("unknown");
        assert_eq!(result, ActionResult::AGAIN);
        assert_eq!(task, before);
        assert_eq!(env.task_store.writes(), 0);
        assert_eq!(env.workspace_store.writes(), 0);
    }
}
