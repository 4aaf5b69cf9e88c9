//! Lifecycle harness tests driving start, failure, interruption and resume
//! through the library with scripted steps.

use forgeloop::core::metadata::VALIDATION_ERROR_COUNT;
use forgeloop::core::recovery::RecoveryAction;
use forgeloop::core::types::{StepStatus, TaskStatus, WorkspaceStatus};
use forgeloop::interrupt::TaskInterrupted;
use forgeloop::io::notify::LifecycleEvent;
use forgeloop::io::task_store::TaskStore;
use forgeloop::io::workspace_store::WorkspaceStore;
use forgeloop::pipeline::StepOutcome;
use forgeloop::resume::{ResumeOutcome, ResumeRequest, resume_task};
use forgeloop::start::{StartRequest, start_task};
use forgeloop::test_support::TestEnv;

fn start_request(workspace: &str) -> StartRequest {
    StartRequest {
        workspace: workspace.to_string(),
        description: "Add a login page".to_string(),
        template: "feature".to_string(),
        branch: None,
    }
}

fn resume_request(workspace: &str, ai_fix: bool) -> ResumeRequest {
    ResumeRequest {
        workspace: workspace.to_string(),
        ai_fix,
    }
}

/// Full lifecycle: start → validation fails → operator retries with AI →
/// push fails → `--ai-fix` retries push → completed.
///
/// Checks that completed steps are never re-run except when retrying the
/// agent rewinds to `implement`.
#[test]
fn failures_are_recovered_until_completion() {
    let env = TestEnv::with_repo();
    env.steps.script(
        "validate",
        StepOutcome::Failed {
            error: "3 lint errors found".to_string(),
        },
    );
    env.steps.script(
        "git_push",
        StepOutcome::Failed {
            error: "could not resolve host: github.com".to_string(),
        },
    );

    // Start: stops on validation.
    let started = start_task(&env.engine(), &start_request("login")).expect("start");
    assert_eq!(started.status, TaskStatus::ValidationFailed);
    assert_eq!(started.current_step, 1);
    let ws = env.workspace_store.get("login").expect("workspace");
    assert_eq!(ws.status, WorkspaceStatus::Paused);

    let mut task = env.task_store.get("login", &started.task_id).expect("task");
    task.metadata.insert(VALIDATION_ERROR_COUNT, 3);
    env.task_store.update(&task).expect("update");

    // Resume interactively: pick "Retry with AI fix".
    env.terminal.push_input(&["1"]);
    let resumed = resume_task(&env.engine(), &resume_request("login", false)).expect("resume");
    assert_eq!(resumed.action, Some(RecoveryAction::RetryAi));
    assert_eq!(resumed.outcome, ResumeOutcome::Failed);
    assert_eq!(resumed.status, TaskStatus::GhFailed);
    assert_eq!(resumed.failed_step.as_deref(), Some("git_push"));
    let output = env.terminal.output();
    assert!(output.contains("3 validation failures"), "{output}");
    assert!(output.contains("Error: 3 lint errors found"), "{output}");

    let task = env.task_store.get("login", &started.task_id).expect("task");
    assert_eq!(task.metadata.retry_context(), Some("3 lint errors found"));

    // Resume with --ai-fix: the push menu leads with "Retry push".
    let finished = resume_task(&env.engine(), &resume_request("login", true)).expect("ai fix");
    assert_eq!(finished.action, Some(RecoveryAction::RetryGh));
    assert_eq!(finished.outcome, ResumeOutcome::Completed);

    let task = env.task_store.get("login", &started.task_id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.steps.iter().all(|step| step.status == StepStatus::Success));
    assert_eq!(task.steps[0].attempts, 2);
    assert_eq!(task.steps[3].attempts, 2);
    assert_eq!(task.steps[5].attempts, 1);

    assert_eq!(
        env.steps.calls(),
        vec![
            "implement",
            "validate",
            "implement",
            "validate",
            "git_commit",
            "git_push",
            "git_push",
            "git_pr",
            "ci_wait",
        ]
    );
    assert_eq!(
        env.notifier.events(),
        vec![
            LifecycleEvent::Failed,
            LifecycleEvent::Failed,
            LifecycleEvent::Completed
        ]
    );
    let ws = env.workspace_store.get("login").expect("workspace");
    assert_eq!(ws.status, WorkspaceStatus::Active);
}

/// Ctrl-C during a step saves resumable state; `resume` continues at the
/// interrupted step without a menu.
#[test]
fn interrupted_run_resumes_at_the_same_step() {
    let env = TestEnv::with_repo();
    env.steps.cancel_during("git_commit", env.cancel.clone());

    let err = start_task(&env.engine(), &start_request("api")).expect_err("interrupted");
    let interrupted = err.downcast_ref::<TaskInterrupted>().expect("interrupt");
    assert_eq!(interrupted.resume_command, "forgeloop resume api");
    assert!(env.terminal.output().contains("forgeloop resume api"));

    let task = env
        .task_store
        .get("api", &interrupted.task_id)
        .expect("task");
    assert_eq!(task.status, TaskStatus::Interrupted);
    assert_eq!(task.current_step, 2);
    assert_eq!(task.steps[2].status, StepStatus::Pending);
    assert_eq!(
        env.workspace_store.get("api").expect("ws").status,
        WorkspaceStatus::Paused
    );

    // A fresh invocation gets a fresh token; this one stays cancelled.
    let env_cancel_cleared = {
        let mut engine = env.engine();
        engine.cancel = forgeloop::cancel::CancellationToken::new();
        resume_task(&engine, &resume_request("api", false)).expect("resume")
    };
    assert_eq!(env_cancel_cleared.outcome, ResumeOutcome::Completed);
    assert_eq!(env_cancel_cleared.action, None);
    assert_eq!(
        env.steps.calls(),
        vec![
            "implement",
            "validate",
            "git_commit",
            "git_commit",
            "git_push",
            "git_pr",
            "ci_wait",
        ]
    );
}

/// Abandoning keeps the workspace and worktree; the task cannot be resumed
/// afterwards.
#[test]
fn abandoned_task_is_final() {
    let env = TestEnv::with_repo();
    env.steps.script(
        "ci_wait",
        StepOutcome::TimedOut {
            error: "CI still pending after 2700s".to_string(),
        },
    );
    let started = start_task(&env.engine(), &start_request("slow")).expect("start");
    assert_eq!(started.status, TaskStatus::CiTimeout);

    // CI timeout menu: continue, retry AI, fix manually, view logs, abandon.
    env.terminal.push_input(&["5"]);
    let report = resume_task(&env.engine(), &resume_request("slow", false)).expect("abandon");
    assert_eq!(report.action, Some(RecoveryAction::Abandon));
    assert_eq!(report.status, TaskStatus::Abandoned);
    assert!(!report.needs_recovery());
    assert!(started.worktree_path.exists());
    assert!(env.workspace_store.exists("slow").expect("exists"));

    let err = resume_task(&env.engine(), &resume_request("slow", false)).expect_err("final");
    assert!(format!("{err:#}").contains("cannot be resumed"));
}
