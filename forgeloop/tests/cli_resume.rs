//! CLI tests for `forgeloop start|resume|status`.
//!
//! Spawns the forgeloop binary inside a scratch repository and checks exit
//! codes and the JSON envelope.

use std::path::Path;
use std::process::{Command, Output};

use forgeloop::core::types::{Step, StepStatus, Task, TaskStatus, Workspace};
use forgeloop::exit_codes;
use forgeloop::io::config::{Config, write_config};
use forgeloop::io::store::StatePaths;
use forgeloop::io::task_store::{FileTaskStore, TaskStore};
use forgeloop::io::workspace_store::{FileWorkspaceStore, WorkspaceStore};
use forgeloop::test_support::TestRepo;
use serde_json::Value;

fn forgeloop(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_forgeloop"))
        .current_dir(root)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("run forgeloop")
}

fn json(out: &Output) -> Value {
    serde_json::from_slice(&out.stdout).expect("stdout is one JSON document")
}

/// Record a workspace with one task in `status`, bypassing the pipeline.
fn seed(root: &Path, workspace: &str, status: TaskStatus) -> Task {
    let paths = StatePaths::new(root);
    let ws_store = FileWorkspaceStore::new(paths.clone());
    let task_store = FileTaskStore::new(paths);

    let mut task = Task::new(
        "task-20260101-120000",
        workspace,
        "feature",
        "Add a login page",
        vec![Step::new("implement"), Step::new("validate")],
    );
    task.status = status;
    task.current_step = 1;
    task.steps[0].status = StepStatus::Success;
    if status == TaskStatus::ValidationFailed {
        task.steps[1].status = StepStatus::Failed;
        task.steps[1].error = Some("3 lint errors found".to_string());
    }
    let mut ws = Workspace::new(
        workspace,
        format!("feature/{workspace}"),
        "main",
        root.join("unused-worktree"),
    );
    ws.current_task_id = Some(task.id.clone());
    ws_store.create(&ws).expect("create workspace");
    task_store.create(&task).expect("create task");
    task
}

#[test]
fn resume_unknown_workspace_exits_invalid() {
    let repo = TestRepo::new().expect("repo");

    let out = forgeloop(repo.root(), &["resume", "ghost"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("workspace 'ghost' not found"), "{stderr}");
    assert!(out.stdout.is_empty());

    let out = forgeloop(repo.root(), &["resume", "ghost", "--output", "json"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    let envelope = json(&out);
    assert_eq!(envelope["success"], false);
    assert_eq!(envelope["error_kind"], "workspace_not_found");
}

#[test]
fn resume_completed_task_is_invalid_state_and_writes_nothing() {
    let repo = TestRepo::new().expect("repo");
    let task = seed(repo.root(), "done", TaskStatus::Completed);
    let task_file = StatePaths::new(repo.root()).task_file("done", &task.id);
    let before = std::fs::read(&task_file).expect("read task");

    let out = forgeloop(repo.root(), &["resume", "done", "--output", "json"]);

    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert_eq!(json(&out)["error_kind"], "invalid_state");
    assert_eq!(std::fs::read(&task_file).expect("read task"), before);
}

#[test]
fn json_resume_of_failed_task_needs_a_choice() {
    let repo = TestRepo::new().expect("repo");
    seed(repo.root(), "lint", TaskStatus::ValidationFailed);

    let out = forgeloop(repo.root(), &["resume", "lint", "--output", "json"]);

    assert_eq!(out.status.code(), Some(exit_codes::RECOVERY_NEEDED));
    let envelope = json(&out);
    assert_eq!(envelope["success"], false);
    assert_eq!(envelope["error_kind"], "recovery_required");
}

#[test]
fn status_reports_task_as_json_and_text() {
    let repo = TestRepo::new().expect("repo");
    seed(repo.root(), "lint", TaskStatus::ValidationFailed);

    let out = forgeloop(repo.root(), &["status", "lint", "--output", "json"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let envelope = json(&out);
    assert_eq!(envelope["success"], true);
    assert_eq!(envelope["task"]["status"], "validation_failed");
    assert_eq!(envelope["task"]["error"], "3 lint errors found");
    assert_eq!(envelope["resume_command"], "forgeloop resume lint");

    let out = forgeloop(repo.root(), &["status", "lint"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Workspace: lint (active)"), "{stdout}");
    assert!(stdout.contains("Resume with: forgeloop resume lint"), "{stdout}");
}

/// `start` with a shell "agent" runs implement → validate → commit in a new
/// worktree and reports the completed task.
#[test]
fn start_runs_commit_template_end_to_end() {
    let repo = TestRepo::new().expect("repo");
    let paths = StatePaths::new(repo.root());
    let mut config = Config::default();
    config.ai.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "cat > /dev/null; echo hello > greeting.txt".to_string(),
    ];
    config.validation.commands = vec!["test -f greeting.txt".to_string()];
    write_config(&paths.config_path(), &config).expect("write config");

    let out = forgeloop(
        repo.root(),
        &[
            "start",
            "greet",
            "--description",
            "Write a greeting",
            "--template",
            "commit",
            "--output",
            "json",
        ],
    );

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(out.status.code(), Some(exit_codes::OK), "{stderr}");
    let envelope = json(&out);
    assert_eq!(envelope["success"], true);
    assert_eq!(envelope["status"], "completed");
    assert_eq!(envelope["branch"], "commit/greet");

    let worktree = Path::new(envelope["worktree_path"].as_str().expect("path")).to_path_buf();
    assert!(worktree.join("greeting.txt").exists());
    let log = Command::new("git")
        .args(["log", "-1", "--pretty=%s"])
        .current_dir(&worktree)
        .output()
        .expect("git log");
    assert!(String::from_utf8_lossy(&log.stdout).contains("Write a greeting"));

    let out = forgeloop(repo.root(), &["resume", "greet"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn commands_fail_outside_a_repository() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = forgeloop(temp.path(), &["status", "anything"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
}
