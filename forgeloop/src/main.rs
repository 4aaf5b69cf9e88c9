//! forgeloop CLI.
//!
//! Runs AI-assisted tasks in per-task git worktrees and recovers them after
//! failures or interruptions. State lives in `<main-repo>/.forgeloop/`.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use forgeloop::cancel::CancellationToken;
use forgeloop::engine::Engine;
use forgeloop::exit_codes;
use forgeloop::interrupt::TaskInterrupted;
use forgeloop::io::ai::CommandAiRunner;
use forgeloop::io::config::load_config;
use forgeloop::io::git::{GitBranchSync, GitError, detect_main_repo_path};
use forgeloop::io::notify::CommandNotifier;
use forgeloop::io::store::{StatePaths, StoreError};
use forgeloop::io::task_store::{FileTaskStore, is_transition_error};
use forgeloop::io::terminal::{MenuCanceled, StdTerminal};
use forgeloop::io::workspace_store::FileWorkspaceStore;
use forgeloop::logging;
use forgeloop::output::{OutputFormat, error_envelope, success_envelope};
use forgeloop::resume::{ResumeError, ResumeRequest, resume_task};
use forgeloop::start::{StartRequest, start_task};
use forgeloop::status::{render_status, workspace_status};
use forgeloop::steps::WorkflowStepExecutor;

#[derive(Parser)]
#[command(
    name = "forgeloop",
    version,
    about = "Run AI-assisted tasks in git worktrees and recover them when they fail"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a workspace (git worktree + branch) and run a new task in it.
    Start {
        workspace: String,
        /// What the agent should do.
        #[arg(short, long)]
        description: String,
        /// Step template from config (`feature`, `fix`, `commit` by default).
        #[arg(short, long, default_value = "feature")]
        template: String,
        /// Branch name. Defaults to `<template>/<workspace>`.
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Continue an interrupted or failed task, offering recovery actions.
    Resume {
        workspace: String,
        /// Apply the first recovery option without prompting.
        #[arg(long)]
        ai_fix: bool,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Show a workspace and its current task.
    Status {
        workspace: String,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
}

impl Command {
    fn output(&self) -> OutputFormat {
        match self {
            Command::Start { output, .. }
            | Command::Resume { output, .. }
            | Command::Status { output, .. } => *output,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let output = cli.command.output();
    let code = match run(cli.command) {
        Ok(code) => code,
        Err(err) => report_error(&err, output),
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(command: Command) -> Result<i32> {
    let cwd = std::env::current_dir().context("read current directory")?;
    let repo_root = detect_main_repo_path(&cwd)?;
    let paths = StatePaths::new(&repo_root);
    let config = load_config(&paths.config_path())?;
    logging::init(Some(&paths.root.join(&config.log_file)));

    let cancel = CancellationToken::new();
    cancel.install_ctrlc_handler();

    let tasks = FileTaskStore::new(paths.clone());
    let workspaces = FileWorkspaceStore::new(paths.clone());
    let ai = CommandAiRunner::new(config.ai.command.clone());
    let steps = WorkflowStepExecutor::new(&config, paths.clone(), &ai);
    let terminal = StdTerminal::new(config.open_urls);
    let notifier = CommandNotifier::new(config.notify.command.clone());
    let branch_sync = GitBranchSync;
    let output = command.output();
    let engine = Engine {
        repo_root: &repo_root,
        config: &config,
        tasks: &tasks,
        workspaces: &workspaces,
        steps: &steps,
        terminal: &terminal,
        notifier: &notifier,
        branch_sync: &branch_sync,
        cancel,
        output,
    };

    match command {
        Command::Start {
            workspace,
            description,
            template,
            branch,
            ..
        } => {
            let report = start_task(
                &engine,
                &StartRequest {
                    workspace,
                    description,
                    template,
                    branch,
                },
            )?;
            print_json(output, &report)?;
            Ok(recovery_code(report.needs_recovery()))
        }
        Command::Resume {
            workspace, ai_fix, ..
        } => {
            let report = resume_task(&engine, &ResumeRequest { workspace, ai_fix })?;
            print_json(output, &report)?;
            Ok(recovery_code(report.needs_recovery()))
        }
        Command::Status { workspace, .. } => {
            let report = workspace_status(&engine, &workspace)?;
            if output.is_json() {
                print_json(output, &report)?;
            } else {
                for line in render_status(&report) {
                    println!("{line}");
                }
            }
            Ok(exit_codes::OK)
        }
    }
}

/// In JSON mode, print the success envelope. Text mode has already written
/// its guidance through the terminal.
fn print_json<T: Serialize>(output: OutputFormat, payload: &T) -> Result<()> {
    if output.is_json() {
        let envelope = success_envelope(payload);
        println!(
            "{}",
            serde_json::to_string_pretty(&envelope).context("serialize output")?
        );
    }
    Ok(())
}

fn recovery_code(needs_recovery: bool) -> i32 {
    if needs_recovery {
        exit_codes::RECOVERY_NEEDED
    } else {
        exit_codes::OK
    }
}

fn report_error(err: &anyhow::Error, output: OutputFormat) -> i32 {
    let interrupted = err.downcast_ref::<TaskInterrupted>().is_some();
    if output.is_json() {
        let envelope = error_envelope(&format!("{err:#}"), error_kind(err));
        match serde_json::to_string_pretty(&envelope) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("{envelope}"),
        }
    } else if !interrupted {
        // Interruption already printed its resume instructions.
        eprintln!("error: {err:#}");
    }
    exit_code(err)
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<TaskInterrupted>().is_some() {
        return exit_codes::INTERRUPTED;
    }
    if err.downcast_ref::<MenuCanceled>().is_some() {
        return exit_codes::RECOVERY_NEEDED;
    }
    match err.downcast_ref::<ResumeError>() {
        Some(ResumeError::RecoveryRequired { .. } | ResumeError::ApprovalRequired { .. }) => {
            exit_codes::RECOVERY_NEEDED
        }
        _ => exit_codes::INVALID,
    }
}

fn error_kind(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(err) = err.downcast_ref::<ResumeError>() {
        return Some(err.kind());
    }
    if err.downcast_ref::<TaskInterrupted>().is_some() {
        return Some("interrupted");
    }
    if err.downcast_ref::<MenuCanceled>().is_some() {
        return Some("menu_canceled");
    }
    if is_transition_error(err) {
        return Some("invalid_transition");
    }
    if let Some(err) = err.downcast_ref::<StoreError>() {
        return Some(match err {
            StoreError::NotFound { .. } => "not_found",
            StoreError::AlreadyExists { .. } => "already_exists",
            StoreError::WorktreeInUse { .. } => "worktree_in_use",
            StoreError::InvalidKey { .. } => "invalid_name",
        });
    }
    if err.downcast_ref::<GitError>().is_some() {
        return Some("git");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use forgeloop::core::types::TaskStatus;

    #[test]
    fn parse_resume_flags() {
        let cli = Cli::parse_from(["forgeloop", "resume", "feat", "--ai-fix", "--output", "json"]);
        match cli.command {
            Command::Resume {
                workspace,
                ai_fix,
                output,
            } => {
                assert_eq!(workspace, "feat");
                assert!(ai_fix);
                assert_eq!(output, OutputFormat::Json);
            }
            _ => panic!("expected resume"),
        }
    }

    #[test]
    fn parse_start_defaults() {
        let cli = Cli::parse_from(["forgeloop", "start", "feat", "-d", "Add login"]);
        match cli.command {
            Command::Start {
                template,
                branch,
                output,
                ..
            } => {
                assert_eq!(template, "feature");
                assert_eq!(branch, None);
                assert_eq!(output, OutputFormat::Text);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn errors_map_to_stable_exit_codes() {
        let interrupted = anyhow::Error::from(TaskInterrupted {
            workspace: "ws".to_string(),
            task_id: "task-1".to_string(),
            resume_command: "forgeloop resume ws".to_string(),
        });
        assert_eq!(exit_code(&interrupted), exit_codes::INTERRUPTED);

        let invalid = anyhow::Error::from(ResumeError::InvalidState {
            task_id: "task-1".to_string(),
            status: TaskStatus::Completed,
        });
        assert_eq!(exit_code(&invalid), exit_codes::INVALID);
        assert_eq!(error_kind(&invalid), Some("invalid_state"));

        let needs_choice = anyhow::Error::from(ResumeError::RecoveryRequired {
            task_id: "task-1".to_string(),
            status: TaskStatus::CiFailed,
        });
        assert_eq!(exit_code(&needs_choice), exit_codes::RECOVERY_NEEDED);

        let canceled = anyhow::Error::from(MenuCanceled::ByUser).context("resume");
        assert_eq!(exit_code(&canceled), exit_codes::RECOVERY_NEEDED);

        assert_eq!(exit_code(&anyhow!("boom")), exit_codes::INVALID);
        assert_eq!(error_kind(&anyhow!("boom")), None);
    }
}
