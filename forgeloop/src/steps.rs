//! Default step implementations backed by the agent, shell validation
//! commands, `git`, and `gh`.

use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::metadata::{
    CI_URL, PR_URL, PUSH_ERROR_TYPE, RETRY_CONTEXT, VALIDATION_ERROR_COUNT,
};
use crate::core::types::StepKind;
use crate::io::ai::{AiRequest, AiRunner};
use crate::io::config::Config;
use crate::io::git::Git;
use crate::io::github::{ChecksSummary, Gh, classify_push_error, summarize_checks};
use crate::io::process::{ProcessLimits, Stop, run_process, sh};
use crate::io::store::StatePaths;
use crate::pipeline::{StepContext, StepExecutor, StepOutcome};

/// Artifact holding the latest validation run.
pub const VALIDATION_ARTIFACT: &str = "validation.json";

/// One validation command's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRun {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output: String,
}

/// Contents of [`VALIDATION_ARTIFACT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub error_count: u64,
    pub runs: Vec<ValidationRun>,
}

impl ValidationReport {
    /// Operator-facing rendering of failed commands.
    pub fn render_failures(&self) -> String {
        let mut buf = String::new();
        for run in self.runs.iter().filter(|run| !run.success) {
            buf.push_str(&format!("--- {} (exit {:?}) ---\n", run.command, run.exit_code));
            buf.push_str(run.output.trim_end());
            buf.push('\n');
        }
        buf
    }
}

pub struct WorkflowStepExecutor<'a> {
    config: &'a Config,
    paths: StatePaths,
    ai: &'a dyn AiRunner,
}

impl<'a> WorkflowStepExecutor<'a> {
    pub fn new(config: &'a Config, paths: StatePaths, ai: &'a dyn AiRunner) -> Self {
        Self { config, paths, ai }
    }

    #[instrument(skip_all)]
    fn implement(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let task = &*ctx.task;
        let attempt = task.current().map_or(1, |step| step.attempts);
        let mut prompt = format!(
            "You are working in the git worktree for branch '{}'.\n\nTask:\n{}\n",
            ctx.workspace.branch, task.description
        );
        if let Some(retry) = task.metadata.retry_context() {
            prompt.push_str("\nThe previous attempt failed with:\n");
            prompt.push_str(retry);
            prompt.push_str("\n\nFix the cause of this failure while completing the task.\n");
        }
        let request = AiRequest {
            workdir: ctx.workspace.worktree_path.clone(),
            prompt,
            log_path: self
                .paths
                .artifacts_dir(&task.workspace_id, &task.id)
                .join(format!("agent-{attempt}.log")),
            timeout: self.config.ai_timeout(),
            output_limit_bytes: self.config.ai.output_limit_bytes,
            cancel: ctx.cancel.clone(),
        };
        match self.ai.run(&request) {
            Ok(result) if result.success => {
                ctx.task.metadata.remove(RETRY_CONTEXT);
                StepOutcome::Success
            }
            Ok(result) if result.timed_out => StepOutcome::Failed {
                error: format!(
                    "agent timed out after {}s",
                    self.config.ai.timeout_secs
                ),
            },
            Ok(result) => StepOutcome::Failed {
                error: if result.summary.is_empty() {
                    "agent exited unsuccessfully".to_string()
                } else {
                    format!("agent exited unsuccessfully: {}", result.summary)
                },
            },
            Err(err) => StepOutcome::Failed {
                error: format!("{err:#}"),
            },
        }
    }

    #[instrument(skip_all)]
    fn validate(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let mut runs = Vec::new();
        for command in &self.config.validation.commands {
            if ctx.cancel.is_cancelled() {
                return StepOutcome::Canceled;
            }
            debug!(command = %command, "running validation command");
            let mut cmd = sh(command);
            cmd.current_dir(&ctx.workspace.worktree_path);
            let limits = ProcessLimits {
                timeout: self.config.validation_timeout(),
                output_limit: self.config.ai.output_limit_bytes,
            };
            let run = match run_process(cmd, None, limits, ctx.cancel) {
                Ok(output) if output.stop == Stop::Canceled => return StepOutcome::Canceled,
                Ok(output) => ValidationRun {
                    command: command.clone(),
                    success: output.succeeded(),
                    exit_code: output.status.code(),
                    timed_out: output.stop == Stop::TimedOut,
                    output: output.transcript("validation"),
                },
                Err(err) => ValidationRun {
                    command: command.clone(),
                    success: false,
                    exit_code: None,
                    timed_out: false,
                    output: format!("{err:#}"),
                },
            };
            runs.push(run);
        }

        let error_count = runs.iter().filter(|run| !run.success).count() as u64;
        let report = ValidationReport {
            passed: error_count == 0,
            error_count,
            runs,
        };
        ctx.task
            .metadata
            .insert(VALIDATION_ERROR_COUNT, report.error_count);
        if let Err(err) = save_report(ctx, &report) {
            warn!(err = %format!("{err:#}"), "failed to save validation artifact");
        }
        if report.passed {
            info!(commands = report.runs.len(), "validation passed");
            return StepOutcome::Success;
        }
        let failed: Vec<&str> = report
            .runs
            .iter()
            .filter(|run| !run.success)
            .map(|run| run.command.as_str())
            .collect();
        StepOutcome::Failed {
            error: format!(
                "{} of {} validation commands failed: {}",
                failed.len(),
                report.runs.len(),
                failed.join(", ")
            ),
        }
    }

    fn commit(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let git = Git::new(&ctx.workspace.worktree_path);
        let summary = ctx
            .task
            .description
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        let message = format!("{summary}\n\nTask: {}", ctx.task.id);
        match git.commit_all(&message) {
            Ok(committed) => {
                debug!(committed, "commit step finished");
                StepOutcome::Success
            }
            Err(err) => StepOutcome::Failed {
                error: format!("{err:#}"),
            },
        }
    }

    fn push(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let git = Git::new(&ctx.workspace.worktree_path);
        match git.push(&self.config.remote, &ctx.workspace.branch) {
            Ok(()) => {
                ctx.task.metadata.remove(PUSH_ERROR_TYPE);
                StepOutcome::Success
            }
            Err(err) => {
                let error = format!("{err:#}");
                let kind = classify_push_error(&error);
                warn!(push_error_type = kind, "push failed");
                ctx.task.metadata.insert(PUSH_ERROR_TYPE, kind);
                StepOutcome::Failed { error }
            }
        }
    }

    fn pr(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        if let Some(url) = ctx.task.metadata.pr_url() {
            debug!(url, "pull request already exists");
            return StepOutcome::Success;
        }
        let gh = Gh::new(&ctx.workspace.worktree_path);
        let title = ctx.task.description.lines().next().unwrap_or("").trim();
        let body = format!("{}\n\nTask: {}", ctx.task.description, ctx.task.id);
        match gh.pr_create(&ctx.workspace.base_branch, &ctx.workspace.branch, title, &body) {
            Ok(url) => {
                info!(url = %url, "pull request created");
                ctx.task.metadata.insert(PR_URL, url.clone());
                ctx.workspace.metadata.insert(PR_URL, url);
                StepOutcome::Success
            }
            Err(err) => StepOutcome::Failed {
                error: format!("{err:#}"),
            },
        }
    }

    #[instrument(skip_all)]
    fn ci_wait(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let gh = Gh::new(&ctx.workspace.worktree_path);
        let started = Instant::now();
        loop {
            if ctx.cancel.is_cancelled() {
                return StepOutcome::Canceled;
            }
            let checks = match gh.pr_checks() {
                Ok(checks) => checks,
                Err(err) => {
                    return StepOutcome::Failed {
                        error: format!("{err:#}"),
                    };
                }
            };
            match summarize_checks(&checks) {
                ChecksSummary::Passed => {
                    info!("ci passed");
                    return StepOutcome::Success;
                }
                ChecksSummary::Failed { url } => {
                    if let Some(url) = url {
                        ctx.task.metadata.insert(CI_URL, url);
                    }
                    return StepOutcome::Failed {
                        error: "CI checks failed".to_string(),
                    };
                }
                ChecksSummary::Pending => {}
            }
            if started.elapsed() >= self.config.ci_timeout() {
                return StepOutcome::TimedOut {
                    error: format!(
                        "CI did not finish within {}s",
                        self.config.ci.timeout_secs
                    ),
                };
            }
            debug!("ci pending");
            if ctx.cancel.sleep(self.config.ci_poll_interval()) {
                return StepOutcome::Canceled;
            }
        }
    }
}

fn save_report(ctx: &StepContext<'_>, report: &ValidationReport) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(report)?;
    buf.push(b'\n');
    ctx.tasks.save_artifact(
        &ctx.task.workspace_id,
        &ctx.task.id,
        VALIDATION_ARTIFACT,
        &buf,
    )?;
    Ok(())
}

impl StepExecutor for WorkflowStepExecutor<'_> {
    fn execute(&self, kind: StepKind, ctx: &mut StepContext<'_>) -> StepOutcome {
        match kind {
            StepKind::Implement => self.implement(ctx),
            StepKind::Validate => self.validate(ctx),
            StepKind::Commit => self.commit(ctx),
            StepKind::Push => self.push(ctx),
            StepKind::Pr => self.pr(ctx),
            StepKind::CiWait => self.ci_wait(ctx),
            StepKind::Unknown => StepOutcome::Failed {
                error: format!(
                    "unknown step '{}'",
                    crate::core::recovery::task_step_name(ctx.task)
                ),
            },
        }
    }
}
