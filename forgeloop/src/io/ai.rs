//! AI agent abstraction for the implement step.
//!
//! The [`AiRunner`] trait decouples the pipeline from the actual agent backend
//! (a configured command, `codex exec` by default). Tests use scripted runners
//! that return predetermined results without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::io::process::{ProcessLimits, ProcessOutput, Stop, run_process};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AiRequest {
    /// Worktree the agent edits.
    pub workdir: PathBuf,
    pub prompt: String,
    /// Where to write the agent's stdout/stderr.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Kills the agent when the run is interrupted.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiResult {
    pub success: bool,
    pub timed_out: bool,
    /// Last lines of agent output, for error messages.
    pub summary: String,
}

/// Agent backend. Errors mean the agent could not be run at all; an agent
/// that ran and failed is reported through [`AiResult::success`].
pub trait AiRunner {
    fn run(&self, request: &AiRequest) -> Result<AiResult>;
}

/// Runs a configured command with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandAiRunner {
    command: Vec<String>,
}

impl CommandAiRunner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl AiRunner for CommandAiRunner {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &AiRequest) -> Result<AiResult> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("ai command is empty"))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting agent");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let limits = ProcessLimits {
            timeout: request.timeout,
            output_limit: request.output_limit_bytes,
        };
        let output = run_process(cmd, Some(request.prompt.as_bytes()), limits, &request.cancel)
            .with_context(|| format!("run agent {program}"))?;

        write_agent_log(&request.log_path, &output, request.output_limit_bytes)?;

        let summary = tail_lines(&output.stdout.text(), 5);
        match output.stop {
            Stop::TimedOut => warn!(timeout_secs = request.timeout.as_secs(), "agent timed out"),
            Stop::Canceled => info!("agent stopped by interrupt"),
            Stop::Exited if !output.status.success() => {
                warn!(exit_code = ?output.status.code(), "agent failed");
            }
            Stop::Exited => debug!("agent completed successfully"),
        }
        Ok(AiResult {
            success: output.succeeded(),
            timed_out: output.stop == Stop::TimedOut,
            summary,
        })
    }
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

fn write_agent_log(path: &Path, output: &ProcessOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let buf = output.transcript("agent");
    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        fs::write(path, truncated).with_context(|| format!("write agent log {}", path.display()))?;
        return Ok(());
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}
