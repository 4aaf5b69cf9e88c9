//! Child processes for the agent and validation commands.
//!
//! Both pipes are drained on reader threads while the child runs, and only
//! the first `output_limit` bytes of each stream are kept. The child is killed
//! when its deadline passes or the task's cancellation token fires.

use std::io::{ErrorKind, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancellationToken;

/// How often a waiting run re-checks its deadline and cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    /// Bytes kept per stream; the rest is read and dropped.
    pub output_limit: usize,
}

/// Why the child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Exited,
    TimedOut,
    Canceled,
}

/// One captured stream.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Bytes read past the limit.
    pub dropped: usize,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stop: Stop,
    pub stdout: Captured,
    pub stderr: Captured,
}

impl ProcessOutput {
    /// Exited on its own with status zero.
    pub fn succeeded(&self) -> bool {
        self.stop == Stop::Exited && self.status.success()
    }

    /// Both streams as stored in agent logs and validation artifacts.
    pub fn transcript(&self, label: &str) -> String {
        let mut buf = String::new();
        for (name, stream) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            buf.push_str(&format!("--- {label} {name} ---\n"));
            buf.push_str(&stream.text());
            if stream.dropped > 0 {
                buf.push_str(&format!("\n[{label} {name}: {} bytes dropped]\n", stream.dropped));
            }
        }
        match self.stop {
            Stop::Exited => {}
            Stop::TimedOut => buf.push_str(&format!("\n[{label} killed: timed out]\n")),
            Stop::Canceled => buf.push_str(&format!("\n[{label} killed: interrupted]\n")),
        }
        buf
    }
}

/// Spawn `cmd`, feed it `stdin`, and wait for it within `limits`.
///
/// An `Err` means the child could not be spawned or waited on. Timeouts and
/// cancellation are reported through [`ProcessOutput::stop`].
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs()))]
pub fn run_process(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn child process")?;
    debug!(pid = child.id(), "child process started");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child stderr not captured"))?;
    let stdout_reader = thread::spawn(move || capture(stdout, limits.output_limit));
    let stderr_reader = thread::spawn(move || capture(stderr, limits.output_limit));

    // Fed from a thread so a child that never reads stdin still hits its deadline.
    let feeder = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_vec();
            Some(thread::spawn(move || pipe.write_all(&input)))
        }
        _ => None,
    };

    let deadline = Instant::now() + limits.timeout;
    let (status, stop) = loop {
        if let Some(status) = child.wait_timeout(WAIT_SLICE).context("wait for child")? {
            break (status, Stop::Exited);
        }
        let stop = if cancel.is_cancelled() {
            Stop::Canceled
        } else if Instant::now() >= deadline {
            Stop::TimedOut
        } else {
            continue;
        };
        warn!(?stop, "killing child process");
        if let Err(err) = child.kill() {
            debug!(err = %err, "kill failed; child already exited");
        }
        break (child.wait().context("reap killed child")?, stop);
    };

    if let Some(feeder) = feeder {
        match feeder.join() {
            Ok(Err(err)) if err.kind() != ErrorKind::BrokenPipe => {
                warn!(err = %err, "writing child stdin failed");
            }
            Ok(_) => {}
            Err(_) => return Err(anyhow!("stdin writer panicked")),
        }
    }
    let stdout = finish(stdout_reader).context("read child stdout")?;
    let stderr = finish(stderr_reader).context("read child stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "child output over limit"
        );
    }

    debug!(exit_code = ?status.code(), ?stop, "child process finished");
    Ok(ProcessOutput {
        status,
        stop,
        stdout,
        stderr,
    })
}

fn finish(reader: JoinHandle<Result<Captured>>) -> Result<Captured> {
    reader
        .join()
        .unwrap_or_else(|_| Err(anyhow!("output reader panicked")))
}

fn capture(mut stream: impl Read, limit: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(captured);
        }
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.dropped += n - keep;
    }
}

/// `sh -c <line>`, for validation commands from config.
pub fn sh(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", line]);
    cmd
}
