//! GitHub CLI (`gh`) adapter plus pure parsers for its output and for git
//! push failures.

use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Wrapper for executing `gh` in a worktree.
#[derive(Debug, Clone)]
pub struct Gh {
    workdir: PathBuf,
}

impl Gh {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Create a pull request for `head` against `base` and return its URL.
    #[instrument(skip_all, fields(head, base))]
    pub fn pr_create(&self, base: &str, head: &str, title: &str, body: &str) -> Result<String> {
        let output = self.run_checked(&[
            "pr", "create", "--base", base, "--head", head, "--title", title, "--body", body,
        ])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_pr_url(&stdout).ok_or_else(|| anyhow!("gh pr create printed no PR URL: {}", stdout.trim()))
    }

    /// Current checks for the PR of the checked-out branch.
    ///
    /// `gh pr checks` exits non-zero while checks are failing or pending, so
    /// the exit status is ignored whenever stdout parses.
    #[instrument(skip_all)]
    pub fn pr_checks(&self) -> Result<Vec<CheckRun>> {
        let output = self.run(&["pr", "checks", "--json", "name,bucket,link"])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        match serde_json::from_str::<Vec<CheckRun>>(stdout.trim()) {
            Ok(checks) => {
                debug!(count = checks.len(), "parsed checks");
                Ok(checks)
            }
            Err(_) if stdout.trim().is_empty() && !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("no checks reported") {
                    return Ok(Vec::new());
                }
                Err(anyhow!("gh pr checks failed: {}", stderr.trim()))
            }
            Err(err) => Err(err).context("parse gh pr checks output"),
        }
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("gh {} failed: {}", args[..2].join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("gh")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn gh {}", args.join(" ")))
    }
}

/// One entry of `gh pr checks --json name,bucket,link`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckRun {
    pub name: String,
    /// One of `pass`, `fail`, `pending`, `skipping`, `cancel`.
    pub bucket: String,
    #[serde(default)]
    pub link: String,
}

/// Aggregate CI state across all checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksSummary {
    Pending,
    Passed,
    Failed { url: Option<String> },
}

/// Any failure wins, then any pending; an empty list is still pending since
/// checks may not have been registered yet.
pub fn summarize_checks(checks: &[CheckRun]) -> ChecksSummary {
    if let Some(failed) = checks
        .iter()
        .find(|check| matches!(check.bucket.as_str(), "fail" | "cancel"))
    {
        let url = (!failed.link.is_empty()).then(|| failed.link.clone());
        return ChecksSummary::Failed { url };
    }
    if checks.is_empty() || checks.iter().any(|check| check.bucket == "pending") {
        return ChecksSummary::Pending;
    }
    ChecksSummary::Passed
}

#[allow(clippy::expect_used)]
static PR_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[^\s/]+/[^\s/]+/[^\s/]+/pull/\d+").expect("constant regex pattern is valid")
});

/// First pull request URL in `text`.
pub fn parse_pr_url(text: &str) -> Option<String> {
    PR_URL_PATTERN
        .find(text)
        .map(|found| found.as_str().to_string())
}

/// Coarse classification of a `git push` failure, stored as
/// `push_error_type` to drive the recovery menu.
pub fn classify_push_error(stderr: &str) -> &'static str {
    let text = stderr.to_ascii_lowercase();
    if text.contains("non-fast-forward")
        || text.contains("fetch first")
        || text.contains("[rejected]")
        || text.contains("updates were rejected")
    {
        "non_fast_forward"
    } else if text.contains("authentication failed")
        || text.contains("permission denied")
        || text.contains("could not read username")
        || text.contains("403")
    {
        "auth"
    } else if text.contains("could not resolve host")
        || text.contains("connection timed out")
        || text.contains("connection refused")
        || text.contains("network is unreachable")
    {
        "network"
    } else {
        "unknown"
    }
}
