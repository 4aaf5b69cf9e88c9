//! Git adapter: repository discovery, worktrees, and branch sync.
//!
//! Every workspace lives in its own linked worktree next to the main
//! repository, so we keep a small, explicit wrapper around `git` subprocess
//! calls rather than a library binding.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Workspace;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("{} is not inside a git repository", path.display())]
    NotAGitRepository { path: PathBuf },
    #[error("failed to create worktree {} for branch '{branch}': {reason}", path.display())]
    WorktreeCreationFailed {
        path: PathBuf,
        branch: String,
        reason: String,
    },
    #[error("rebase onto {upstream} failed (rebase aborted): {reason}")]
    RebaseFailed { upstream: String, reason: String },
}

/// `git` invoked in one directory (the main checkout or a worktree).
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn has_local_branch(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let out = self.exec(&["show-ref", "--verify", "--quiet", &reference])?;
        Ok(out.status.success())
    }

    /// Stage every change in the worktree and commit it. Returns false when
    /// there was nothing to commit.
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.stdout(&["add", "--all"])?;
        if self.stdout(&["diff", "--cached", "--name-only"])?.is_empty() {
            debug!("worktree clean, nothing to commit");
            return Ok(false);
        }
        self.stdout(&["commit", "--quiet", "-m", message])?;
        debug!("changes committed");
        Ok(true)
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.stdout(&["push", "--set-upstream", remote, branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote))]
    pub fn fetch(&self, remote: &str) -> Result<()> {
        self.stdout(&["fetch", remote])?;
        Ok(())
    }

    pub fn rebase(&self, upstream: &str) -> Result<()> {
        self.stdout(&["rebase", upstream])?;
        Ok(())
    }

    pub fn rebase_abort(&self) -> Result<()> {
        self.stdout(&["rebase", "--abort"])?;
        Ok(())
    }

    /// URL of `remote`, or `None` when it is not configured.
    pub fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        let out = self.exec(&["remote", "get-url", remote])?;
        if !out.status.success() {
            return Ok(None);
        }
        let url = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok((!url.is_empty()).then_some(url))
    }

    /// Trimmed stdout of a git command that must exit zero.
    fn stdout(&self, args: &[&str]) -> Result<String> {
        let out = self.exec(args)?;
        if !out.status.success() {
            let code = out
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            return Err(anyhow!(
                "git {} exited with {code}: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn exec(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .with_context(|| format!("run git {} in {}", args.join(" "), self.dir.display()))
    }
}

/// Top-level directory of the main repository enclosing `cwd`.
///
/// From inside a linked worktree this still resolves to the main checkout,
/// since state is shared across all worktrees of a repository.
#[instrument(skip_all, fields(cwd = %cwd.display()))]
pub fn detect_main_repo_path(cwd: &Path) -> Result<PathBuf, GitError> {
    let not_a_repo = || GitError::NotAGitRepository {
        path: cwd.to_path_buf(),
    };
    let git = Git::new(cwd);
    let common_dir = git
        .stdout(&["rev-parse", "--path-format=absolute", "--git-common-dir"])
        .map_err(|err| {
            debug!(err = %format!("{err:#}"), "rev-parse failed");
            not_a_repo()
        })?;
    let common_dir = PathBuf::from(common_dir);
    if common_dir.file_name().is_some_and(|name| name == ".git")
        && let Some(parent) = common_dir.parent()
    {
        debug!(repo = %parent.display(), "main repository detected");
        return Ok(parent.to_path_buf());
    }
    // Bare or unusual layouts: fall back to the current top level.
    let toplevel = git
        .stdout(&["rev-parse", "--show-toplevel"])
        .map_err(|_| not_a_repo())?;
    Ok(PathBuf::from(toplevel))
}

/// True when `branch` exists locally. Any git failure counts as "no".
pub fn check_branch_exists(repo: &Path, branch: &str) -> bool {
    match Git::new(repo).has_local_branch(branch) {
        Ok(exists) => exists,
        Err(err) => {
            debug!(branch, err = %format!("{err:#}"), "branch check failed");
            false
        }
    }
}

/// `git worktree add` for `branch`, creating the branch from `base` when it
/// does not exist yet. Not idempotent: an existing worktree path fails.
#[instrument(skip_all, fields(branch, worktree = %worktree_path.display()))]
pub fn create_worktree_for_branch(
    repo: &Path,
    worktree_path: &Path,
    branch: &str,
    base: &str,
) -> Result<(), GitError> {
    let failed = |reason: String| GitError::WorktreeCreationFailed {
        path: worktree_path.to_path_buf(),
        branch: branch.to_string(),
        reason,
    };
    let path = worktree_path.to_string_lossy();
    let git = Git::new(repo);
    let result = if check_branch_exists(repo, branch) {
        git.stdout(&["worktree", "add", path.as_ref(), branch])
    } else {
        info!(base, "creating branch for worktree");
        git.stdout(&["worktree", "add", "-b", branch, path.as_ref(), base])
    };
    result.map_err(|err| failed(format!("{err:#}")))?;
    info!("worktree created");
    Ok(())
}

/// Worktree location for a workspace: a sibling of the repository named
/// `<repo>-<workspace>`.
pub fn calculate_worktree_path(repo: &Path, workspace: &str) -> PathBuf {
    let mut path = OsString::from(repo.as_os_str());
    path.push("-");
    path.push(workspace);
    PathBuf::from(path)
}

/// Brings a workspace branch up to date with its base branch.
pub trait BranchSync {
    fn rebase_onto_base(&self, workspace: &Workspace, remote: &str) -> Result<()>;
}

/// [`BranchSync`] backed by `git fetch` + `git rebase <remote>/<base>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitBranchSync;

impl BranchSync for GitBranchSync {
    #[instrument(skip_all, fields(workspace = %workspace.name, remote))]
    fn rebase_onto_base(&self, workspace: &Workspace, remote: &str) -> Result<()> {
        let git = Git::new(&workspace.worktree_path);
        git.fetch(remote)?;
        let upstream = format!("{remote}/{}", workspace.base_branch);
        if let Err(err) = git.rebase(&upstream) {
            warn!(upstream = %upstream, "rebase failed, aborting");
            if let Err(abort_err) = git.rebase_abort() {
                warn!(err = %format!("{abort_err:#}"), "rebase --abort failed");
            }
            return Err(GitError::RebaseFailed {
                upstream,
                reason: format!("{err:#}"),
            }
            .into());
        }
        info!(upstream = %upstream, "rebased onto base");
        Ok(())
    }
}
