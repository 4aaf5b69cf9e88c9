//! On-disk layout and shared persistence helpers for `.forgeloop/`.
//!
//! Layout (rooted at the main repository, shared by all worktrees):
//!
//! ```text
//! .forgeloop/
//!   config.toml
//!   logs/
//!   workspaces/<name>/workspace.json
//!   workspaces/<name>/tasks/<task-id>/task.json
//!   workspaces/<name>/tasks/<task-id>/artifacts/<artifact>
//!   workspaces/<name>/tasks/<task-id>/log.jsonl
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Directory name created under the main repository root.
pub const STATE_DIR: &str = ".forgeloop";

/// Matchable store failures. Other I/O failures travel as plain `anyhow` errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },
    #[error("worktree {path} is already owned by workspace '{owner}'")]
    WorktreeInUse { path: PathBuf, owner: String },
    #[error("invalid {kind} '{key}': {reason}")]
    InvalidKey {
        kind: &'static str,
        key: String,
        reason: &'static str,
    },
}

/// Validate that a workspace name, task id, or artifact name is safe to use
/// as a single path component and in branch names.
pub fn validate_key(kind: &'static str, key: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidKey {
        kind,
        key: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if key.contains('/') {
        return Err(invalid("must not contain '/'"));
    }
    if key == "." || key == ".." {
        return Err(invalid("must not be '.' or '..'"));
    }
    if key
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(invalid("must be [A-Za-z0-9._-] only"));
    }
    Ok(())
}

/// Canonical paths under `.forgeloop/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            root: repo_root.join(STATE_DIR),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    pub fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.workspaces_dir().join(workspace)
    }

    pub fn workspace_file(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join("workspace.json")
    }

    pub fn tasks_dir(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join("tasks")
    }

    pub fn task_dir(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.tasks_dir(workspace).join(task_id)
    }

    pub fn task_file(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.task_dir(workspace, task_id).join("task.json")
    }

    pub fn artifacts_dir(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.task_dir(workspace, task_id).join("artifacts")
    }

    pub fn task_log(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.task_dir(workspace, task_id).join("log.jsonl")
    }
}

/// Load a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!(path = %path.display(), "reading json");
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write a pretty-printed JSON document (temp file + rename).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    debug!(path = %path.display(), "writing json");
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("state path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
