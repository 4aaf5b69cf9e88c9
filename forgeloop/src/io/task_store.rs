//! Task persistence.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::state_machine::{self, TransitionError};
use crate::core::types::{Task, TaskStatus};
use crate::io::store::{StatePaths, StoreError, read_json, validate_key, write_atomic, write_json};

/// One line of a task's `log.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub at: DateTime<Utc>,
    pub event: String,
    pub message: String,
}

impl TaskLogEntry {
    pub fn now(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            event: event.into(),
            message: message.into(),
        }
    }
}

/// Abstraction over task persistence so orchestration can be tested against
/// counting or failing stores.
pub trait TaskStore {
    fn get(&self, workspace: &str, task_id: &str) -> Result<Task>;
    fn create(&self, task: &Task) -> Result<()>;
    fn update(&self, task: &Task) -> Result<()>;
    /// All tasks of a workspace, oldest first.
    fn list(&self, workspace: &str) -> Result<Vec<Task>>;
    fn save_artifact(
        &self,
        workspace: &str,
        task_id: &str,
        name: &str,
        contents: &[u8],
    ) -> Result<PathBuf>;
    fn load_artifact(&self, workspace: &str, task_id: &str, name: &str) -> Result<Vec<u8>>;
    fn append_log(&self, workspace: &str, task_id: &str, entry: &TaskLogEntry) -> Result<()>;

    /// Most recently created task, if any.
    fn latest(&self, workspace: &str) -> Result<Option<Task>> {
        Ok(self.list(workspace)?.pop())
    }
}

/// File-backed store under `.forgeloop/workspaces/<ws>/tasks/`.
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    paths: StatePaths,
}

impl FileTaskStore {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    fn task_path(&self, workspace: &str, task_id: &str) -> Result<PathBuf> {
        validate_key("workspace", workspace)?;
        validate_key("task", task_id)?;
        Ok(self.paths.task_file(workspace, task_id))
    }
}

impl TaskStore for FileTaskStore {
    fn get(&self, workspace: &str, task_id: &str) -> Result<Task> {
        let path = self.task_path(workspace, task_id)?;
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: "task",
                key: task_id.to_string(),
            }
            .into());
        }
        read_json(&path)
    }

    #[instrument(skip_all, fields(workspace = %task.workspace_id, task_id = %task.id))]
    fn create(&self, task: &Task) -> Result<()> {
        let path = self.task_path(&task.workspace_id, &task.id)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists {
                kind: "task",
                key: task.id.clone(),
            }
            .into());
        }
        debug!("creating task");
        write_json(&path, task)
    }

    #[instrument(skip_all, fields(workspace = %task.workspace_id, task_id = %task.id, status = %task.status))]
    fn update(&self, task: &Task) -> Result<()> {
        let path = self.task_path(&task.workspace_id, &task.id)?;
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: "task",
                key: task.id.clone(),
            }
            .into());
        }
        debug!(current_step = task.current_step, "updating task");
        write_json(&path, task)
    }

    fn list(&self, workspace: &str) -> Result<Vec<Task>> {
        validate_key("workspace", workspace)?;
        let dir = self.paths.tasks_dir(workspace);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let file = entry.path().join("task.json");
            if !file.is_file() {
                continue;
            }
            match read_json::<Task>(&file) {
                Ok(task) => tasks.push(task),
                Err(err) => warn!(path = %file.display(), err = %format!("{err:#}"), "skipping unreadable task"),
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn save_artifact(
        &self,
        workspace: &str,
        task_id: &str,
        name: &str,
        contents: &[u8],
    ) -> Result<PathBuf> {
        validate_key("workspace", workspace)?;
        validate_key("task", task_id)?;
        validate_key("artifact", name)?;
        let path = self.paths.artifacts_dir(workspace, task_id).join(name);
        write_atomic(&path, contents)?;
        debug!(path = %path.display(), bytes = contents.len(), "saved artifact");
        Ok(path)
    }

    fn load_artifact(&self, workspace: &str, task_id: &str, name: &str) -> Result<Vec<u8>> {
        validate_key("workspace", workspace)?;
        validate_key("task", task_id)?;
        validate_key("artifact", name)?;
        let path = self.paths.artifacts_dir(workspace, task_id).join(name);
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: "artifact",
                key: name.to_string(),
            }
            .into());
        }
        fs::read(&path).with_context(|| format!("read artifact {}", path.display()))
    }

    fn append_log(&self, workspace: &str, task_id: &str, entry: &TaskLogEntry) -> Result<()> {
        validate_key("workspace", workspace)?;
        validate_key("task", task_id)?;
        let path = self.paths.task_log(workspace, task_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open task log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append task log {}", path.display()))
    }
}

/// Apply a table-checked transition and persist it. If persisting fails the
/// in-memory status is restored so callers never observe an unsaved change.
pub fn transition_and_save(
    store: &dyn TaskStore,
    task: &mut Task,
    to: TaskStatus,
) -> Result<()> {
    let previous = (task.status, task.updated_at);
    state_machine::transition(task, to)?;
    if let Err(err) = store.update(task) {
        task.status = previous.0;
        task.updated_at = previous.1;
        return Err(err).with_context(|| format!("persist status '{to}' for task {}", task.id));
    }
    Ok(())
}

/// True when `err` is a state machine rejection.
pub fn is_transition_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TransitionError>().is_some()
}
