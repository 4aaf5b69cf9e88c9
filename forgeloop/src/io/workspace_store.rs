//! Workspace persistence.

use std::fs;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::types::Workspace;
use crate::io::store::{StatePaths, StoreError, read_json, validate_key, write_json};

pub trait WorkspaceStore {
    fn get(&self, name: &str) -> Result<Workspace>;
    /// Fails when the name exists or another workspace owns the worktree path.
    fn create(&self, workspace: &Workspace) -> Result<()>;
    fn update(&self, workspace: &Workspace) -> Result<()>;
    fn exists(&self, name: &str) -> Result<bool>;
    fn list(&self) -> Result<Vec<Workspace>>;
}

/// File-backed store under `.forgeloop/workspaces/`.
#[derive(Debug, Clone)]
pub struct FileWorkspaceStore {
    paths: StatePaths,
}

impl FileWorkspaceStore {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }
}

impl WorkspaceStore for FileWorkspaceStore {
    fn get(&self, name: &str) -> Result<Workspace> {
        validate_key("workspace", name)?;
        let path = self.paths.workspace_file(name);
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: "workspace",
                key: name.to_string(),
            }
            .into());
        }
        read_json(&path)
    }

    #[instrument(skip_all, fields(workspace = %workspace.name))]
    fn create(&self, workspace: &Workspace) -> Result<()> {
        validate_key("workspace", &workspace.name)?;
        if self.exists(&workspace.name)? {
            return Err(StoreError::AlreadyExists {
                kind: "workspace",
                key: workspace.name.clone(),
            }
            .into());
        }
        if let Some(owner) = self
            .list()?
            .into_iter()
            .find(|other| other.worktree_path == workspace.worktree_path)
        {
            return Err(StoreError::WorktreeInUse {
                path: workspace.worktree_path.clone(),
                owner: owner.name,
            }
            .into());
        }
        debug!(worktree = %workspace.worktree_path.display(), "creating workspace");
        write_json(&self.paths.workspace_file(&workspace.name), workspace)
    }

    #[instrument(skip_all, fields(workspace = %workspace.name, status = %workspace.status))]
    fn update(&self, workspace: &Workspace) -> Result<()> {
        if !self.exists(&workspace.name)? {
            return Err(StoreError::NotFound {
                kind: "workspace",
                key: workspace.name.clone(),
            }
            .into());
        }
        debug!("updating workspace");
        write_json(&self.paths.workspace_file(&workspace.name), workspace)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        validate_key("workspace", name)?;
        Ok(self.paths.workspace_file(name).is_file())
    }

    fn list(&self) -> Result<Vec<Workspace>> {
        let dir = self.paths.workspaces_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut workspaces = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let file = entry.path().join("workspace.json");
            if !file.is_file() {
                continue;
            }
            match read_json::<Workspace>(&file) {
                Ok(workspace) => workspaces.push(workspace),
                Err(err) => warn!(path = %file.display(), err = %format!("{err:#}"), "skipping unreadable workspace"),
            }
        }
        workspaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workspaces)
    }
}
