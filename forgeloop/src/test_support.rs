//! Test-only helpers: record builders, scripted fakes for every seam the
//! engine talks through, and a throwaway git repository.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tempfile::TempDir;

use crate::cancel::CancellationToken;
use crate::core::types::{
    Step, StepKind, StepStatus, Task, TaskStatus, Workspace, WorkspaceStatus,
};
use crate::engine::Engine;
use crate::io::ai::{AiRequest, AiResult, AiRunner};
use crate::io::config::Config;
use crate::io::git::BranchSync;
use crate::io::notify::{LifecycleEvent, Notification, Notifier};
use crate::io::store::StatePaths;
use crate::io::task_store::{FileTaskStore, TaskLogEntry, TaskStore};
use crate::io::terminal::Terminal;
use crate::io::workspace_store::{FileWorkspaceStore, WorkspaceStore};
use crate::output::OutputFormat;
use crate::pipeline::{StepContext, StepExecutor, StepOutcome};

/// Builds a [`Task`] with deterministic defaults.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(workspace: &str) -> Self {
        Self {
            task: Task::new("task-1", workspace, "feature", "Add a greeting", Vec::new()),
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn template(mut self, template: &str) -> Self {
        self.task.template_id = template.to_string();
        self
    }

    pub fn steps(mut self, names: &[&str]) -> Self {
        self.task.steps = names.iter().map(|name| Step::new(*name)).collect();
        self
    }

    pub fn current_step(mut self, index: i64) -> Self {
        self.task.current_step = index;
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn step_status(mut self, index: usize, status: StepStatus) -> Self {
        self.task.steps[index].status = status;
        self
    }

    /// Marks the step failed with `error`.
    pub fn step_error(mut self, index: usize, error: &str) -> Self {
        let step = &mut self.task.steps[index];
        step.status = StepStatus::Failed;
        step.error = Some(error.to_string());
        self
    }

    pub fn metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.task.metadata.insert(key, value);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// [`TaskStore`] wrapper that counts writes.
pub struct CountingTaskStore {
    pub inner: FileTaskStore,
    writes: Cell<usize>,
    reject_updates: Cell<bool>,
}

impl CountingTaskStore {
    pub fn new(inner: FileTaskStore) -> Self {
        Self {
            inner,
            writes: Cell::new(0),
            reject_updates: Cell::new(false),
        }
    }

    /// Make every later `update` fail, as a full disk would.
    pub fn reject_updates(&self) {
        self.reject_updates.set(true);
    }

    /// Creates, updates, artifacts and log appends seen so far.
    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    fn count(&self) {
        self.writes.set(self.writes.get() + 1);
    }
}

impl TaskStore for CountingTaskStore {
    fn get(&self, workspace: &str, task_id: &str) -> Result<Task> {
        self.inner.get(workspace, task_id)
    }

    fn create(&self, task: &Task) -> Result<()> {
        self.count();
        self.inner.create(task)
    }

    fn update(&self, task: &Task) -> Result<()> {
        if self.reject_updates.get() {
            bail!("task store rejected update of {}", task.id);
        }
        self.count();
        self.inner.update(task)
    }

    fn list(&self, workspace: &str) -> Result<Vec<Task>> {
        self.inner.list(workspace)
    }

    fn save_artifact(
        &self,
        workspace: &str,
        task_id: &str,
        name: &str,
        contents: &[u8],
    ) -> Result<PathBuf> {
        self.count();
        self.inner.save_artifact(workspace, task_id, name, contents)
    }

    fn load_artifact(&self, workspace: &str, task_id: &str, name: &str) -> Result<Vec<u8>> {
        self.inner.load_artifact(workspace, task_id, name)
    }

    fn append_log(&self, workspace: &str, task_id: &str, entry: &TaskLogEntry) -> Result<()> {
        self.count();
        self.inner.append_log(workspace, task_id, entry)
    }
}

/// [`WorkspaceStore`] wrapper that counts writes.
pub struct CountingWorkspaceStore {
    pub inner: FileWorkspaceStore,
    writes: Cell<usize>,
}

impl CountingWorkspaceStore {
    pub fn new(inner: FileWorkspaceStore) -> Self {
        Self {
            inner,
            writes: Cell::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.get()
    }
}

impl WorkspaceStore for CountingWorkspaceStore {
    fn get(&self, name: &str) -> Result<Workspace> {
        self.inner.get(name)
    }

    fn create(&self, workspace: &Workspace) -> Result<()> {
        self.writes.set(self.writes.get() + 1);
        self.inner.create(workspace)
    }

    fn update(&self, workspace: &Workspace) -> Result<()> {
        self.writes.set(self.writes.get() + 1);
        self.inner.update(workspace)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name)
    }

    fn list(&self) -> Result<Vec<Workspace>> {
        self.inner.list()
    }
}

/// Step executor returning scripted outcomes by step name; unscripted steps
/// succeed.
#[derive(Default)]
pub struct ScriptedStepExecutor {
    outcomes: RefCell<HashMap<String, VecDeque<StepOutcome>>>,
    cancel_on: RefCell<Option<(String, CancellationToken)>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedStepExecutor {
    /// Queue `outcome` for the next run of `step`.
    pub fn script(&self, step: &str, outcome: StepOutcome) {
        self.outcomes
            .borrow_mut()
            .entry(step.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Cancel `token` the next time `step` runs and report the step as
    /// canceled.
    pub fn cancel_during(&self, step: &str, token: CancellationToken) {
        *self.cancel_on.borrow_mut() = Some((step.to_string(), token));
    }

    /// Names of executed steps, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl StepExecutor for ScriptedStepExecutor {
    fn execute(&self, _kind: StepKind, ctx: &mut StepContext<'_>) -> StepOutcome {
        let name = ctx
            .task
            .current()
            .map(|step| step.name.clone())
            .unwrap_or_default();
        self.calls.borrow_mut().push(name.clone());
        let trigger = {
            let mut slot = self.cancel_on.borrow_mut();
            if matches!(slot.as_ref(), Some((step, _)) if *step == name) {
                slot.take()
            } else {
                None
            }
        };
        if let Some((_, token)) = trigger {
            token.cancel();
            return StepOutcome::Canceled;
        }
        self.outcomes
            .borrow_mut()
            .get_mut(&name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(StepOutcome::Success)
    }
}

/// Terminal fed from a script of input lines; captures everything written.
pub struct ScriptedTerminal {
    interactive: bool,
    input: RefCell<VecDeque<String>>,
    output: RefCell<Vec<String>>,
    interrupt_read: RefCell<Option<(CancellationToken, String)>>,
}

impl ScriptedTerminal {
    pub fn new(input: &[&str]) -> Self {
        Self {
            interactive: true,
            input: RefCell::new(input.iter().map(|line| line.to_string()).collect()),
            output: RefCell::new(Vec::new()),
            interrupt_read: RefCell::new(None),
        }
    }

    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            ..Self::new(&[])
        }
    }

    pub fn push_input(&self, lines: &[&str]) {
        self.input
            .borrow_mut()
            .extend(lines.iter().map(|line| line.to_string()));
    }

    pub fn output(&self) -> String {
        self.output.borrow().join("\n")
    }

    /// The next read cancels `token` (a Ctrl-C while blocked) and then
    /// returns `line` as if the operator typed it afterwards.
    pub fn cancel_on_read(&self, token: CancellationToken, line: &str) {
        *self.interrupt_read.borrow_mut() = Some((token, line.to_string()));
    }
}

impl Terminal for ScriptedTerminal {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn write_line(&self, line: &str) -> Result<()> {
        self.output.borrow_mut().push(line.to_string());
        Ok(())
    }

    fn read_line(&self) -> Result<Option<String>> {
        if let Some((token, line)) = self.interrupt_read.borrow_mut().take() {
            token.cancel();
            return Ok(Some(line));
        }
        Ok(self.input.borrow_mut().pop_front())
    }

    fn open_url(&self, _url: &str) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: RefCell<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.sent.borrow().iter().map(|n| n.event).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        self.sent.borrow_mut().push(notification.clone());
    }
}

/// Branch sync that succeeds unless told to fail.
#[derive(Default)]
pub struct FakeBranchSync {
    failure: RefCell<Option<String>>,
    calls: Cell<usize>,
}

impl FakeBranchSync {
    pub fn fail_with(&self, message: &str) {
        *self.failure.borrow_mut() = Some(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl BranchSync for FakeBranchSync {
    fn rebase_onto_base(&self, _workspace: &Workspace, _remote: &str) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        match self.failure.borrow().as_ref() {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

/// AI runner returning a fixed result and recording prompts.
pub struct ScriptedAiRunner {
    result: AiResult,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAiRunner {
    pub fn succeeding() -> Self {
        Self {
            result: AiResult {
                success: true,
                timed_out: false,
                summary: "done".to_string(),
            },
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn failing(summary: &str) -> Self {
        Self {
            result: AiResult {
                success: false,
                timed_out: false,
                summary: summary.to_string(),
            },
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl AiRunner for ScriptedAiRunner {
    fn run(&self, request: &AiRequest) -> Result<AiResult> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        Ok(self.result.clone())
    }
}

enum EnvRoot {
    Temp(TempDir),
    Repo(TestRepo),
}

/// File-backed stores in a temp dir wired to scripted fakes.
pub struct TestEnv {
    root: EnvRoot,
    pub config: Config,
    pub task_store: CountingTaskStore,
    pub workspace_store: CountingWorkspaceStore,
    pub steps: ScriptedStepExecutor,
    pub terminal: ScriptedTerminal,
    pub notifier: RecordingNotifier,
    pub branch_sync: FakeBranchSync,
    pub cancel: CancellationToken,
    pub output: OutputFormat,
}

impl TestEnv {
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::at(EnvRoot::Temp(tempfile::tempdir().expect("tempdir")))
    }

    /// Like [`TestEnv::new`] but rooted in a real git repository.
    #[allow(clippy::expect_used)]
    pub fn with_repo() -> Self {
        Self::at(EnvRoot::Repo(TestRepo::new().expect("repo")))
    }

    fn at(root: EnvRoot) -> Self {
        let paths = StatePaths::new(match &root {
            EnvRoot::Temp(temp) => temp.path(),
            EnvRoot::Repo(repo) => repo.root(),
        });
        Self {
            config: Config::default(),
            task_store: CountingTaskStore::new(FileTaskStore::new(paths.clone())),
            workspace_store: CountingWorkspaceStore::new(FileWorkspaceStore::new(paths)),
            steps: ScriptedStepExecutor::default(),
            terminal: ScriptedTerminal::new(&[]),
            notifier: RecordingNotifier::default(),
            branch_sync: FakeBranchSync::default(),
            cancel: CancellationToken::new(),
            output: OutputFormat::Text,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        match &self.root {
            EnvRoot::Temp(temp) => temp.path(),
            EnvRoot::Repo(repo) => repo.root(),
        }
    }

    pub fn engine(&self) -> Engine<'_> {
        Engine {
            repo_root: self.root(),
            config: &self.config,
            tasks: &self.task_store,
            workspaces: &self.workspace_store,
            steps: &self.steps,
            terminal: &self.terminal,
            notifier: &self.notifier,
            branch_sync: &self.branch_sync,
            cancel: self.cancel.clone(),
            output: self.output,
        }
    }

    /// Persist the built task and a workspace pointing at it without
    /// counting the writes.
    #[allow(clippy::expect_used)]
    pub fn seed(&self, builder: TaskBuilder) -> (Task, Workspace) {
        let task = builder.build();
        let mut workspace = Workspace::new(
            task.workspace_id.clone(),
            format!("{}/{}", task.template_id, task.workspace_id),
            self.config.base_branch.clone(),
            self.root().join("worktrees").join(&task.workspace_id),
        );
        workspace.current_task_id = Some(task.id.clone());
        if task.status.is_resumable() {
            workspace.status = WorkspaceStatus::Paused;
        }
        self.workspace_store
            .inner
            .create(&workspace)
            .expect("seed workspace");
        self.task_store.inner.create(&task).expect("seed task");
        (task, workspace)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A git repository in a temp dir with one commit on `main`. `.forgeloop/`
/// is ignored so state writes never dirty the tree.
///
/// The checkout lives one level below the temp dir so sibling worktrees
/// (`<repo>-<workspace>`) are removed with it.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path().join("app");
        std::fs::create_dir(&root).context("create repo dir")?;
        let repo = Self { _temp: temp, root };
        repo.git(&["init", "-q", "-b", "main"])?;
        repo.git(&["config", "user.name", "Forgeloop Test"])?;
        repo.git(&["config", "user.email", "test@forgeloop.invalid"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        std::fs::write(repo.root.join(".gitignore"), ".forgeloop/\n")
            .context("write .gitignore")?;
        std::fs::write(repo.root.join("README.md"), "# app\n").context("write README")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial commit"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn commit_count(&self) -> Result<usize> {
        let out = self.git(&["rev-list", "--count", "HEAD"])?;
        out.trim().parse().context("parse commit count")
    }

    /// Run git in the repo and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("run git {args:?}"))?;
        if !out.status.success() {
            bail!(
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}
