//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Scripted executor responses
//! - Orchestrators wired to in-memory or on-disk collaborators

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{Repository, Signature};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

use arbor::config::Config;
use arbor::orchestration::{Orchestrator, SchedulerEvent};
use arbor::store::{JsonStore, MemoryStore, Store};
use arbor::worker::{ExecError, ExecOptions, ExecResponse, Executor};
use arbor::workspace::{GitWorkspaces, WorkspaceHandle, WorkspaceProvider};

/// A test repository with a temporary directory and one commit.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        let repo = Repository::init(&path).expect("Failed to init git");
        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        let mut index = repo.index().expect("Failed to open index");
        index
            .add_path(Path::new("README.md"))
            .expect("Failed to stage README");
        index.write().expect("Failed to write index");
        let tree_id = index.write_tree().expect("Failed to write tree");
        let tree = repo.find_tree(tree_id).expect("Failed to find tree");
        let sig = Signature::now("Test User", "test@test.com").expect("Failed to build signature");
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .expect("Failed to commit");

        Self { temp_dir, path }
    }

    /// Check if a local branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        let repo = Repository::open(&self.path).expect("Failed to open repo");
        let exists = repo.find_branch(name, git2::BranchType::Local).is_ok();
        exists
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// What the scripted executor does for one prompt.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Fail(String),
    Error(ExecError),
    Panic,
    Hang,
    /// Fail the first `failures` calls with `error`, then succeed.
    Flaky { failures: usize, error: ExecError },
}

/// Executor that answers from a per-prompt script and records every call.
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Every call sleeps `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delay,
            calls: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn on(self, prompt: &str, script: Script) -> Self {
        self.scripts.lock().insert(prompt.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, prompt: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == prompt).count()
    }

    /// Highest number of calls that were in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        prompt: &str,
        _options: &ExecOptions,
    ) -> Result<ExecResponse, ExecError> {
        let seen = {
            let mut calls = self.calls.lock();
            let seen = calls.iter().filter(|c| *c == prompt).count();
            calls.push(prompt.to_string());
            seen
        };
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.current);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let script = self
            .scripts
            .lock()
            .get(prompt)
            .cloned()
            .unwrap_or(Script::Succeed);
        match script {
            Script::Succeed => Ok(ExecResponse::ok(format!("done: {}", prompt))),
            Script::Fail(error) => Ok(ExecResponse::failed(error)),
            Script::Error(e) => Err(e),
            Script::Panic => panic!("scripted panic for {}", prompt),
            Script::Hang => std::future::pending().await,
            Script::Flaky { failures, error } if seen < failures => Err(error),
            Script::Flaky { .. } => Ok(ExecResponse::ok(format!("done: {}", prompt))),
        }
    }

    async fn probe(&self, _options: &ExecOptions) -> bool {
        true
    }
}

/// Workspaces that are plain directories with a `.git` marker.
pub struct ScratchWorkspaces {
    root: TempDir,
    entries: Mutex<BTreeMap<String, (WorkspaceHandle, DateTime<Utc>)>>,
    dirty: Mutex<HashSet<String>>,
}

impl ScratchWorkspaces {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("Failed to create temp directory"),
            entries: Mutex::new(BTreeMap::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    pub fn mark_dirty(&self, name: &str) {
        self.dirty.lock().insert(name.to_string());
    }

    /// Pretend `name` was last touched `age` ago.
    pub fn age(&self, name: &str, age: chrono::Duration) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.1 = Utc::now() - age;
        }
    }
}

impl Default for ScratchWorkspaces {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkspaceProvider for ScratchWorkspaces {
    async fn create(
        &self,
        name: Option<&str>,
        branch: Option<&str>,
        _base_branch: Option<&str>,
    ) -> arbor::Result<WorkspaceHandle> {
        let n = self.entries.lock().len();
        let name = name
            .map(String::from)
            .unwrap_or_else(|| format!("scratch-{}-{}", n, uuid::Uuid::new_v4().simple()));
        let path = self.root.path().join(&name);
        if path.exists() {
            return Err(arbor::Error::Validation(format!("exists: {}", name)));
        }
        std::fs::create_dir_all(path.join(".git"))?;
        let handle = WorkspaceHandle {
            name: name.clone(),
            path,
            branch: branch.map(String::from).unwrap_or_else(|| format!("branch-{}", name)),
        };
        self.entries.lock().insert(name, (handle.clone(), Utc::now()));
        Ok(handle)
    }

    async fn get(&self, name: &str) -> arbor::Result<Option<WorkspaceHandle>> {
        Ok(self.entries.lock().get_mut(name).map(|entry| {
            entry.1 = Utc::now();
            entry.0.clone()
        }))
    }

    async fn remove(&self, handle: &WorkspaceHandle, force: bool) -> arbor::Result<bool> {
        if !force && self.dirty.lock().contains(&handle.name) {
            return Ok(false);
        }
        if handle.path.exists() {
            std::fs::remove_dir_all(&handle.path)?;
        }
        self.entries.lock().remove(&handle.name);
        Ok(true)
    }

    async fn exists(&self, handle: &WorkspaceHandle) -> bool {
        handle.path.exists()
    }

    async fn is_valid_repo(&self, handle: &WorkspaceHandle) -> bool {
        handle.path.join(".git").exists()
    }

    async fn has_uncommitted_changes(&self, handle: &WorkspaceHandle) -> arbor::Result<bool> {
        Ok(self.dirty.lock().contains(&handle.name))
    }

    async fn list(&self) -> arbor::Result<Vec<WorkspaceHandle>> {
        Ok(self.entries.lock().values().map(|e| e.0.clone()).collect())
    }

    async fn list_stale(&self, max_age: Duration) -> arbor::Result<Vec<WorkspaceHandle>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| arbor::Error::Validation(e.to_string()))?;
        let cutoff = Utc::now() - max_age;
        Ok(self
            .entries
            .lock()
            .values()
            .filter(|e| e.1 < cutoff)
            .map(|e| e.0.clone())
            .collect())
    }

    async fn ping(&self) -> arbor::Result<()> {
        Ok(())
    }
}

/// Configuration with no retries so failures surface immediately.
pub fn test_config(max_instances: usize) -> Config {
    Config {
        max_concurrent_instances: max_instances,
        instance_timeout_secs: 30,
        max_retries: 0,
        ..Default::default()
    }
}

/// Orchestrator over in-memory collaborators, with its event stream.
pub struct OrchestratorHarness {
    pub orchestrator: Arc<Orchestrator>,
    pub executor: Arc<ScriptedExecutor>,
    pub workspaces: Arc<ScratchWorkspaces>,
    pub store: Arc<MemoryStore>,
    pub event_rx: mpsc::Receiver<SchedulerEvent>,
}

impl OrchestratorHarness {
    pub fn new(executor: ScriptedExecutor, config: Config) -> Self {
        let executor = Arc::new(executor);
        let workspaces = Arc::new(ScratchWorkspaces::new());
        let store = Arc::new(MemoryStore::new());
        let (event_tx, event_rx) = mpsc::channel(1024);
        let orchestrator = Orchestrator::new(
            config,
            store.clone(),
            workspaces.clone(),
            executor.clone(),
        )
        .with_events(event_tx);

        Self {
            orchestrator: Arc::new(orchestrator),
            executor,
            workspaces,
            store,
            event_rx,
        }
    }

    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Orchestrator over a real git repository and a JSON store on disk.
pub struct GitHarness {
    pub repo: TestRepo,
    pub state_dir: TempDir,
    pub trees_dir: TempDir,
    pub executor: Arc<ScriptedExecutor>,
}

impl GitHarness {
    pub fn new(executor: ScriptedExecutor) -> Self {
        Self {
            repo: TestRepo::new(),
            state_dir: TempDir::new().expect("Failed to create state dir"),
            trees_dir: TempDir::new().expect("Failed to create worktrees dir"),
            executor: Arc::new(executor),
        }
    }

    pub fn store(&self) -> Arc<JsonStore> {
        Arc::new(JsonStore::new(self.state_dir.path()))
    }

    pub fn workspaces(&self, store: Arc<dyn Store>) -> Arc<GitWorkspaces> {
        Arc::new(
            GitWorkspaces::new(&self.repo.path, self.trees_dir.path(), "main", store)
                .expect("Failed to open test repo"),
        )
    }

    /// A fresh orchestrator over the same repo and state directory, as a
    /// restarted process would build it.
    pub fn orchestrator(&self, config: Config) -> Orchestrator {
        let store: Arc<dyn Store> = self.store();
        let workspaces = self.workspaces(store.clone());
        Orchestrator::new(config, store, workspaces, self.executor.clone())
    }
}
