//! Orchestration facade: worker pool sizing, batch runs, cleanup, health
//! and shutdown on top of the session manager.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::health::{ComponentHealth, HealthReport};
use super::pool::WorkerPool;
use super::scheduler::SchedulerEvent;
use super::sessions::SessionManager;
use crate::config::Config;
use crate::core::{Context, DependencyGraph, Metadata, NewTask, SessionId, StatusSnapshot, TaskId};
use crate::error::{Error, Result};
use crate::store::{JsonStore, Store, StoreExt, WorkerRecord};
use crate::worker::{ClaudeExecutor, Executor, Worker, WorkerConfig, WorkerDeps, WorkerId, WorkerInfo};
use crate::workspace::{GitWorkspaces, WorkspaceProvider};

/// One task of a batch. Dependencies name other specs of the same batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub context: Context,
}

impl TaskSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.dependencies
            .extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub name: Option<String>,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    /// Falls back to `Config::worker_config`.
    pub config: Option<WorkerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// The scheduler ran to completion. Individual tasks may still have failed.
    pub success: bool,
    pub session_id: SessionId,
    pub status: Option<StatusSnapshot>,
    pub workers_used: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub workspaces_removed: usize,
    pub workers_removed: usize,
    pub sessions_archived: usize,
}

pub struct Orchestrator {
    config: Config,
    store: Arc<dyn Store>,
    workspaces: Arc<dyn WorkspaceProvider>,
    executor: Arc<dyn Executor>,
    pool: WorkerPool,
    sessions: SessionManager,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        workspaces: Arc<dyn WorkspaceProvider>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let sessions = SessionManager::new(store.clone()).with_cancel(cancel.clone());
        Self {
            pool: WorkerPool::new(config.max_concurrent_instances),
            config,
            store,
            workspaces,
            executor,
            sessions,
            cancel,
        }
    }

    /// Wire up the production collaborators: JSON files under the state
    /// directory, git worktrees of `repo_path` and the `claude` CLI.
    pub fn from_config(config: Config, repo_path: &Path) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(config.state_path()?));
        let workspaces = Arc::new(GitWorkspaces::from_config(repo_path, &config, store.clone())?);
        let executor = Arc::new(ClaudeExecutor::new(config.effective_command()));
        Ok(Self::new(config, store, workspaces, executor))
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.sessions = self.sessions.with_events(event_tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn deps(&self) -> WorkerDeps {
        WorkerDeps {
            executor: self.executor.clone(),
            workspaces: self.workspaces.clone(),
            store: self.store.clone(),
        }
    }

    /// Create a workspace and bind a new worker to it.
    ///
    /// Fails with `PoolFull` at capacity. The pool stays locked from the
    /// capacity check until the worker is registered.
    pub async fn create_worker(&self, options: WorkerOptions) -> Result<Arc<Worker>> {
        let mut pool = self.pool.lock().await;
        if !pool.has_capacity() {
            return Err(Error::PoolFull {
                max: self.pool.max_workers(),
            });
        }

        let handle = self
            .workspaces
            .create(
                options.name.as_deref(),
                options.branch.as_deref(),
                options.base_branch.as_deref(),
            )
            .await?;
        let config = options
            .config
            .unwrap_or_else(|| self.config.worker_config());
        let worker = Arc::new(Worker::new(handle, config, self.deps()));
        worker.persist().await;
        pool.insert(worker.clone())?;

        info!(
            worker_id = %worker.id(),
            workspace = %worker.workspace().name,
            workers = pool.len(),
            "Created worker"
        );
        Ok(worker)
    }

    /// Rebuild a worker from its persisted record and its workspace.
    async fn rehydrate(&self, id: &WorkerId) -> Result<Option<Arc<Worker>>> {
        let Some(record) = self.store.load::<WorkerRecord>(&id.to_string()).await? else {
            return Ok(None);
        };
        let Some(handle) = self.workspaces.get(&record.workspace_name).await? else {
            warn!(worker_id = %id, workspace = %record.workspace_name, "Worker workspace is gone");
            return Ok(None);
        };
        debug!(worker_id = %id, "Rehydrated worker from store");
        Ok(Some(Arc::new(Worker::restore(record, handle, self.deps()))))
    }

    /// Live worker, or one rebuilt from the store. A rebuilt worker joins
    /// the pool when there is room.
    pub async fn get_worker(&self, id: &WorkerId) -> Result<Option<Arc<Worker>>> {
        if let Some(worker) = self.pool.get(id).await {
            return Ok(Some(worker));
        }
        let Some(worker) = self.rehydrate(id).await? else {
            return Ok(None);
        };

        let mut pool = self.pool.lock().await;
        if pool.has_capacity() {
            pool.insert(worker.clone())?;
        } else {
            debug!(worker_id = %id, "Pool full, rehydrated worker not registered");
        }
        Ok(Some(worker))
    }

    /// Stop a worker, optionally force-remove its workspace, and forget it.
    pub async fn remove_worker(&self, id: &WorkerId, remove_workspace: bool) -> Result<bool> {
        let worker = match self.pool.remove(id).await {
            Some(worker) => worker,
            None => match self.rehydrate(id).await? {
                Some(worker) => worker,
                None => return self.store.remove::<WorkerRecord>(&id.to_string()).await,
            },
        };

        if worker.is_running() {
            if let Err(e) = worker.stop().await {
                warn!(worker_id = %id, error = %e, "Failed to stop worker");
            }
        }
        if remove_workspace {
            match self.workspaces.remove(worker.workspace(), true).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(worker_id = %id, workspace = %worker.workspace().name, error = %e, "Failed to remove workspace")
                }
            }
        }
        self.store.remove::<WorkerRecord>(&id.to_string()).await?;

        info!(worker_id = %id, remove_workspace, "Removed worker");
        Ok(true)
    }

    pub async fn list_workers(&self) -> Vec<WorkerInfo> {
        let mut infos = Vec::new();
        for worker in self.pool.list().await {
            infos.push(worker.info().await);
        }
        infos
    }

    /// Available pool workers first, then newly created and started ones,
    /// up to `needed`. Stops early when the pool is full.
    async fn acquire_workers(&self, needed: usize) -> Vec<Arc<Worker>> {
        let mut workers: Vec<Arc<Worker>> = self
            .pool
            .available()
            .await
            .into_iter()
            .take(needed)
            .collect();
        let reused = workers.len();

        while workers.len() < needed {
            let worker = match self.create_worker(WorkerOptions::default()).await {
                Ok(worker) => worker,
                Err(e) => {
                    warn!(error = %e, "Could not create worker");
                    break;
                }
            };
            match worker.start().await {
                Ok(true) => workers.push(worker),
                Ok(false) => {
                    warn!(worker_id = %worker.id(), "Worker failed its probe");
                    self.discard(&worker).await;
                    break;
                }
                Err(e) => {
                    warn!(worker_id = %worker.id(), error = %e, "Worker failed to start");
                    self.discard(&worker).await;
                    break;
                }
            }
        }

        debug!(reused, created = workers.len() - reused, "Acquired workers");
        workers
    }

    async fn discard(&self, worker: &Worker) {
        if let Err(e) = self.remove_worker(&worker.id(), true).await {
            warn!(worker_id = %worker.id(), error = %e, "Failed to discard worker");
        }
    }

    /// Run a batch of tasks with up to `max_concurrent` in parallel
    /// (the configured instance cap when `None`).
    ///
    /// Duplicate names, unknown dependency names and cycles are rejected
    /// before any session is created.
    pub async fn run_parallel_tasks(
        &self,
        specs: Vec<TaskSpec>,
        session_name: Option<&str>,
        max_concurrent: Option<usize>,
    ) -> Result<RunReport> {
        let max_concurrent = max_concurrent.unwrap_or(self.config.max_concurrent_instances);
        let tasks = build_tasks(&specs)?;
        let name = session_name
            .map(String::from)
            .unwrap_or_else(|| format!("parallel-{}", Utc::now().format("%Y%m%d-%H%M%S")));
        let description = format!("Parallel execution of {} tasks", specs.len());
        self.run_batch(tasks, &name, &description, max_concurrent, "parallel")
            .await
    }

    /// Run steps one after another. Each step implicitly depends on the
    /// previous one, so a failed step fails the rest.
    pub async fn run_sequential_workflow(
        &self,
        steps: Vec<TaskSpec>,
        session_name: Option<&str>,
    ) -> Result<RunReport> {
        let mut chained = Vec::with_capacity(steps.len());
        let mut previous: Option<String> = None;
        for mut step in steps {
            if let Some(prev) = previous.take() {
                if !step.dependencies.contains(&prev) {
                    step.dependencies.push(prev);
                }
            }
            previous = Some(step.name.clone());
            chained.push(step);
        }

        let tasks = build_tasks(&chained)?;
        let name = session_name
            .map(String::from)
            .unwrap_or_else(|| format!("workflow-{}", Utc::now().format("%Y%m%d-%H%M%S")));
        let description = format!("Sequential workflow of {} steps", chained.len());
        self.run_batch(tasks, &name, &description, 1, "sequential")
            .await
    }

    async fn run_batch(
        &self,
        tasks: Vec<NewTask>,
        name: &str,
        description: &str,
        max_concurrent: usize,
        mode: &str,
    ) -> Result<RunReport> {
        if max_concurrent == 0 {
            return Err(Error::Validation("max_concurrent must be at least 1".into()));
        }

        let mut metadata = Metadata::new();
        metadata.insert("mode".into(), mode.into());
        metadata.insert("task_count".into(), tasks.len().into());
        metadata.insert("max_concurrent".into(), max_concurrent.into());

        let session = self
            .sessions
            .create_session(name, Some(description), metadata)
            .await?;
        let task_count = tasks.len();
        for task in tasks {
            self.sessions.add_task(&session.id, task).await?;
        }

        let workers = self
            .acquire_workers(task_count.min(max_concurrent))
            .await;
        if workers.is_empty() && task_count > 0 {
            warn!(session_id = %session.id, "No workers available for batch");
            return Ok(RunReport {
                success: false,
                session_id: session.id,
                status: self.sessions.get_session_status(&session.id).await?,
                workers_used: 0,
                error: Some("No workers available".into()),
            });
        }
        for worker in &workers {
            self.sessions.add_worker(&session.id, worker).await?;
        }

        let success = self
            .sessions
            .execute_session(&session.id, workers.clone(), max_concurrent)
            .await;
        let status = self.sessions.get_session_status(&session.id).await?;
        let error = if success {
            None
        } else {
            status
                .as_ref()
                .and_then(|s| s.metadata.get("error"))
                .and_then(|e| e.as_str())
                .map(String::from)
                .or_else(|| Some("Session execution failed".into()))
        };

        Ok(RunReport {
            success,
            session_id: session.id,
            status,
            workers_used: workers.len(),
            error,
        })
    }

    /// Remove idle workers and workspaces untouched for `max_age`, and
    /// archive terminal sessions of the same age. Individual failures are
    /// logged and skipped.
    pub async fn cleanup(&self, max_age: Duration) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));

        if let Some(cutoff) = cutoff {
            for worker in self.pool.list().await {
                let last = worker.last_activity().unwrap_or(worker.created_at());
                if worker.is_leased() || last > cutoff {
                    continue;
                }
                match self.remove_worker(&worker.id(), false).await {
                    Ok(true) => report.workers_removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(worker_id = %worker.id(), error = %e, "Failed to remove stale worker"),
                }
            }
        }

        let owned: HashSet<String> = self
            .pool
            .list()
            .await
            .iter()
            .map(|w| w.workspace().name.clone())
            .collect();
        for handle in self.workspaces.list_stale(max_age).await? {
            if owned.contains(&handle.name) {
                continue;
            }
            match self.workspaces.remove(&handle, false).await {
                Ok(true) => report.workspaces_removed += 1,
                Ok(false) => {
                    debug!(workspace = %handle.name, "Stale workspace has uncommitted changes, kept")
                }
                Err(e) => warn!(workspace = %handle.name, error = %e, "Failed to remove stale workspace"),
            }
        }

        report.sessions_archived = self.sessions.evict_terminal(max_age).await.len();

        info!(
            workspaces_removed = report.workspaces_removed,
            workers_removed = report.workers_removed,
            sessions_archived = report.sessions_archived,
            "Cleanup finished"
        );
        Ok(report)
    }

    pub async fn health_check(&self) -> HealthReport {
        let store = ComponentHealth::from_result(self.store.ping().await);
        let workspaces = ComponentHealth::from_result(self.workspaces.ping().await);
        let mut workers = BTreeMap::new();
        for worker in self.pool.list().await {
            workers.insert(worker.id(), worker.health_check().await);
        }
        HealthReport::new(store, workspaces, workers)
    }

    /// Cancel running sessions, then stop every running worker and empty
    /// the pool. Worker records stay in the store for `get_worker`.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.cancel.cancel();

        for worker in self.pool.drain().await {
            if !worker.is_running() {
                continue;
            }
            if let Err(e) = worker.stop().await {
                warn!(worker_id = %worker.id(), error = %e, "Failed to stop worker");
            }
        }
    }
}

/// Resolve task names to task ids and reject malformed batches.
fn build_tasks(specs: &[TaskSpec]) -> Result<Vec<NewTask>> {
    let mut ids: HashMap<&str, TaskId> = HashMap::new();
    for spec in specs {
        if ids.insert(spec.name.as_str(), TaskId::new()).is_some() {
            return Err(Error::Validation(format!(
                "Duplicate task name '{}'",
                spec.name
            )));
        }
    }

    let mut tasks = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut deps = Vec::with_capacity(spec.dependencies.len());
        for dep in &spec.dependencies {
            let Some(id) = ids.get(dep.as_str()) else {
                return Err(Error::Validation(format!(
                    "Task '{}' depends on unknown task '{}'",
                    spec.name, dep
                )));
            };
            deps.push(*id);
        }
        let id = ids[spec.name.as_str()];
        tasks.push(
            NewTask::new(&spec.name, &spec.description)
                .with_id(id)
                .priority(spec.priority)
                .depends_on(deps)
                .context(spec.context.clone()),
        );
    }

    let preview: Vec<_> = tasks.iter().cloned().map(NewTask::into_task).collect();
    DependencyGraph::from_tasks(&preview).topological_order()?;
    Ok(tasks)
}
