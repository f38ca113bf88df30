//! A pooled worker bound to one workspace and one execution endpoint.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::core::Context;
use crate::error::{Error, Result};
use crate::store::{Store, StoreExt, WorkerRecord};
use crate::util::backoff_delay;
use crate::worker::executor::{ExecError, ExecOptions, Executor};
use crate::workspace::{WorkspaceHandle, WorkspaceProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Worker lifecycle.
///
/// ```text
/// idle --start--> active --execute--> busy --done--> active
///   |               |                  |
///   +----stop-------+------------------+--> stopped --start--> active
///
/// any --unrecoverable error--> error --start--> active
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Active,
    Busy,
    Stopped,
    Error,
}

impl WorkerStatus {
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Idle, Active)
                | (Idle, Stopped)
                | (Idle, Error)
                | (Active, Busy)
                | (Active, Stopped)
                | (Active, Error)
                | (Busy, Active)
                | (Busy, Stopped)
                | (Busy, Error)
                | (Stopped, Active)
                | (Stopped, Error)
                | (Error, Active)
                | (Error, Stopped)
        )
    }

    /// Idle and active workers may be handed new work.
    pub fn is_assignable(self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Active)
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            WorkerStatus::Idle | WorkerStatus::Active | WorkerStatus::Busy
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Stopped => write!(f, "stopped"),
            WorkerStatus::Error => write!(f, "error"),
        }
    }
}

/// Fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub permission_mode: String,
    /// Per-attempt execution timeout.
    pub timeout: Duration,
    pub max_retries: u32,
    /// Overrides the workspace path as the endpoint's working directory.
    pub working_directory: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Config::default().worker_config()
    }
}

/// Uniform result of `Worker::execute`. Failures are data, not errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub messages: Vec<serde_json::Value>,
    /// Endpoint calls made, including retries.
    pub attempts: u32,
}

impl ExecutionOutcome {
    fn failure(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            attempts,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub workspace: String,
    pub path: PathBuf,
    pub branch: String,
    pub status: WorkerStatus,
    pub is_running: bool,
    pub has_changes: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub config: WorkerConfig,
}

/// Collaborators a worker talks to.
#[derive(Clone)]
pub struct WorkerDeps {
    pub executor: Arc<dyn Executor>,
    pub workspaces: Arc<dyn WorkspaceProvider>,
    pub store: Arc<dyn Store>,
}

struct WorkerState {
    status: WorkerStatus,
    last_activity: Option<DateTime<Utc>>,
}

pub struct Worker {
    id: WorkerId,
    workspace: WorkspaceHandle,
    config: WorkerConfig,
    deps: WorkerDeps,
    created_at: DateTime<Utc>,
    state: Mutex<WorkerState>,
    leased: AtomicBool,
    released: Notify,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("workspace", &self.workspace.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Worker {
    pub fn new(workspace: WorkspaceHandle, config: WorkerConfig, deps: WorkerDeps) -> Self {
        Self {
            id: WorkerId::new(),
            workspace,
            config,
            deps,
            created_at: Utc::now(),
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Idle,
                last_activity: None,
            }),
            leased: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    /// Rebuild a worker from its persisted record.
    pub fn restore(record: WorkerRecord, workspace: WorkspaceHandle, deps: WorkerDeps) -> Self {
        Self {
            id: record.worker_id,
            workspace,
            config: record.config,
            deps,
            created_at: record.created_at,
            state: Mutex::new(WorkerState {
                status: record.status,
                last_activity: record.last_activity,
            }),
            leased: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn workspace(&self) -> &WorkspaceHandle {
        &self.workspace
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().status
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_activity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    /// Assignable status and not leased to an in-flight task.
    pub fn is_available(&self) -> bool {
        self.status().is_assignable() && !self.is_leased()
    }

    /// Claim the worker for one task. The claim is released when the
    /// returned lease is dropped.
    ///
    /// Status is not checked: `execute` restarts stopped or errored workers.
    pub fn try_lease(self: &Arc<Self>) -> Option<WorkerLease> {
        self.leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(WorkerLease {
            worker: Arc::clone(self),
        })
    }

    /// Resolves on the next lease release. Call `enable` on the pinned
    /// future before checking `is_leased` to avoid missing a release.
    pub fn lease_released(&self) -> Notified<'_> {
        self.released.notified()
    }

    fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            system_prompt: self.config.system_prompt.clone(),
            allowed_tools: self.config.allowed_tools.clone(),
            permission_mode: self.config.permission_mode.clone(),
            working_directory: self
                .config
                .working_directory
                .clone()
                .unwrap_or_else(|| self.workspace.path.clone()),
        }
    }

    pub fn record(&self) -> WorkerRecord {
        let state = self.state.lock();
        WorkerRecord {
            worker_id: self.id,
            workspace_name: self.workspace.name.clone(),
            status: state.status,
            config: self.config.clone(),
            created_at: self.created_at,
            last_activity: state.last_activity,
        }
    }

    /// Persistence here is best-effort: a failed write must not change
    /// the outcome of the operation that triggered it.
    pub async fn persist(&self) {
        if let Err(e) = self.deps.store.save(&self.record()).await {
            warn!(worker_id = %self.id, error = %e, "Failed to persist worker record");
        }
    }

    fn set_status(&self, next: WorkerStatus) -> Result<()> {
        let mut state = self.state.lock();
        if state.status == next {
            return Ok(());
        }
        if !state.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: "worker",
                from: state.status.to_string(),
                to: next.to_string(),
            });
        }
        debug!(worker_id = %self.id, from = %state.status, to = %next, "Worker status change");
        state.status = next;
        state.last_activity = Some(Utc::now());
        Ok(())
    }

    /// Busy -> Active without awaiting, for executions dropped mid-flight.
    fn reset_busy(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != WorkerStatus::Busy {
            return false;
        }
        state.status = WorkerStatus::Active;
        state.last_activity = Some(Utc::now());
        true
    }

    async fn transition(&self, next: WorkerStatus) -> Result<()> {
        self.set_status(next)?;
        self.persist().await;
        Ok(())
    }

    /// Verify the workspace and probe the endpoint.
    ///
    /// Returns `Ok(false)` and moves to `error` if the probe fails.
    pub async fn start(&self) -> Result<bool> {
        match self.status() {
            WorkerStatus::Active | WorkerStatus::Busy => return Ok(true),
            _ => {}
        }
        if !self.deps.workspaces.exists(&self.workspace).await {
            return Err(Error::WorkspaceMissing(self.workspace.name.clone()));
        }

        if self.deps.executor.probe(&self.exec_options()).await {
            self.transition(WorkerStatus::Active).await?;
            info!(worker_id = %self.id, workspace = %self.workspace.name, "Worker started");
            Ok(true)
        } else {
            self.transition(WorkerStatus::Error).await?;
            warn!(worker_id = %self.id, "Endpoint probe failed");
            Ok(false)
        }
    }

    pub async fn stop(&self) -> Result<()> {
        if self.status() == WorkerStatus::Stopped {
            return Ok(());
        }
        self.transition(WorkerStatus::Stopped).await?;
        info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    /// Run one prompt, retrying transient failures with `2^attempt` second
    /// backoff. Fatal endpoint errors are not retried.
    pub async fn execute(
        &self,
        prompt: &str,
        timeout: Option<Duration>,
        max_retries: u32,
    ) -> ExecutionOutcome {
        if self.status() != WorkerStatus::Active {
            match self.start().await {
                Ok(true) => {}
                Ok(false) => return ExecutionOutcome::failure("Failed to start worker", 0),
                Err(e) => return ExecutionOutcome::failure(e.to_string(), 0),
            }
        }
        if let Err(e) = self.transition(WorkerStatus::Busy).await {
            return ExecutionOutcome::failure(e.to_string(), 0);
        }
        let _reset = BusyReset(self);

        let timeout = timeout.unwrap_or(self.config.timeout);
        let options = self.exec_options();
        let attempts = max_retries + 1;
        let mut last_error = ExecError::Other("no attempts made".to_string());

        for attempt in 0..attempts {
            let result =
                tokio::time::timeout(timeout, self.deps.executor.execute(prompt, &options)).await;
            let err = match result {
                Ok(Ok(response)) => {
                    self.finish(WorkerStatus::Active).await;
                    return ExecutionOutcome {
                        success: response.success,
                        output: response.output,
                        error: response.error,
                        messages: response.messages,
                        attempts: attempt + 1,
                    };
                }
                Ok(Err(e)) => e,
                Err(_) => ExecError::Timeout(timeout),
            };

            if !err.is_transient() {
                warn!(worker_id = %self.id, error = %err, "Fatal execution error");
                self.finish(WorkerStatus::Error).await;
                return ExecutionOutcome::failure(err.to_string(), attempt + 1);
            }

            if attempt + 1 < attempts {
                let delay = backoff_delay(attempt);
                warn!(
                    worker_id = %self.id,
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "Execution failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            last_error = err;
        }

        self.finish(WorkerStatus::Error).await;
        let message = match &last_error {
            ExecError::Timeout(_) => format!("Execution timed out after {} attempts", attempts),
            ExecError::Connection(e) => {
                format!("Connection failed after {} attempts: {}", attempts, e)
            }
            other => format!("Execution failed after {} attempts: {}", attempts, other),
        };
        ExecutionOutcome::failure(message, attempts)
    }

    async fn finish(&self, next: WorkerStatus) {
        // A concurrent stop() may already have moved the worker on.
        if self.status() == WorkerStatus::Busy {
            if let Err(e) = self.transition(next).await {
                warn!(worker_id = %self.id, error = %e, "Worker status update failed");
            }
        }
    }

    /// Run a task description with its context appended to the prompt.
    pub async fn run_task(&self, description: &str, context: &Context) -> ExecutionOutcome {
        let prompt = build_prompt(description, context);
        self.execute(&prompt, None, self.config.max_retries).await
    }

    pub async fn health_check(&self) -> WorkerHealth {
        let mut issues = Vec::new();
        if !self.is_running() {
            issues.push("Worker is not running".to_string());
        }
        if !self.deps.workspaces.exists(&self.workspace).await {
            issues.push("Workspace directory does not exist".to_string());
        } else if !self.deps.workspaces.is_valid_repo(&self.workspace).await {
            issues.push("Workspace is not a valid git repository".to_string());
        }
        WorkerHealth {
            healthy: issues.is_empty(),
            issues,
        }
    }

    pub async fn info(&self) -> WorkerInfo {
        let has_changes = self
            .deps
            .workspaces
            .has_uncommitted_changes(&self.workspace)
            .await
            .unwrap_or(false);
        let state = self.record();
        WorkerInfo {
            id: self.id,
            workspace: self.workspace.name.clone(),
            path: self.workspace.path.clone(),
            branch: self.workspace.branch.clone(),
            status: state.status,
            is_running: state.status.is_running(),
            has_changes,
            created_at: self.created_at,
            last_activity: state.last_activity,
            config: self.config.clone(),
        }
    }
}

/// Exclusive claim on a worker for one in-flight task.
#[derive(Debug)]
pub struct WorkerLease {
    worker: Arc<Worker>,
}

impl WorkerLease {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.worker.leased.store(false, Ordering::Release);
        self.worker.released.notify_waiters();
    }
}

/// Returns the worker to `active` if `execute` is dropped, aborted or
/// unwound while the worker is still `busy`.
struct BusyReset<'a>(&'a Worker);

impl Drop for BusyReset<'_> {
    fn drop(&mut self) {
        let worker = self.0;
        if !worker.reset_busy() {
            return;
        }
        warn!(worker_id = %worker.id, "Execution ended while busy, worker reset to active");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&worker.deps.store);
        let record = worker.record();
        runtime.spawn(async move {
            if let Err(e) = store.save(&record).await {
                warn!(worker_id = %record.worker_id, error = %e, "Failed to persist worker record");
            }
        });
    }
}

/// Task description followed by an `Additional context:` block, one
/// `- key: value` line per entry.
pub fn build_prompt(description: &str, context: &Context) -> String {
    if context.is_empty() {
        return description.to_string();
    }
    let mut prompt = format!("{}\n\nAdditional context:", description);
    for (key, value) in context {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        prompt.push_str(&format!("\n- {}: {}", key, value));
    }
    prompt
}
