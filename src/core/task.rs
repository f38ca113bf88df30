//! Task data model for session execution.
//!
//! Tasks are the atomic units of work assigned to workers. Each task
//! tracks its status, assignment, dependencies, and result.

use crate::error::{Error, Result};
use crate::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Opaque key-value bag handed to workers alongside a task description.
pub type Context = BTreeMap<String, serde_json::Value>;

/// Unique identifier for a task within a session.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// ```text
/// pending --> running --> completed
///    |           |
///    +-----------+------> failed
/// ```
///
/// `pending -> failed` is only taken when the task can never become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task registered, waiting for its dependencies and a worker.
    #[default]
    Pending,
    /// Task is currently being executed by a worker.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed, either during execution or because it was unreachable.
    Failed,
}

impl TaskStatus {
    /// Whether the transition table allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }

    /// Completed and Failed are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one task execution. Immutable once attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TaskResult {
    /// A failed result for a task that never produced output.
    pub fn failure(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            output: None,
            error: Some(error.into()),
            execution_time: 0.0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A single task in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    /// The unit of work handed to the worker.
    pub description: String,
    /// Higher values are scheduled first.
    #[serde(default)]
    pub priority: i32,
    /// Tasks that must be `completed` before this one is ready.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub context: Context,
    pub status: TaskStatus,
    /// Worker the task was dispatched to. The pool owns the worker.
    pub assigned_worker: Option<WorkerId>,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task with the given name and description.
    pub fn new(name: &str, description: &str) -> Self {
        NewTask::new(name, description).into_task()
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: "task",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Dispatch the task to a worker.
    pub fn start(&mut self, worker: WorkerId) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.assigned_worker = Some(worker);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Attach the execution result; status follows `result.success`.
    pub fn finish(&mut self, result: TaskResult) -> Result<()> {
        let next = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.transition(next)?;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Fail a task without running it (pending) or abort a running one.
    pub fn fail(&mut self, reason: &str) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.result = Some(TaskResult::failure(self.id, reason));
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Error text of the attached result, if any.
    pub fn error(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.error.as_deref())
    }
}

/// Builder for tasks registered through `SessionManager::add_task`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub priority: i32,
    pub dependencies: BTreeSet<TaskId>,
    pub context: Context,
}

impl NewTask {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: description.to_string(),
            priority: 0,
            dependencies: BTreeSet::new(),
            context: Context::new(),
        }
    }

    /// Use a caller-chosen id, for batches whose dependencies are wired up front.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on<I: IntoIterator<Item = TaskId>>(mut self, deps: I) -> Self {
        self.dependencies.extend(deps);
        self
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn into_task(self) -> Task {
        Task {
            id: self.id,
            name: self.name,
            description: self.description,
            priority: self.priority,
            dependencies: self.dependencies,
            context: self.context,
            status: TaskStatus::Pending,
            assigned_worker: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}
