//! Session data model: one batch or workflow of tasks plus the workers
//! associated with it.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Session lifecycle.
///
/// ```text
/// active <--> paused
///   |           |
///   +-----+-----+
///         v
///  completed | failed
/// ```
///
/// A paused session can still be finished by an execution that was
/// already running when it was paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Paused, Completed)
                | (Paused, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Number of tasks in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}

/// Read-only view of a session's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub session_id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    pub task_counts: TaskCounts,
    pub total_tasks: usize,
    pub workers: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub description: Option<String>,
    pub status: SessionStatus,
    #[serde(default)]
    pub tasks: HashMap<TaskId, Task>,
    /// Worker id to workspace name. Records association only.
    #[serde(default)]
    pub workers: HashMap<WorkerId, String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(name: &str, description: Option<&str>, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name: name.to_string(),
            description: description.map(String::from),
            status: SessionStatus::Active,
            tasks: HashMap::new(),
            workers: HashMap::new(),
            metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: "session",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.touch();
        Ok(())
    }

    /// Fail the session and stash the cause under `metadata["error"]`.
    pub fn fail_with(&mut self, error: &str) -> Result<()> {
        self.transition(SessionStatus::Failed)?;
        self.metadata
            .insert("error".to_string(), serde_json::Value::from(error));
        Ok(())
    }

    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::Validation(format!(
                "Task {} already exists in session {}",
                task.id, self.id
            )));
        }
        self.tasks.insert(task.id, task);
        self.touch();
        Ok(())
    }

    pub fn add_worker(&mut self, worker: WorkerId, workspace: &str) {
        self.workers.insert(worker, workspace.to_string());
        self.touch();
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Whether every dependency of `task` has completed.
    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    /// Pending tasks whose dependencies are all completed, highest priority
    /// first. Ties go to the earlier `created_at`, then the smaller id.
    pub fn ready_tasks(&self, exclude: &HashSet<TaskId>) -> Vec<TaskId> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| !exclude.contains(&t.id))
            .filter(|t| self.dependencies_met(t))
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        ready.into_iter().map(|t| t.id).collect()
    }

    pub fn pending_tasks(&self) -> Vec<TaskId> {
        let mut pending: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.into_iter().map(|t| t.id).collect()
    }

    pub fn counts(&self) -> TaskCounts {
        self.tasks
            .values()
            .fold(TaskCounts::default(), |mut counts, task| {
                match task.status {
                    TaskStatus::Pending => counts.pending += 1,
                    TaskStatus::Running => counts.running += 1,
                    TaskStatus::Completed => counts.completed += 1,
                    TaskStatus::Failed => counts.failed += 1,
                }
                counts
            })
    }

    /// True once every task is completed or failed.
    pub fn all_finished(&self) -> bool {
        self.tasks.values().all(Task::is_finished)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            session_id: self.id,
            name: self.name.clone(),
            status: self.status,
            task_counts: self.counts(),
            total_tasks: self.tasks.len(),
            workers: self.workers.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            metadata: self.metadata.clone(),
        }
    }
}
