//! Dependency-aware task scheduler.
//!
//! The scheduler drives every task of one session from `pending` to a
//! terminal status. Ready tasks are dispatched in priority order to leased
//! workers, executions run concurrently under a semaphore of
//! `max_concurrent` permits, and the loop wakes on each completion to
//! recompute the ready set. Ready tasks whose workers are all leased by
//! another session wait for a lease to be released. When nothing is in
//! flight and no task can become ready, the remaining pending tasks are
//! failed with the reason they can never run.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::graph::{DependencyGraph, REASON_NO_WORKERS};
use crate::core::{Session, SessionId, SessionStatus, TaskId, TaskResult};
use crate::error::{Error, Result};
use crate::store::{SessionRecord, Store, StoreExt};
use crate::util::elapsed_secs;
use crate::worker::{Worker, WorkerId, WorkerLease};

pub const CANCELLED_REASON: &str = "cancelled: orchestrator shutdown";

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    /// A pending task was failed because it can never become ready.
    TaskUnreachable {
        task_id: TaskId,
        reason: String,
    },
    SessionFinished {
        session_id: SessionId,
        status: SessionStatus,
    },
}

struct Completion {
    task_id: TaskId,
    result: TaskResult,
    /// Held until the result is applied, so a worker is never assigned to
    /// two running tasks.
    lease: Option<WorkerLease>,
}

pub struct Scheduler {
    session: Arc<RwLock<Session>>,
    workers: Vec<Arc<Worker>>,
    max_concurrent: usize,
    store: Arc<dyn Store>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    /// In-flight task to the worker executing it.
    in_flight: HashMap<TaskId, WorkerId>,
    handles: HashMap<tokio::task::Id, TaskId>,
}

impl Scheduler {
    pub fn new(
        session: Arc<RwLock<Session>>,
        workers: Vec<Arc<Worker>>,
        max_concurrent: usize,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            session,
            workers,
            max_concurrent,
            store,
            event_tx: None,
            cancel: CancellationToken::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: HashMap::new(),
            handles: HashMap::new(),
        }
    }

    /// Events are sent without waiting. When the channel is full the
    /// event is dropped with a warning, so a receiver that is never read
    /// cannot stall execution.
    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    fn emit(&self, event: SchedulerEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "Event channel full, dropping event");
            }
        }
    }

    /// Snapshot and write under the session's write lock, so concurrent
    /// writers of the same session land in order.
    async fn persist(&self) -> Result<()> {
        let session = self.session.write().await;
        let record = SessionRecord::from_session(&session)?;
        self.store.save(&record).await
    }

    /// Drive the session until every task is terminal.
    ///
    /// Task failures are recorded on the tasks; only persistence errors and
    /// cancellation end the loop with an error.
    pub async fn run(&mut self) -> Result<()> {
        let mut running: JoinSet<Completion> = JoinSet::new();
        let result = self.drive(&mut running).await;
        if !running.is_empty() {
            // Wait for aborted executions to drop, releasing their workers.
            running.shutdown().await;
        }
        result
    }

    async fn drive(&mut self, running: &mut JoinSet<Completion>) -> Result<()> {
        loop {
            let dispatched = self.dispatch(running).await?;
            if dispatched > 0 {
                debug!(dispatched, in_flight = self.in_flight.len(), "Dispatched tasks");
            }

            if running.is_empty() {
                if self.workers.is_empty() || !self.has_ready().await {
                    self.fail_starved().await?;
                    break;
                }
                debug!("Every worker is leased elsewhere, waiting for a release");
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(Error::Cancelled("orchestrator shutdown".to_string()));
                    }
                    _ = wait_for_release(&self.workers) => continue,
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    running.shutdown().await;
                    self.fail_in_flight().await?;
                    return Err(Error::Cancelled("orchestrator shutdown".to_string()));
                }
                Some(joined) = running.join_next() => {
                    match joined {
                        Ok(completion) => self.apply(completion).await?,
                        Err(e) => {
                            let Some(task_id) = self.handles.remove(&e.id()) else {
                                error!(error = %e, "Untracked execution ended abnormally");
                                continue;
                            };
                            let result = TaskResult::failure(task_id, format!("execution aborted: {}", e));
                            self.apply(Completion { task_id, result, lease: None }).await?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn has_ready(&self) -> bool {
        !self
            .session
            .read()
            .await
            .ready_tasks(&HashSet::new())
            .is_empty()
    }

    /// Assign ready tasks to free workers until the concurrency budget or
    /// the worker list is exhausted.
    async fn dispatch(&mut self, running: &mut JoinSet<Completion>) -> Result<usize> {
        let ready = {
            let exclude: HashSet<TaskId> = self.in_flight.keys().copied().collect();
            self.session.read().await.ready_tasks(&exclude)
        };

        let mut dispatched = 0;
        for task_id in ready {
            if self.in_flight.len() >= self.max_concurrent {
                break;
            }
            let Some(lease) = self.workers.iter().find_map(|w| w.try_lease()) else {
                debug!("No free worker, waiting for a completion");
                break;
            };
            let worker = Arc::clone(lease.worker());
            let worker_id = worker.id();

            let (description, context) = {
                let mut session = self.session.write().await;
                let task = session.task_mut(&task_id).ok_or_else(|| {
                    Error::Validation(format!("Task {} vanished from session", task_id))
                })?;
                task.start(worker_id)?;
                let work = (task.description.clone(), task.context.clone());
                session.touch();
                work
            };
            self.in_flight.insert(task_id, worker_id);
            self.persist().await?;
            info!(task_id = %task_id.short(), worker_id = %worker_id.short(), "Task started");
            self.emit(SchedulerEvent::TaskStarted { task_id, worker_id });

            let semaphore = Arc::clone(&self.semaphore);
            let handle = running.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started = Utc::now();
                let outcome = AssertUnwindSafe(worker.run_task(&description, &context))
                    .catch_unwind()
                    .await;

                let result = match outcome {
                    Ok(outcome) => TaskResult {
                        task_id,
                        success: outcome.success,
                        output: Some(outcome.output).filter(|o| !o.is_empty()),
                        error: outcome.error,
                        execution_time: elapsed_secs(started),
                        metadata: Default::default(),
                    }
                    .with_metadata("attempts", outcome.attempts),
                    Err(panic) => TaskResult {
                        execution_time: elapsed_secs(started),
                        ..TaskResult::failure(task_id, panic_message(panic))
                    },
                };
                Completion {
                    task_id,
                    result: result.with_metadata("worker_id", worker_id.to_string()),
                    lease: Some(lease),
                }
            });
            self.handles.insert(handle.id(), task_id);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn apply(&mut self, completion: Completion) -> Result<()> {
        let Completion {
            task_id,
            result,
            lease,
        } = completion;
        self.in_flight.remove(&task_id);
        self.handles.retain(|_, t| *t != task_id);

        let success = result.success;
        let error = result.error.clone().unwrap_or_default();
        {
            let mut session = self.session.write().await;
            if let Some(task) = session.task_mut(&task_id) {
                task.finish(result)?;
            }
            session.touch();
        }
        self.persist().await?;
        drop(lease);

        if success {
            info!(task_id = %task_id.short(), "Task completed");
            self.emit(SchedulerEvent::TaskCompleted { task_id });
        } else {
            warn!(task_id = %task_id.short(), error = %error, "Task failed");
            self.emit(SchedulerEvent::TaskFailed { task_id, error });
        }
        Ok(())
    }

    /// Fail every pending task; nothing is running so none can become ready.
    ///
    /// Ready tasks reach here only when the scheduler was given no workers.
    async fn fail_starved(&mut self) -> Result<()> {
        let failed = {
            let mut session = self.session.write().await;
            let pending = session.pending_tasks();
            if pending.is_empty() {
                return Ok(());
            }
            let graph = DependencyGraph::from_tasks(session.tasks.values());
            let ready: HashSet<TaskId> = session.ready_tasks(&HashSet::new()).into_iter().collect();

            let mut failed = Vec::with_capacity(pending.len());
            for task_id in pending {
                let reason = if ready.contains(&task_id) {
                    REASON_NO_WORKERS.to_string()
                } else {
                    graph.unreachable_reason(&task_id)
                };
                if let Some(task) = session.task_mut(&task_id) {
                    task.fail(&reason)?;
                }
                failed.push((task_id, reason));
            }
            session.touch();
            failed
        };
        self.persist().await?;

        for (task_id, reason) in failed {
            warn!(task_id = %task_id.short(), reason = %reason, "Task unreachable");
            self.emit(SchedulerEvent::TaskUnreachable { task_id, reason });
        }
        Ok(())
    }

    async fn fail_in_flight(&mut self) -> Result<()> {
        let cancelled: Vec<TaskId> = self.in_flight.drain().map(|(id, _)| id).collect();
        self.handles.clear();
        {
            let mut session = self.session.write().await;
            for task_id in &cancelled {
                if let Some(task) = session.task_mut(task_id) {
                    task.fail(CANCELLED_REASON)?;
                }
            }
            session.touch();
        }
        self.persist().await?;
        for task_id in cancelled {
            self.emit(SchedulerEvent::TaskFailed {
                task_id,
                error: CANCELLED_REASON.to_string(),
            });
        }
        Ok(())
    }
}

/// Resolves once any of `workers` has a lease released.
async fn wait_for_release(workers: &[Arc<Worker>]) {
    let mut waits: Vec<_> = workers
        .iter()
        .map(|w| Box::pin(w.lease_released()))
        .collect();
    for wait in &mut waits {
        wait.as_mut().enable();
    }
    if workers.iter().any(|w| !w.is_leased()) {
        return;
    }
    futures::future::select_all(waits).await;
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("execution panicked: {}", detail)
}
