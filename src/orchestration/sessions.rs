//! Session lifecycle with write-through persistence.
//!
//! Sessions live in an in-memory cache and are upserted in full after
//! every mutation. A cache miss falls back to the store and repopulates
//! the cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock as AsyncRwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scheduler::{Scheduler, SchedulerEvent};
use crate::core::{Metadata, NewTask, Session, SessionId, SessionStatus, StatusSnapshot, Task};
use crate::error::Result;
use crate::store::{SessionRecord, Store, StoreExt};
use crate::worker::Worker;

type SharedSession = Arc<AsyncRwLock<Session>>;

pub struct SessionManager {
    store: Arc<dyn Store>,
    sessions: RwLock<HashMap<SessionId, SharedSession>>,
    executing: Mutex<HashSet<SessionId>>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    cancel: CancellationToken,
}

/// Marks a session as executing until dropped.
struct ExecutionGuard<'a> {
    executing: &'a Mutex<HashSet<SessionId>>,
    id: SessionId,
}

impl<'a> ExecutionGuard<'a> {
    fn acquire(executing: &'a Mutex<HashSet<SessionId>>, id: SessionId) -> Option<Self> {
        executing
            .lock()
            .insert(id)
            .then_some(Self { executing, id })
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.executing.lock().remove(&self.id);
    }
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            executing: Mutex::new(HashSet::new()),
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Number of sessions held in memory.
    pub fn cached(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_executing(&self, id: &SessionId) -> bool {
        self.executing.lock().contains(id)
    }

    async fn handle(&self, id: &SessionId) -> Result<Option<SharedSession>> {
        if let Some(session) = self.sessions.read().get(id) {
            return Ok(Some(session.clone()));
        }

        let Some(record) = self.store.load::<SessionRecord>(&id.to_string()).await? else {
            return Ok(None);
        };
        let session = record.into_session()?;
        debug!(session_id = %id, "Loaded session from store");

        let shared = self
            .sessions
            .write()
            .entry(*id)
            .or_insert_with(|| Arc::new(AsyncRwLock::new(session)))
            .clone();
        Ok(Some(shared))
    }

    async fn persist(&self, session: &Session) -> Result<()> {
        self.store.save(&SessionRecord::from_session(session)?).await
    }

    pub async fn create_session(
        &self,
        name: &str,
        description: Option<&str>,
        metadata: Metadata,
    ) -> Result<Session> {
        let session = Session::new(name, description, metadata);
        self.persist(&session).await?;
        self.sessions
            .write()
            .insert(session.id, Arc::new(AsyncRwLock::new(session.clone())));

        info!(session_id = %session.id, name, "Created session");
        Ok(session)
    }

    pub async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        match self.handle(id).await? {
            Some(shared) => Ok(Some(shared.read().await.clone())),
            None => Ok(None),
        }
    }

    /// Returns `None` when the session is unknown. A task id already in
    /// the session is rejected and the existing task is left untouched.
    pub async fn add_task(&self, id: &SessionId, new_task: NewTask) -> Result<Option<Task>> {
        let Some(shared) = self.handle(id).await? else {
            return Ok(None);
        };
        let mut session = shared.write().await;
        let task = new_task.into_task();
        session.add_task(task.clone())?;
        self.persist(&session).await?;

        debug!(session_id = %id, task_id = %task.id, name = %task.name, "Added task");
        Ok(Some(task))
    }

    pub async fn add_worker(&self, id: &SessionId, worker: &Worker) -> Result<bool> {
        let Some(shared) = self.handle(id).await? else {
            return Ok(false);
        };
        let mut session = shared.write().await;
        session.add_worker(worker.id(), &worker.workspace().name);
        self.persist(&session).await?;
        Ok(true)
    }

    /// Run every task of an active session to a terminal status.
    ///
    /// Returns true when the scheduler finished without an internal error,
    /// whatever the individual task outcomes. Returns false without
    /// touching anything when the session is unknown, not active, already
    /// executing, or `max_concurrent` is zero.
    pub async fn execute_session(
        &self,
        id: &SessionId,
        workers: Vec<Arc<Worker>>,
        max_concurrent: usize,
    ) -> bool {
        if max_concurrent == 0 {
            warn!(session_id = %id, "Refusing to execute with max_concurrent = 0");
            return false;
        }

        let Some(_guard) = ExecutionGuard::acquire(&self.executing, *id) else {
            warn!(session_id = %id, "Session is already executing");
            return false;
        };

        let shared = match self.handle(id).await {
            Ok(Some(shared)) => shared,
            Ok(None) => {
                warn!(session_id = %id, "Session not found");
                return false;
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "Failed to load session");
                return false;
            }
        };

        let status = shared.read().await.status;
        if status != SessionStatus::Active {
            warn!(session_id = %id, %status, "Session is not active");
            return false;
        }

        info!(
            session_id = %id,
            workers = workers.len(),
            max_concurrent,
            "Executing session"
        );

        let mut scheduler = Scheduler::new(
            shared.clone(),
            workers,
            max_concurrent,
            self.store.clone(),
        )
        .with_cancel(self.cancel.child_token());
        if let Some(tx) = &self.event_tx {
            scheduler = scheduler.with_events(tx.clone());
        }
        let outcome = scheduler.run().await;

        let mut session = shared.write().await;
        let finished = match outcome {
            Ok(()) => session.transition(SessionStatus::Completed),
            Err(e) => {
                error!(session_id = %id, error = %e, "Session execution failed");
                if let Err(te) = session.fail_with(&e.to_string()) {
                    warn!(session_id = %id, error = %te, "Could not mark session failed");
                }
                Err(e)
            }
        };
        let final_status = session.status;

        let persisted = self.persist(&session).await;
        drop(session);

        if let Err(e) = &persisted {
            error!(session_id = %id, error = %e, "Failed to persist finished session");
        }
        if let Some(tx) = &self.event_tx {
            let event = SchedulerEvent::SessionFinished {
                session_id: *id,
                status: final_status,
            };
            if let Err(TrySendError::Full(event)) = tx.try_send(event) {
                warn!(?event, "Event channel full, dropping event");
            }
        }

        info!(session_id = %id, status = %final_status, "Session finished");
        finished.is_ok() && persisted.is_ok()
    }

    pub async fn get_session_status(&self, id: &SessionId) -> Result<Option<StatusSnapshot>> {
        match self.handle(id).await? {
            Some(shared) => Ok(Some(shared.read().await.snapshot())),
            None => Ok(None),
        }
    }

    /// Blocks future executions. A running execution is not interrupted.
    pub async fn pause(&self, id: &SessionId) -> Result<bool> {
        self.move_status(id, SessionStatus::Active, SessionStatus::Paused)
            .await
    }

    pub async fn resume(&self, id: &SessionId) -> Result<bool> {
        self.move_status(id, SessionStatus::Paused, SessionStatus::Active)
            .await
    }

    async fn move_status(
        &self,
        id: &SessionId,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool> {
        let Some(shared) = self.handle(id).await? else {
            return Ok(false);
        };
        let mut session = shared.write().await;
        if session.status != from {
            return Ok(false);
        }
        session.transition(to)?;
        self.persist(&session).await?;

        info!(session_id = %id, %from, %to, "Session status changed");
        Ok(true)
    }

    /// Drop terminal sessions not updated within `older_than` from the
    /// cache. They stay in the store and reload on demand.
    pub async fn evict_terminal(&self, older_than: Duration) -> Vec<SessionId> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Vec::new();
        };
        let candidates: Vec<(SessionId, SharedSession)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        let mut evicted = Vec::new();
        for (id, shared) in candidates {
            if self.is_executing(&id) {
                continue;
            }
            let session = shared.read().await;
            if session.status.is_terminal() && session.updated_at <= cutoff {
                evicted.push(id);
            }
        }

        let mut sessions = self.sessions.write();
        for id in &evicted {
            sessions.remove(id);
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Archived terminal sessions");
        }
        evicted
    }

    /// Cancel every execution in progress.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }
}
