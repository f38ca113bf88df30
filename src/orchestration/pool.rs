//! Worker registry with a hard capacity.
//!
//! Create, remove and list all go through one async mutex so two callers
//! can never both pass the capacity check before either registers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::worker::{Worker, WorkerId};

pub struct WorkerPool {
    max_workers: usize,
    workers: Mutex<HashMap<WorkerId, Arc<Worker>>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Hold the registry for a multi-step update such as
    /// check-capacity, create, register.
    pub async fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            max_workers: self.max_workers,
            workers: self.workers.lock().await,
        }
    }

    pub async fn get(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        self.workers.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        self.workers.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }

    /// All workers, oldest first.
    pub async fn list(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<Arc<Worker>> = self.workers.lock().await.values().cloned().collect();
        workers.sort_by_key(|w| (w.created_at(), w.id()));
        workers
    }

    /// Empty the registry, returning what it held oldest first.
    pub async fn drain(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<Arc<Worker>> =
            self.workers.lock().await.drain().map(|(_, w)| w).collect();
        workers.sort_by_key(|w| (w.created_at(), w.id()));
        workers
    }

    /// Idle or active workers not leased to a task, oldest first.
    pub async fn available(&self) -> Vec<Arc<Worker>> {
        self.list()
            .await
            .into_iter()
            .filter(|w| w.is_available())
            .collect()
    }
}

pub struct PoolGuard<'a> {
    max_workers: usize,
    workers: MutexGuard<'a, HashMap<WorkerId, Arc<Worker>>>,
}

impl PoolGuard<'_> {
    pub fn has_capacity(&self) -> bool {
        self.workers.len() < self.max_workers
    }

    pub fn insert(&mut self, worker: Arc<Worker>) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::PoolFull {
                max: self.max_workers,
            });
        }
        self.workers.insert(worker.id(), worker);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
