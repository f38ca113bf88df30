//! Keyed document persistence for sessions, workers and workspaces.
//!
//! Stores deal in `serde_json::Value` documents grouped by `Collection`.
//! Typed access goes through `Record` and the `StoreExt` helpers.

mod json;
mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

use crate::core::{Session, SessionId, SessionStatus};
use crate::error::Result;
use crate::worker::{WorkerConfig, WorkerId, WorkerStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Sessions,
    Workers,
    Workspaces,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Sessions,
        Collection::Workers,
        Collection::Workspaces,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Sessions => "sessions",
            Collection::Workers => "workers",
            Collection::Workspaces => "workspaces",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert(&self, collection: Collection, key: &str, value: serde_json::Value)
        -> Result<()>;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<serde_json::Value>>;

    async fn list(&self, collection: Collection) -> Result<Vec<serde_json::Value>>;

    /// Returns whether a document was removed.
    async fn delete(&self, collection: Collection, key: &str) -> Result<bool>;

    /// Reachability check for health reporting.
    async fn ping(&self) -> Result<()>;
}

/// A typed document living in one collection.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: Collection;

    fn key(&self) -> String;
}

#[async_trait]
pub trait StoreExt: Store {
    async fn save<R: Record>(&self, record: &R) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.upsert(R::COLLECTION, &record.key(), value).await
    }

    async fn load<R: Record>(&self, key: &str) -> Result<Option<R>> {
        match self.get(R::COLLECTION, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn load_all<R: Record>(&self) -> Result<Vec<R>> {
        self.list(R::COLLECTION)
            .await?
            .into_iter()
            .map(|value| Ok(serde_json::from_value(value)?))
            .collect()
    }

    async fn remove<R: Record>(&self, key: &str) -> Result<bool> {
        self.delete(R::COLLECTION, key).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// Persisted session: indexed columns plus the full session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub name: String,
    pub description: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// JSON-encoded `Session`, tasks included.
    pub data: String,
}

impl SessionRecord {
    pub fn from_session(session: &Session) -> Result<Self> {
        Ok(Self {
            session_id: session.id,
            name: session.name.clone(),
            description: session.description.clone(),
            status: session.status,
            created_at: session.created_at,
            updated_at: session.updated_at,
            completed_at: session.completed_at,
            data: serde_json::to_string(session)?,
        })
    }

    pub fn into_session(self) -> Result<Session> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

impl Record for SessionRecord {
    const COLLECTION: Collection = Collection::Sessions;

    fn key(&self) -> String {
        self.session_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub workspace_name: String,
    pub status: WorkerStatus,
    pub config: WorkerConfig,
    pub created_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Record for WorkerRecord {
    const COLLECTION: Collection = Collection::Workers;

    fn key(&self) -> String {
        self.worker_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_repo: PathBuf,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl Record for WorkspaceRecord {
    const COLLECTION: Collection = Collection::Workspaces;

    fn key(&self) -> String {
        self.name.clone()
    }
}
