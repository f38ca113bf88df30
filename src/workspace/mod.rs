//! Isolated checkouts that workers operate in.

mod git;

pub use git::GitWorkspaces;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
}

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Create a workspace. Missing names are generated; `base_branch`
    /// falls back to the provider's default.
    async fn create(
        &self,
        name: Option<&str>,
        branch: Option<&str>,
        base_branch: Option<&str>,
    ) -> Result<WorkspaceHandle>;

    /// Look up a workspace by name, refreshing its last-access time.
    async fn get(&self, name: &str) -> Result<Option<WorkspaceHandle>>;

    /// Returns false when the workspace has uncommitted changes and
    /// `force` is not set.
    async fn remove(&self, handle: &WorkspaceHandle, force: bool) -> Result<bool>;

    async fn exists(&self, handle: &WorkspaceHandle) -> bool;

    async fn is_valid_repo(&self, handle: &WorkspaceHandle) -> bool;

    async fn has_uncommitted_changes(&self, handle: &WorkspaceHandle) -> Result<bool>;

    async fn list(&self) -> Result<Vec<WorkspaceHandle>>;

    /// Workspaces not accessed within `max_age`.
    async fn list_stale(&self, max_age: Duration) -> Result<Vec<WorkspaceHandle>>;

    /// Reachability check for health reporting.
    async fn ping(&self) -> Result<()>;
}
