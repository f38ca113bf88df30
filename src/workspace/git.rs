use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use git2::{BranchType, Repository, StatusOptions, WorktreeAddOptions, WorktreePruneOptions};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{Store, StoreExt, WorkspaceRecord};
use crate::util::{blocking, short_suffix};
use crate::workspace::{WorkspaceHandle, WorkspaceProvider};

/// Workspaces backed by git worktrees of one base repository.
///
/// Every workspace gets its own branch, created from the base branch.
/// Metadata lives in the store so workspaces survive process restarts.
pub struct GitWorkspaces {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
    default_branch: String,
    store: Arc<dyn Store>,
}

impl GitWorkspaces {
    pub fn new(
        repo_path: &Path,
        worktrees_dir: &Path,
        default_branch: &str,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        debug!(repo = %repo_path.display(), "GitWorkspaces::new");
        let repo = Repository::discover(repo_path)?;
        let repo_path = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self {
            repo_path,
            worktrees_dir: worktrees_dir.to_path_buf(),
            default_branch: default_branch.to_string(),
            store,
        })
    }

    pub fn from_config(repo_path: &Path, config: &Config, store: Arc<dyn Store>) -> Result<Self> {
        Self::new(
            repo_path,
            &config.worktrees_dir()?,
            &config.default_branch,
            store,
        )
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktrees_dir(&self) -> &Path {
        &self.worktrees_dir
    }

    async fn touch(&self, mut record: WorkspaceRecord) -> Result<WorkspaceRecord> {
        record.last_accessed = Utc::now();
        self.store.save(&record).await?;
        Ok(record)
    }
}

fn handle_of(record: &WorkspaceRecord) -> WorkspaceHandle {
    WorkspaceHandle {
        name: record.name.clone(),
        path: record.path.clone(),
        branch: record.branch.clone(),
    }
}

/// Create `branch` from `base_branch` (or HEAD when the base branch does
/// not exist) and check it out at `worktree_path`.
fn create_worktree(
    repo_path: &Path,
    name: &str,
    branch: &str,
    base_branch: &str,
    worktree_path: &Path,
) -> Result<()> {
    let repo = Repository::discover(repo_path)?;
    let commit = match repo.find_branch(base_branch, BranchType::Local) {
        Ok(base) => base.get().peel_to_commit()?,
        Err(e) if e.code() == git2::ErrorCode::NotFound => {
            debug!(base_branch, "Base branch not found, using HEAD");
            repo.head()?.peel_to_commit()?
        }
        Err(e) => return Err(e.into()),
    };
    debug!(branch, commit = %commit.id(), "Creating branch");
    let branch_ref = repo.branch(branch, &commit, false)?.into_reference();
    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(&branch_ref));
    repo.worktree(name, worktree_path, Some(&opts))?;
    Ok(())
}

fn prune_options() -> WorktreePruneOptions {
    let mut opts = WorktreePruneOptions::new();
    opts.valid(true).working_tree(true).locked(true);
    opts
}

/// Remove the worktree directory and every trace of it in the base repo.
///
/// The admin dir (`.git/worktrees/<name>`) must go too, otherwise git keeps
/// treating the branch as checked out.
fn remove_worktree(repo_path: &Path, name: &str, worktree_path: &Path) -> Result<()> {
    let repo = Repository::discover(repo_path)?;

    if let Ok(worktree) = repo.find_worktree(name) {
        let _ = worktree.unlock();
        if let Err(e) = worktree.prune(Some(&mut prune_options())) {
            warn!(name, error = %e, "Worktree prune failed");
        }
    }

    if worktree_path.exists() {
        std::fs::remove_dir_all(worktree_path)?;
    }

    let admin_dir = repo.path().join("worktrees").join(name);
    if admin_dir.exists() {
        debug!(dir = %admin_dir.display(), "Cleaning up worktree admin dir");
        let _ = std::fs::remove_dir_all(&admin_dir);
    }

    for stale in repo.worktrees()?.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(stale) {
            if !wt.path().exists() {
                let _ = wt.prune(Some(&mut prune_options()));
            }
        }
    }
    Ok(())
}

fn is_dirty(worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(worktree_path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(!statuses.is_empty())
}

#[async_trait]
impl WorkspaceProvider for GitWorkspaces {
    async fn create(
        &self,
        name: Option<&str>,
        branch: Option<&str>,
        base_branch: Option<&str>,
    ) -> Result<WorkspaceHandle> {
        let suffix = short_suffix();
        let name = name
            .map(String::from)
            .unwrap_or_else(|| format!("worktree-{}", suffix));
        let branch = branch
            .map(String::from)
            .unwrap_or_else(|| format!("branch-{}", suffix));
        let base_branch = base_branch.unwrap_or(&self.default_branch).to_string();
        let path = self.worktrees_dir.join(&name);

        if path.exists() {
            return Err(Error::Validation(format!(
                "Worktree path already exists: {}",
                path.display()
            )));
        }

        let repo_path = self.repo_path.clone();
        let worktrees_dir = self.worktrees_dir.clone();
        let (n, b, base, p) = (name.clone(), branch.clone(), base_branch.clone(), path.clone());
        blocking(move || {
            std::fs::create_dir_all(&worktrees_dir)?;
            create_worktree(&repo_path, &n, &b, &base, &p)
        })
        .await?;

        let now = Utc::now();
        let record = WorkspaceRecord {
            name,
            path,
            branch,
            base_repo: self.repo_path.clone(),
            base_branch,
            created_at: now,
            last_accessed: now,
        };
        self.store.save(&record).await?;
        info!(name = %record.name, branch = %record.branch, "Workspace created");
        Ok(handle_of(&record))
    }

    async fn get(&self, name: &str) -> Result<Option<WorkspaceHandle>> {
        match self.store.load::<WorkspaceRecord>(name).await? {
            Some(record) => Ok(Some(handle_of(&self.touch(record).await?))),
            None => Ok(None),
        }
    }

    async fn remove(&self, handle: &WorkspaceHandle, force: bool) -> Result<bool> {
        if !force && self.exists(handle).await && self.has_uncommitted_changes(handle).await? {
            warn!(name = %handle.name, "Workspace has uncommitted changes, not removing");
            return Ok(false);
        }

        let repo_path = self.repo_path.clone();
        let name = handle.name.clone();
        let path = handle.path.clone();
        blocking(move || remove_worktree(&repo_path, &name, &path)).await?;
        self.store.remove::<WorkspaceRecord>(&handle.name).await?;
        info!(name = %handle.name, force, "Workspace removed");
        Ok(true)
    }

    async fn exists(&self, handle: &WorkspaceHandle) -> bool {
        handle.path.exists()
    }

    async fn is_valid_repo(&self, handle: &WorkspaceHandle) -> bool {
        let path = handle.path.clone();
        blocking(move || Ok(Repository::open(&path).is_ok()))
            .await
            .unwrap_or(false)
    }

    async fn has_uncommitted_changes(&self, handle: &WorkspaceHandle) -> Result<bool> {
        let path = handle.path.clone();
        blocking(move || is_dirty(&path)).await
    }

    async fn list(&self) -> Result<Vec<WorkspaceHandle>> {
        let records: Vec<WorkspaceRecord> = self.store.load_all().await?;
        Ok(records.iter().map(handle_of).collect())
    }

    async fn list_stale(&self, max_age: Duration) -> Result<Vec<WorkspaceHandle>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::Validation(format!("invalid max age: {}", e)))?;
        let cutoff = Utc::now() - max_age;
        let records: Vec<WorkspaceRecord> = self.store.load_all().await?;
        Ok(records
            .iter()
            .filter(|r| r.last_accessed < cutoff)
            .map(handle_of)
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        let repo_path = self.repo_path.clone();
        blocking(move || {
            Repository::discover(&repo_path)?;
            Ok(())
        })
        .await
    }
}
