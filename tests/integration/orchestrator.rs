//! Orchestration facade integration tests.
//!
//! These tests run the orchestrator against a real git repository, with
//! workers bound to git worktrees and state kept in the JSON store.

use std::time::Duration;

use arbor::core::SessionStatus;
use arbor::orchestration::{TaskSpec, WorkerOptions};
use arbor::store::{Store, StoreExt, WorkerRecord, WorkspaceRecord};
use arbor::worker::WorkerStatus;
use arbor::workspace::WorkspaceProvider;
use arbor::Error;

use crate::fixtures::{test_config, GitHarness, ScriptedExecutor};

/// Test: Workers get real worktrees
/// Given an orchestrator over a git repository
/// When a named worker is created
/// Then its worktree exists on its own branch and both records are stored
#[tokio::test]
async fn test_create_worker_creates_worktree() {
    let h = GitHarness::new(ScriptedExecutor::new());
    let orchestrator = h.orchestrator(test_config(2));

    let worker = orchestrator
        .create_worker(WorkerOptions {
            name: Some("feature-one".into()),
            branch: Some("arbor/feature-one".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let workspace = worker.workspace();
    assert!(workspace.path.join("README.md").exists());
    assert!(h.repo.branch_exists("arbor/feature-one"));
    assert_eq!(worker.status(), WorkerStatus::Idle);

    let store = h.store();
    let record: WorkerRecord = store
        .load(&worker.id().to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.workspace_name, "feature-one");
    let ws: WorkspaceRecord = store.load("feature-one").await.unwrap().unwrap();
    assert_eq!(ws.branch, "arbor/feature-one");
    assert_eq!(ws.path, workspace.path);
}

/// Test: Pool capacity is a hard cap
/// Given max_concurrent_instances=2
/// When a third worker is requested
/// Then creation fails with PoolFull and no extra worktree appears
#[tokio::test]
async fn test_pool_capacity() {
    let h = GitHarness::new(ScriptedExecutor::new());
    let orchestrator = h.orchestrator(test_config(2));

    orchestrator.create_worker(WorkerOptions::default()).await.unwrap();
    orchestrator.create_worker(WorkerOptions::default()).await.unwrap();
    let err = orchestrator
        .create_worker(WorkerOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PoolFull { max: 2 }));
    let store = h.store();
    let workspaces = h.workspaces(store.clone());
    assert_eq!(workspaces.list().await.unwrap().len(), 2);
}

/// Test: Parallel batch over worktrees
/// Given three tasks where the third depends on the first two
/// When they run in parallel
/// Then every task completes and each worker ran inside its worktree
#[tokio::test]
async fn test_run_parallel_tasks_over_worktrees() {
    let h = GitHarness::new(ScriptedExecutor::new());
    let orchestrator = h.orchestrator(test_config(3));
    let specs = vec![
        TaskSpec::new("lint", "run the linter"),
        TaskSpec::new("test", "run the tests"),
        TaskSpec::new("report", "summarise").depends_on(&["lint", "test"]),
    ];

    let report = orchestrator
        .run_parallel_tasks(specs, Some("ci"), Some(2))
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.workers_used, 2);
    let status = report.status.unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
    assert_eq!(status.task_counts.completed, 3);
    assert_eq!(h.executor.calls().last().map(String::as_str), Some("summarise"));

    let infos = orchestrator.list_workers().await;
    assert_eq!(infos.len(), 2);
    for info in infos {
        assert!(info.path.starts_with(h.trees_dir.path()));
        assert_eq!(info.status, WorkerStatus::Active);
        assert!(!info.has_changes);
    }

    let health = orchestrator.health_check().await;
    assert!(health.healthy, "{:?}", health);
}

/// Test: Worker listing sees uncommitted work
/// Given a worker whose worktree gains an untracked file
/// When workers are listed
/// Then the worker reports changes
#[tokio::test]
async fn test_list_workers_reports_changes() {
    let h = GitHarness::new(ScriptedExecutor::new());
    let orchestrator = h.orchestrator(test_config(1));
    let worker = orchestrator
        .create_worker(WorkerOptions::default())
        .await
        .unwrap();

    std::fs::write(worker.workspace().path.join("notes.txt"), "wip").unwrap();

    let infos = orchestrator.list_workers().await;
    assert_eq!(infos.len(), 1);
    assert!(infos[0].has_changes);
    assert_eq!(infos[0].branch, worker.workspace().branch);
}

/// Test: Removing a worker removes its worktree
/// Given a started worker with uncommitted changes
/// When it is removed with its workspace
/// Then the worktree is force-removed and every record is gone
#[tokio::test]
async fn test_remove_worker_with_workspace() {
    let h = GitHarness::new(ScriptedExecutor::new());
    let orchestrator = h.orchestrator(test_config(1));
    let worker = orchestrator
        .create_worker(WorkerOptions::default())
        .await
        .unwrap();
    assert!(worker.start().await.unwrap());
    let path = worker.workspace().path.clone();
    std::fs::write(path.join("scratch.txt"), "dirty").unwrap();

    assert!(orchestrator.remove_worker(&worker.id(), true).await.unwrap());

    assert!(!path.exists());
    assert_eq!(worker.status(), WorkerStatus::Stopped);
    let store = h.store();
    assert!(store
        .load::<WorkerRecord>(&worker.id().to_string())
        .await
        .unwrap()
        .is_none());
    assert!(store
        .load::<WorkspaceRecord>(&worker.workspace().name)
        .await
        .unwrap()
        .is_none());
    assert!(orchestrator.list_workers().await.is_empty());
}

/// Test: Cleanup sweeps stale workers and clean worktrees
/// Given one idle worker and one orphaned dirty worktree
/// When cleanup runs with a zero age threshold
/// Then the worker and its clean worktree go, the dirty one stays
#[tokio::test]
async fn test_cleanup_sweeps_stale() {
    let h = GitHarness::new(ScriptedExecutor::new());
    let orchestrator = h.orchestrator(test_config(2));
    let worker = orchestrator
        .create_worker(WorkerOptions::default())
        .await
        .unwrap();
    let worker_path = worker.workspace().path.clone();

    let store = h.store();
    let workspaces = h.workspaces(store.clone());
    let dirty = workspaces.create(Some("keep-me"), None, None).await.unwrap();
    std::fs::write(dirty.path.join("unsaved.txt"), "important").unwrap();

    let report = orchestrator.cleanup(Duration::ZERO).await.unwrap();

    assert_eq!(report.workers_removed, 1);
    assert_eq!(report.workspaces_removed, 1);
    assert!(!worker_path.exists());
    assert!(dirty.path.exists());
    assert!(orchestrator.list_workers().await.is_empty());
    let remaining = workspaces.list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "keep-me");
}

/// Test: Health check flags a missing worktree
/// Given a worker whose worktree directory was deleted out from under it
/// When health is checked
/// Then the report is unhealthy and names the workspace issue
#[tokio::test]
async fn test_health_check_missing_worktree() {
    let h = GitHarness::new(ScriptedExecutor::new());
    let orchestrator = h.orchestrator(test_config(1));
    let worker = orchestrator
        .create_worker(WorkerOptions::default())
        .await
        .unwrap();

    std::fs::remove_dir_all(&worker.workspace().path).unwrap();

    let health = orchestrator.health_check().await;
    assert!(!health.healthy);
    assert!(health.store.healthy);
    assert!(health.workspaces.healthy);
    let issues = &health.workers[&worker.id()].issues;
    assert!(issues.contains(&"Workspace directory does not exist".to_string()));

    assert!(matches!(worker.start().await, Err(Error::WorkspaceMissing(_))));
}
