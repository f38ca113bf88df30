//! Session lifecycle integration tests.
//!
//! These tests verify write-through persistence to the JSON store, lazy
//! reloading and the execute-once guard.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor::core::{Metadata, NewTask, SessionStatus, TaskStatus};
use arbor::orchestration::SessionManager;
use arbor::store::{JsonStore, SessionRecord, Store, StoreExt};
use serde_json::json;
use tempfile::TempDir;

use crate::fixtures::{test_config, OrchestratorHarness, Script, ScriptedExecutor};

/// Test: Persisted sessions round-trip
/// Given a session with dependent tasks executed against a JSON store
/// When a fresh manager reloads it from disk
/// Then statuses, counts and dependency sets are identical
#[tokio::test]
async fn test_session_roundtrip_through_json_store() {
    let state = TempDir::new().unwrap();
    let h = OrchestratorHarness::new(
        ScriptedExecutor::new().on("do b", Script::Fail("nope".into())),
        test_config(2),
    );
    let worker = h
        .orchestrator
        .create_worker(Default::default())
        .await
        .unwrap();

    let store: Arc<dyn Store> = Arc::new(JsonStore::new(state.path()));
    let sessions = SessionManager::new(store.clone());
    let mut metadata = Metadata::new();
    metadata.insert("ticket".into(), json!("ARB-7"));
    let session = sessions
        .create_session("roundtrip", Some("persist me"), metadata)
        .await
        .unwrap();

    let mut context = BTreeMap::new();
    context.insert("file".to_string(), json!("src/lib.rs"));
    let a = sessions
        .add_task(&session.id, NewTask::new("a", "do a").context(context))
        .await
        .unwrap()
        .unwrap();
    let b = sessions
        .add_task(&session.id, NewTask::new("b", "do b").priority(5))
        .await
        .unwrap()
        .unwrap();
    let c = sessions
        .add_task(
            &session.id,
            NewTask::new("c", "do c").depends_on([a.id, b.id]),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(sessions.add_worker(&session.id, &worker).await.unwrap());
    assert!(sessions.execute_session(&session.id, vec![worker], 1).await);
    let live = sessions.get_session(&session.id).await.unwrap().unwrap();

    let reloaded_manager = SessionManager::new(Arc::new(JsonStore::new(state.path())));
    let reloaded = reloaded_manager
        .get_session(&session.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reloaded, live);
    assert_eq!(reloaded.counts(), live.counts());
    assert_eq!(reloaded.status, SessionStatus::Completed);
    assert_eq!(reloaded.task(&c.id).unwrap().dependencies, live.task(&c.id).unwrap().dependencies);
    assert_eq!(reloaded.task(&a.id).unwrap().status, TaskStatus::Completed);
    assert_eq!(reloaded.task(&b.id).unwrap().status, TaskStatus::Failed);
    assert_eq!(reloaded.task(&c.id).unwrap().status, TaskStatus::Failed);
    assert_eq!(reloaded.metadata["ticket"], json!("ARB-7"));

    let record: SessionRecord = store.load(&session.id.to_string()).await.unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.name, "roundtrip");
    assert!(record.completed_at.is_some());
}

/// Test: Re-executing a completed session is a no-op
/// Given a session that already ran to completion
/// When it is executed again
/// Then the call returns false and no task is touched
#[tokio::test]
async fn test_execute_completed_session_is_idempotent() {
    let h = OrchestratorHarness::new(ScriptedExecutor::new(), test_config(1));
    let worker = h
        .orchestrator
        .create_worker(Default::default())
        .await
        .unwrap();
    let sessions = h.orchestrator.sessions();
    let session = sessions
        .create_session("once", None, Metadata::new())
        .await
        .unwrap();
    sessions
        .add_task(&session.id, NewTask::new("a", "do a"))
        .await
        .unwrap();

    assert!(sessions.execute_session(&session.id, vec![worker.clone()], 1).await);
    let first = sessions.get_session(&session.id).await.unwrap().unwrap();

    assert!(!sessions.execute_session(&session.id, vec![worker], 1).await);
    let second = sessions.get_session(&session.id).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(h.executor.call_count("do a"), 1);
}

/// Test: Pause blocks and resume re-enables execution
/// Given a paused session
/// When it is executed, resumed, then executed again
/// Then only the second execution runs
#[tokio::test]
async fn test_pause_and_resume() {
    let h = OrchestratorHarness::new(ScriptedExecutor::new(), test_config(1));
    let worker = h
        .orchestrator
        .create_worker(Default::default())
        .await
        .unwrap();
    let sessions = h.orchestrator.sessions();
    let session = sessions
        .create_session("pausable", None, Metadata::new())
        .await
        .unwrap();
    sessions
        .add_task(&session.id, NewTask::new("a", "do a"))
        .await
        .unwrap();

    assert!(sessions.pause(&session.id).await.unwrap());
    assert!(!sessions
        .execute_session(&session.id, vec![worker.clone()], 1)
        .await);
    assert!(h.executor.calls().is_empty());

    let record: SessionRecord = h
        .store
        .load(&session.id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SessionStatus::Paused);

    assert!(sessions.resume(&session.id).await.unwrap());
    assert!(sessions.execute_session(&session.id, vec![worker], 1).await);
    assert_eq!(h.executor.call_count("do a"), 1);

    assert!(!sessions.pause(&session.id).await.unwrap());
    assert!(!sessions.resume(&session.id).await.unwrap());
}

/// Test: Status snapshot reflects live counts
/// Given a session with two tasks and one worker association
/// When its status is read before and after execution
/// Then counts move from pending to terminal and nothing else mutates
#[tokio::test]
async fn test_status_snapshot() {
    let h = OrchestratorHarness::new(ScriptedExecutor::new(), test_config(1));
    let worker = h
        .orchestrator
        .create_worker(Default::default())
        .await
        .unwrap();
    let sessions = h.orchestrator.sessions();
    let session = sessions
        .create_session("snap", Some("status"), Metadata::new())
        .await
        .unwrap();
    sessions
        .add_task(&session.id, NewTask::new("a", "do a"))
        .await
        .unwrap();
    sessions
        .add_task(&session.id, NewTask::new("b", "do b"))
        .await
        .unwrap();
    sessions.add_worker(&session.id, &worker).await.unwrap();

    let before = sessions
        .get_session_status(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.task_counts.pending, 2);
    assert_eq!(before.total_tasks, 2);
    assert_eq!(before.workers, 1);
    assert_eq!(before.status, SessionStatus::Active);
    let again = sessions
        .get_session_status(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.updated_at, again.updated_at);

    assert!(sessions.execute_session(&session.id, vec![worker], 1).await);
    let after = sessions
        .get_session_status(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.task_counts.completed, 2);
    assert_eq!(after.task_counts.pending, 0);
    assert_eq!(after.status, SessionStatus::Completed);
}
