//! SyncCoordinator tests: push/pull passes, retry, single-flight mutual
//! exclusion, auth suspension, and backoff deferral.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::MockTransport;
use waveline_sync::error::{TransportError, TransportErrorKind};
use waveline_sync::sync::UpsertOutcome;
use waveline_sync::{RemoteRecord, Scope, SyncCoordinator, WriteOptions};

fn opts(id: &str, timestamp: i64) -> WriteOptions {
    WriteOptions {
        id: Some(id.to_string()),
        timestamp: Some(timestamp),
    }
}

fn comment(episode: &str, content: &str) -> serde_json::Value {
    json!({"episode_id": episode, "user_id": "u-1", "content": content})
}

fn remote(id: &str, episode: &str, updated_at: i64) -> RemoteRecord {
    RemoteRecord {
        id: id.to_string(),
        data: comment(episode, "from remote"),
        created_at: updated_at,
        updated_at,
        deleted: false,
    }
}

#[tokio::test]
async fn push_clears_dirty_rows_and_sets_synced_at() {
    let store = common::open_store();
    let transport = Arc::new(MockTransport::new());
    let coordinator = SyncCoordinator::new(Arc::clone(&store), transport.clone());

    store
        .insert_local("comments", comment("ep-1", "hi"), &opts("c-1", 100))
        .unwrap();

    let outcome = coordinator.push(&Scope::new("comments", "ep-1")).await;
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);
    assert_eq!(outcome.pushed, 1);
    assert_eq!(transport.push_calls().len(), 1);

    let rec = store.get("comments", "c-1").unwrap().unwrap();
    assert!(!rec.needs_sync);
    assert!(rec.sync_metadata_consistent());
}

#[tokio::test]
async fn failed_push_keeps_row_dirty_and_next_batch_retries_it() {
    let store = common::open_store();
    let transport = Arc::new(MockTransport::new());
    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = Arc::clone(&attempts);
        transport.on_push(move |_, records| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TransportError::network("connection refused"))
            } else {
                Ok(records
                    .iter()
                    .map(|r| UpsertOutcome {
                        id: r.id.clone(),
                        accepted: true,
                        error: None,
                    })
                    .collect())
            }
        });
    }
    let coordinator = SyncCoordinator::new(Arc::clone(&store), transport.clone());
    let scope = Scope::new("comments", "ep-1");

    store
        .insert_local("comments", comment("ep-1", "x"), &opts("c-x", 100))
        .unwrap();

    let first = coordinator.push(&scope).await;
    assert_eq!(first.pushed, 0);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].kind, TransportErrorKind::Network);
    assert!(store.get("comments", "c-x").unwrap().unwrap().needs_sync);

    let second = coordinator.push(&scope).await;
    assert!(second.is_ok());
    assert_eq!(second.pushed, 1);

    let calls = transport.push_calls();
    assert_eq!(calls.len(), 2);
    assert!(
        calls[1].records.iter().any(|r| r.id == "c-x"),
        "the failed row must appear in the very next push batch"
    );
}

#[tokio::test]
async fn concurrent_mutations_coalesce_into_one_batch_upload() {
    let store = common::open_store();
    let transport = Arc::new(MockTransport::new());
    let coordinator = Arc::new(SyncCoordinator::new(Arc::clone(&store), transport.clone()));
    let repo = waveline_sync::Repository::new(
        Arc::clone(&store),
        Arc::clone(&coordinator),
        "comments",
    )
    .unwrap();

    for i in 0..10 {
        repo.create(comment("ep-1", &format!("comment {i}"))).unwrap();
    }

    // Wait for the debounced push to drain the dirty set.
    for _ in 0..200 {
        if store.dirty_records("comments", Some("ep-1")).unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
    }

    let calls = transport.push_calls();
    assert_eq!(calls.len(), 1, "exactly one batch upload");
    assert_eq!(calls[0].records.len(), 10, "all 10 dirty rows in the batch");
    assert!(store
        .dirty_records("comments", Some("ep-1"))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn concurrent_pulls_share_one_network_call() {
    let store = common::open_store();
    let transport = Arc::new(MockTransport::new().gated_list());
    let coordinator = Arc::new(SyncCoordinator::new(Arc::clone(&store), transport.clone()));
    let scope = Scope::new("comments", "ep-1");

    let first = {
        let coordinator = Arc::clone(&coordinator);
        let scope = scope.clone();
        tokio::spawn(async move { coordinator.pull(&scope).await })
    };
    tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;

    let second = {
        let coordinator = Arc::clone(&coordinator);
        let scope = scope.clone();
        tokio::spawn(async move { coordinator.pull(&scope).await })
    };
    tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    transport.release_list(2);

    let o1 = first.await.unwrap();
    let o2 = second.await.unwrap();
    assert!(o1.is_ok() && o2.is_ok());
    assert_eq!(
        transport.list_calls().len(),
        1,
        "the second caller must await the in-flight pull, not duplicate it"
    );
}

#[tokio::test]
async fn pull_merges_and_advances_cursor_forward_only() {
    let store = common::open_store();
    let transport = Arc::new(MockTransport::new());
    transport.on_list(|_, _, since| {
        Ok([remote("c-1", "ep-1", 100), remote("c-2", "ep-1", 200)]
            .into_iter()
            .filter(|r| r.updated_at > since)
            .collect())
    });
    let coordinator = SyncCoordinator::new(Arc::clone(&store), transport.clone());
    let scope = Scope::new("comments", "ep-1");

    let outcome = coordinator.pull(&scope).await;
    assert_eq!(outcome.pulled, 2);
    assert_eq!(store.cursor("comments", "ep-1").unwrap(), 200);

    // Second pull starts from the advanced cursor and finds nothing new.
    let outcome = coordinator.pull(&scope).await;
    assert_eq!(outcome.pulled, 0);
    let calls = transport.list_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].since, 200);
    assert_eq!(store.cursor("comments", "ep-1").unwrap(), 200);
}

#[tokio::test]
async fn auth_failure_suspends_the_scope_until_credentials_refresh() {
    let store = common::open_store();
    let transport = Arc::new(MockTransport::new());
    transport.on_list(|_, _, _| Err(TransportError::auth("token expired")));
    let coordinator = SyncCoordinator::new(Arc::clone(&store), transport.clone());
    let scope = Scope::new("comments", "ep-1");

    let outcome = coordinator.pull(&scope).await;
    assert_eq!(outcome.errors[0].kind, TransportErrorKind::Auth);
    assert!(coordinator.status().is_suspended(&scope));

    // While suspended, no network call is made.
    let outcome = coordinator.pull(&scope).await;
    assert_eq!(outcome.errors[0].kind, TransportErrorKind::Auth);
    assert_eq!(transport.list_calls().len(), 1);

    transport.on_list(|_, _, _| Ok(Vec::new()));
    coordinator.credentials_refreshed();
    let outcome = coordinator.pull(&scope).await;
    assert!(outcome.is_ok());
    assert_eq!(transport.list_calls().len(), 2);
}

#[tokio::test]
async fn scheduled_push_defers_during_backoff_but_explicit_push_runs() {
    let store = common::open_store();
    let transport = Arc::new(MockTransport::new());
    transport.on_push(|_, _| Err(TransportError::network("offline")));
    let coordinator = SyncCoordinator::new(Arc::clone(&store), transport.clone());
    let scope = Scope::new("comments", "ep-1");

    store
        .insert_local("comments", comment("ep-1", "x"), &opts("c-1", 100))
        .unwrap();

    let outcome = coordinator.push(&scope).await;
    assert!(!outcome.is_ok());

    // The failure put the scope in a backoff window.
    assert!(coordinator.schedule_push(&scope).await.is_none());
    assert_eq!(transport.push_calls().len(), 1);

    // A user-initiated push bypasses backoff.
    let outcome = coordinator.push(&scope).await;
    assert!(!outcome.is_ok());
    assert_eq!(transport.push_calls().len(), 2);
}

#[tokio::test]
async fn status_board_broadcasts_scope_transitions() {
    let store = common::open_store();
    let transport = Arc::new(MockTransport::new());
    let coordinator = SyncCoordinator::new(Arc::clone(&store), transport);
    let scope = Scope::new("comments", "ep-1");

    let mut watch = coordinator.status().watch();
    store
        .insert_local("comments", comment("ep-1", "x"), &opts("c-1", 100))
        .unwrap();
    coordinator.push(&scope).await;

    let mut phases = Vec::new();
    while let Ok(event) = watch.try_recv() {
        assert_eq!(event.scope, scope);
        phases.push(event.status.phase);
    }
    use waveline_sync::sync::ScopePhase;
    assert!(phases.contains(&ScopePhase::Pushing));
    assert_eq!(phases.last(), Some(&ScopePhase::Idle));
}

#[tokio::test]
async fn sync_all_covers_every_dirty_scope() {
    let store = common::open_store();
    let transport = Arc::new(MockTransport::new());
    let coordinator = SyncCoordinator::new(Arc::clone(&store), transport.clone());

    store
        .insert_local("comments", comment("ep-1", "a"), &opts("c-1", 100))
        .unwrap();
    store
        .insert_local("comments", comment("ep-2", "b"), &opts("c-2", 100))
        .unwrap();
    store
        .insert_local("profiles", json!({"display_name": "Ada"}), &opts("u-1", 100))
        .unwrap();

    let results = coordinator.sync_all().await;
    let pushed: usize = results.values().map(|o| o.pushed).sum();
    assert_eq!(pushed, 3);
    assert!(results.contains_key(&Scope::new("comments", "ep-1")));
    assert!(results.contains_key(&Scope::new("comments", "ep-2")));
    assert!(results.contains_key(&Scope::unscoped("profiles")));
    assert!(store.dirty_records("comments", None).unwrap().is_empty());
}
