//! Connection handling across the transaction lifecycle.

use arbordb_core::{EngineConfig, ExecutionContext, TransactionState};
use arbordb_storage::{BackendConfig, Oid};
use arbordb_testkit::prelude::*;
use bytes::Bytes;
use std::time::Duration;

fn store_with_pool(size: usize) -> TestStore {
    TestStore::with_config(
        &BackendConfig::memory()
            .pool_size(size)
            .acquire_timeout(None),
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn double_abort_is_harmless() {
    let store = TestStore::memory();
    let manager = store.manager();
    let ctx = ExecutionContext::new();

    let txn = manager.begin(&ctx).await.unwrap();
    txn.add(folder(Oid::ROOT, "never")).unwrap();
    manager.abort(&ctx).await;
    manager.abort(&ctx).await;
    manager.abort_txn(&txn).await;

    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(!txn.holds_connection());
    assert!(ctx.transaction().is_none());
    assert_eq!(manager.stats().aborted(), 1);
    assert_eq!(store.connections_in_use(), 0);
    assert_eq!(store.backend.object_count(), 1);
}

#[tokio::test]
async fn exhausted_pool_suspends_until_release() {
    let store = store_with_pool(2);
    let manager = store.manager().clone();

    let first = ExecutionContext::new();
    let second = ExecutionContext::new();
    manager.begin(&first).await.unwrap();
    manager.begin(&second).await.unwrap();
    assert_eq!(store.connections_in_use(), 2);

    let third = ExecutionContext::new();
    let waiting = {
        let manager = manager.clone();
        let third = third.clone();
        tokio::spawn(async move { manager.begin(&third).await.map(|txn| txn.id()) })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    manager.abort(&first).await;
    let id = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("third transaction never got a connection")
        .unwrap()
        .unwrap();
    assert_eq!(third.transaction().unwrap().id(), id);
    assert_eq!(store.connections_in_use(), 2);

    manager.abort(&second).await;
    manager.abort(&third).await;
    assert_eq!(store.connections_in_use(), 0);
}

#[tokio::test]
async fn cancelled_commit_still_finishes() {
    let store = TestStore::memory();
    let manager = store.manager().clone();
    let ctx = ExecutionContext::new();

    let txn = manager.begin(&ctx).await.unwrap();
    let oid = Oid::new();
    txn.add(folder_at(oid, Oid::ROOT, "survives")).unwrap();

    // The caller gives up right after the commit started.
    let mut commit = Box::pin(manager.commit(&ctx));
    assert!(futures::poll!(commit.as_mut()).is_pending());
    drop(commit);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !txn.state().is_terminal() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("commit never finished");

    assert_eq!(txn.state(), TransactionState::Committed);
    assert!(store.backend.record(oid).is_some());
    assert_eq!(store.connections_in_use(), 0);
}

#[tokio::test]
async fn cancelled_conflicting_commit_aborts_cleanly() {
    let store = TestStore::memory();
    let shared = store.add_folder(Oid::ROOT, "shared").await;
    let manager = store.manager().clone();

    let winner = ExecutionContext::new();
    let loser = ExecutionContext::new();
    let t1 = manager.begin(&winner).await.unwrap();
    let t2 = manager.begin(&loser).await.unwrap();

    let record = t1.get(shared).await.unwrap();
    t1.update(record.to_write().with_state(Bytes::from_static(b"one")))
        .await
        .unwrap();
    let record = t2.get(shared).await.unwrap();
    t2.update(record.to_write().with_state(Bytes::from_static(b"two")))
        .await
        .unwrap();
    let fresh = Oid::new();
    t2.add(folder_at(fresh, Oid::ROOT, "fresh")).unwrap();
    manager.commit(&winner).await.unwrap();

    let mut commit = Box::pin(manager.commit(&loser));
    assert!(futures::poll!(commit.as_mut()).is_pending());
    drop(commit);

    tokio::time::timeout(Duration::from_secs(5), async {
        while t2.holds_connection() || manager.stats().conflicts() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("commit never finished");

    assert_eq!(t2.state(), TransactionState::Aborted);
    assert_eq!(store.connections_in_use(), 0);
    assert!(store.backend.record(fresh).is_none());
    assert_eq!(
        store.backend.record(shared).unwrap().state,
        Bytes::from_static(b"one")
    );
    assert_eq!(manager.stats().conflicts(), 1);
}

#[tokio::test]
async fn dropped_transaction_does_not_pin_history() {
    let store = TestStore::memory();
    let manager = store.manager().clone();

    {
        let ctx = ExecutionContext::new();
        let txn = manager.begin(&ctx).await.unwrap();
        txn.add(folder(Oid::ROOT, "abandoned")).unwrap();
    }

    for i in 0..20 {
        store.add_folder(Oid::ROOT, &format!("f{i}")).await;
    }

    assert_eq!(store.connections_in_use(), 0);
    assert_eq!(store.backend.session_count(), 0);
    assert_eq!(store.backend.commit_log_len(), 0);
    assert_eq!(store.children(Oid::ROOT).await.len(), 20);
}

#[tokio::test]
async fn cancelled_abort_still_releases() {
    let store = TestStore::memory();
    let manager = store.manager().clone();
    let ctx = ExecutionContext::new();

    let txn = manager.begin(&ctx).await.unwrap();
    let mut abort = Box::pin(manager.abort(&ctx));
    assert!(futures::poll!(abort.as_mut()).is_pending());
    drop(abort);

    tokio::time::timeout(Duration::from_secs(5), async {
        while txn.holds_connection() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("abort never finished");

    assert_eq!(txn.state(), TransactionState::Aborted);
    assert_eq!(store.connections_in_use(), 0);
}

#[tokio::test]
async fn one_transaction_per_context() {
    let store = TestStore::memory();
    let manager = store.manager();
    let ctx = ExecutionContext::with_principal("editor");

    let txn = manager.begin(&ctx).await.unwrap();
    assert_eq!(txn.principal(), Some("editor"));
    assert!(manager.begin(&ctx).await.is_err());

    manager.commit(&ctx).await.unwrap();
    let next = manager.begin(&ctx).await.unwrap();
    assert_ne!(next.id(), txn.id());
    manager.abort(&ctx).await;
    assert_eq!(store.connections_in_use(), 0);
}
