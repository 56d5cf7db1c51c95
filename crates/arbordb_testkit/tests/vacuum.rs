//! Garbage collection of unreachable objects.

use arbordb_core::{ExecutionContext, VacuumOptions};
use arbordb_storage::{ObjectWrite, Oid};
use arbordb_testkit::prelude::*;
use bytes::Bytes;

fn small_pages() -> VacuumOptions {
    VacuumOptions::new().page_size(3).connections(2).batch_size(2)
}

#[tokio::test]
async fn detached_chain_is_collected_to_fixpoint() {
    let store = TestStore::memory();
    let chain = store.add_chain(3).await;
    let survivor = store.add_folder(Oid::ROOT, "survivor").await;
    store.set_parent(chain[0], Some(Oid::new())).await;

    let report = store.vacuum_with(small_pages()).await.unwrap();
    assert_eq!(report.gathered, 5);
    assert_eq!(report.removed, 3);
    assert_eq!(report.passes, 4);
    for oid in &chain {
        assert!(store.backend.record(*oid).is_none());
    }
    assert!(store.backend.record(survivor).is_some());
    assert_eq!(store.connections_in_use(), 0);

    let again = store.vacuum_with(small_pages()).await.unwrap();
    assert_eq!(again.removed, 0);
    assert_eq!(again.passes, 1);
}

#[tokio::test]
async fn trash_and_orphaned_annotations_are_collected() {
    let store = TestStore::memory();
    let trashed = store.add_folder(Oid::ROOT, "trashed").await;
    let kept = store.add_folder(Oid::ROOT, "kept").await;
    let manager = store.manager();

    let ctx = ExecutionContext::new();
    let txn = manager.begin(&ctx).await.unwrap();
    let note = Oid::new();
    let kept_note = Oid::new();
    txn.add(ObjectWrite::sub_value(note, trashed, "note", "Annotation", Bytes::new()))
        .unwrap();
    txn.add(ObjectWrite::sub_value(kept_note, kept, "note", "Annotation", Bytes::new()))
        .unwrap();
    let mut writer = txn.blob_writer(trashed);
    writer.write(b"payload").await.unwrap();
    writer.finish().await.unwrap();
    manager.commit(&ctx).await.unwrap();

    store.set_parent(trashed, Some(Oid::TRASH)).await;
    let report = store.vacuum().await.unwrap();

    assert_eq!(report.removed, 2);
    assert_eq!(report.passes, 3);
    assert!(store.backend.record(note).is_none());
    assert!(store.backend.record(kept_note).is_some());
    assert_eq!(store.backend.chunk_count(), 0);
}

#[tokio::test]
async fn dry_run_reports_the_same_work() {
    let store = TestStore::memory();
    let chain = store.add_chain(4).await;
    store.set_parent(chain[1], None).await;
    let before = store.backend.object_count();

    let dry = store
        .vacuum_with(small_pages().dry_run(true))
        .await
        .unwrap();
    assert!(dry.dry_run);
    assert_eq!(store.backend.object_count(), before);

    let live = store.vacuum_with(small_pages()).await.unwrap();
    assert_eq!(dry.removed, live.removed);
    assert_eq!(dry.passes, live.passes);
    assert_eq!(dry.gathered, live.gathered);
    assert_eq!(live.removed, 3);
    assert_eq!(store.backend.object_count(), before - 3);
}

#[tokio::test]
async fn file_store_vacuum_persists() {
    let store = TestStore::file();
    let orphan = store.add_folder(Oid::ROOT, "orphan").await;
    store.set_parent(orphan, Some(Oid::new())).await;

    let report = store.vacuum().await.unwrap();
    assert_eq!(report.removed, 1);

    let reopened = arbordb_storage::InMemoryBackend::open_file(
        &arbordb_storage::BackendConfig::file(store.path().unwrap()),
    )
    .unwrap();
    assert_eq!(reopened.object_count(), 1);
}
