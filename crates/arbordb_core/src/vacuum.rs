//! Reachability sweep (vacuum).
//!
//! Vacuum removes objects that can no longer be reached from the root,
//! together with their blob chunks. It works from metadata only:
//!
//! 1. **Gather**: page through every object on a few connections at once,
//!    keeping `{oid, is_resource, parent_oid, owner_oid}` per object.
//! 2. **Sweep**: flag resources whose parent is missing, null or Trash, and
//!    sub-values whose owner is missing or Trash. Flagged oids are deleted
//!    in batches, blob chunks first.
//! 3. **Fixpoint**: removing a parent only orphans its children in the
//!    next pass, so passes repeat over the shrinking index until one
//!    removes nothing.
//!
//! A failed batch aborts the run. Classification depends only on what is
//! persisted, so a run can always be repeated from scratch.

use crate::config::VacuumOptions;
use crate::error::CoreResult;
use arbordb_storage::{Connection, ObjectMeta, Oid, StorageBackend};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata of every gathered object, by oid.
pub type MetadataIndex = HashMap<Oid, ObjectMeta>;

/// Outcome of a vacuum run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VacuumReport {
    /// Objects seen by the gather phase.
    pub gathered: u64,
    /// Objects removed (or that would be, in dry-run).
    pub removed: u64,
    /// Sweep passes, the final empty one included.
    pub passes: u32,
    /// Whether deletes were skipped.
    pub dry_run: bool,
}

impl VacuumReport {
    /// Returns true if the run removed (or would remove) anything.
    #[must_use]
    pub fn removed_any(&self) -> bool {
        self.removed > 0
    }
}

/// Garbage collector over a storage backend.
pub struct Vacuum {
    backend: Arc<dyn StorageBackend>,
    options: VacuumOptions,
}

impl Vacuum {
    /// Creates a vacuum for `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>, options: VacuumOptions) -> Self {
        Self { backend, options }
    }

    /// Returns the options.
    #[must_use]
    pub fn options(&self) -> &VacuumOptions {
        &self.options
    }

    /// Runs gather and sweep to a fixed point.
    ///
    /// # Errors
    ///
    /// Any backend error aborts the run. Connections are released first.
    pub async fn run(&self) -> CoreResult<VacuumReport> {
        let mut index = self.gather().await?;
        let gathered = index.len() as u64;
        info!(gathered, dry_run = self.options.dry_run, "vacuum gathered metadata");

        let conn = self.backend.open().await?;
        let swept = self.sweep(&conn, &mut index).await;
        self.backend.close(conn).await?;
        let (removed, passes) = swept?;

        info!(removed, passes, dry_run = self.options.dry_run, "vacuum finished");
        Ok(VacuumReport {
            gathered,
            removed,
            passes,
            dry_run: self.options.dry_run,
        })
    }

    /// Loads the metadata of every object.
    pub async fn gather(&self) -> CoreResult<MetadataIndex> {
        let count = self.options.connections.clamp(1, self.backend.pool().size().max(1));
        let page_size = self.options.page_size.max(1);

        let mut conns = Vec::with_capacity(count);
        let mut opened = Ok(());
        for _ in 0..count {
            match self.backend.open().await {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    opened = Err(e);
                    break;
                }
            }
        }

        let result = match opened {
            Ok(()) => self.gather_pages(&conns, page_size).await,
            Err(e) => Err(e.into()),
        };

        for conn in conns {
            if let Err(e) = self.backend.close(conn).await {
                warn!(error = %e, "closing gather connection failed");
            }
        }
        result
    }

    async fn gather_pages(&self, conns: &[Connection], page_size: usize) -> CoreResult<MetadataIndex> {
        let mut index = MetadataIndex::new();
        let stride = conns.len();

        for round in 0.. {
            let pages = try_join_all(conns.iter().enumerate().map(|(slot, conn)| {
                let offset = (round * stride + slot) * page_size;
                self.backend
                    .get_page_of_object_metadata(conn, offset, page_size)
            }))
            .await?;

            let rows: usize = pages.iter().map(Vec::len).sum();
            if rows == 0 {
                break;
            }
            index.extend(pages.into_iter().flatten().map(|meta| (meta.oid, meta)));
            debug!(round, rows, total = index.len(), "gathered metadata pages");
        }

        Ok(index)
    }

    async fn sweep(&self, conn: &Connection, index: &mut MetadataIndex) -> CoreResult<(u64, u32)> {
        let batch_size = self.options.batch_size.max(1);
        let mut removed = 0u64;
        let mut passes = 0u32;

        loop {
            passes += 1;
            let removable = classify(index);
            if removable.is_empty() {
                break;
            }

            for batch in removable.chunks(batch_size) {
                self.flush(conn, batch).await?;
            }

            removed += removable.len() as u64;
            for oid in &removable {
                index.remove(oid);
            }
            info!(pass = passes, removed = removable.len(), "vacuum pass finished");
        }

        Ok((removed, passes))
    }

    async fn flush(&self, conn: &Connection, batch: &[Oid]) -> CoreResult<()> {
        if self.options.dry_run {
            debug!(objects = batch.len(), "dry run, batch not deleted");
            return Ok(());
        }
        let chunks = self.backend.delete_blobs_of_objects(conn, batch).await?;
        let objects = self.backend.delete_objects(conn, batch).await?;
        debug!(objects, chunks, "flushed vacuum batch");
        Ok(())
    }
}

/// Oids in `index` that are unreachable, sorted.
#[must_use]
pub fn classify(index: &MetadataIndex) -> Vec<Oid> {
    let mut removable: Vec<Oid> = index
        .values()
        .filter(|meta| is_removable(meta, index))
        .map(|meta| meta.oid)
        .collect();
    removable.sort();
    removable
}

fn is_removable(meta: &ObjectMeta, index: &MetadataIndex) -> bool {
    if meta.oid.is_reserved() {
        return false;
    }
    let anchor = if meta.is_resource {
        meta.parent_oid
    } else {
        meta.owner_oid
    };
    match anchor {
        None => true,
        Some(oid) => oid == Oid::TRASH || !index.contains_key(&oid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(oid: Oid, parent: Option<Oid>) -> ObjectMeta {
        ObjectMeta {
            oid,
            is_resource: true,
            parent_oid: parent,
            owner_oid: None,
        }
    }

    fn sub_value(oid: Oid, owner: Oid) -> ObjectMeta {
        ObjectMeta {
            oid,
            is_resource: false,
            parent_oid: None,
            owner_oid: Some(owner),
        }
    }

    fn index_of(metas: Vec<ObjectMeta>) -> MetadataIndex {
        metas.into_iter().map(|m| (m.oid, m)).collect()
    }

    #[test]
    fn root_is_never_removable() {
        let index = index_of(vec![resource(Oid::ROOT, None)]);
        assert!(classify(&index).is_empty());
    }

    #[test]
    fn reachable_objects_stay() {
        let a = Oid::new();
        let note = Oid::new();
        let index = index_of(vec![
            resource(Oid::ROOT, None),
            resource(a, Some(Oid::ROOT)),
            sub_value(note, a),
        ]);
        assert!(classify(&index).is_empty());
    }

    #[test]
    fn orphans_and_trash_are_removable() {
        let orphan = Oid::new();
        let trashed = Oid::new();
        let parentless = Oid::new();
        let dangling_note = Oid::new();
        let trashed_note = Oid::new();
        let index = index_of(vec![
            resource(Oid::ROOT, None),
            resource(orphan, Some(Oid::new())),
            resource(trashed, Some(Oid::TRASH)),
            resource(parentless, None),
            sub_value(dangling_note, Oid::new()),
            sub_value(trashed_note, Oid::TRASH),
        ]);

        let mut expected = vec![orphan, trashed, parentless, dangling_note, trashed_note];
        expected.sort();
        assert_eq!(classify(&index), expected);
    }

    #[test]
    fn children_of_removable_wait_for_next_pass() {
        let a = Oid::new();
        let b = Oid::new();
        let mut index = index_of(vec![
            resource(Oid::ROOT, None),
            resource(a, Some(Oid::new())),
            resource(b, Some(a)),
        ]);

        assert_eq!(classify(&index), vec![a]);
        index.remove(&a);
        assert_eq!(classify(&index), vec![b]);
    }

    mod run {
        use super::*;
        use arbordb_storage::{InMemoryBackend, ObjectWrite, Tid};
        use bytes::Bytes;

        async fn put(backend: &InMemoryBackend, write: ObjectWrite) {
            backend.put_record(write.into_record(Tid::new(1))).await.unwrap();
        }

        /// Root <- A <- B <- C, with A pointing at a parent that does not exist.
        async fn broken_chain() -> Arc<InMemoryBackend> {
            let backend = Arc::new(InMemoryBackend::new());
            let a = Oid::new();
            let b = Oid::new();
            let c = Oid::new();
            put(&backend, ObjectWrite::resource(a, Oid::new(), "a", "Folder", Bytes::new())).await;
            put(&backend, ObjectWrite::resource(b, a, "b", "Folder", Bytes::new())).await;
            put(&backend, ObjectWrite::resource(c, b, "c", "Folder", Bytes::new())).await;
            backend
        }

        fn options() -> VacuumOptions {
            VacuumOptions::new().page_size(2).connections(3).batch_size(1)
        }

        #[tokio::test]
        async fn removes_chain_in_successive_passes() {
            let backend = broken_chain().await;
            let vacuum = Vacuum::new(Arc::clone(&backend) as Arc<dyn StorageBackend>, options());

            let report = vacuum.run().await.unwrap();
            assert_eq!(report.gathered, 4);
            assert_eq!(report.removed, 3);
            assert_eq!(report.passes, 4);
            assert_eq!(backend.object_count(), 1);
            assert_eq!(backend.pool().in_use(), 0);

            let again = vacuum.run().await.unwrap();
            assert_eq!(again.removed, 0);
            assert_eq!(again.passes, 1);
        }

        #[tokio::test]
        async fn dry_run_counts_without_deleting() {
            let backend = broken_chain().await;
            let dry = Vacuum::new(
                Arc::clone(&backend) as Arc<dyn StorageBackend>,
                options().dry_run(true),
            )
            .run()
            .await
            .unwrap();
            assert!(dry.dry_run);
            assert_eq!(backend.object_count(), 4);

            let live = Vacuum::new(Arc::clone(&backend) as Arc<dyn StorageBackend>, options())
                .run()
                .await
                .unwrap();
            assert_eq!(dry.removed, live.removed);
            assert_eq!(dry.passes, live.passes);
        }

        #[tokio::test]
        async fn chunks_of_removed_objects_go_too() {
            let backend = Arc::new(InMemoryBackend::new());
            let orphan = Oid::new();
            put(&backend, ObjectWrite::resource(orphan, Oid::TRASH, "x", "File", Bytes::new())).await;

            let conn = backend.open().await.unwrap();
            backend.start_transaction(&conn).await.unwrap();
            backend
                .write_blob_chunk(&conn, arbordb_storage::BlobId::new(), orphan, 0, Bytes::from_static(b"data"))
                .await
                .unwrap();
            backend.get_next_tid(&conn).await.unwrap();
            backend.commit(&conn).await.unwrap();
            backend.close(conn).await.unwrap();
            assert_eq!(backend.chunk_count(), 1);

            let report = Vacuum::new(Arc::clone(&backend) as Arc<dyn StorageBackend>, VacuumOptions::default())
                .run()
                .await
                .unwrap();
            assert_eq!(report.removed, 1);
            assert_eq!(backend.chunk_count(), 0);
        }
    }

    mod fixpoint {
        use super::*;
        use proptest::prelude::*;
        use proptest::sample::Index;

        fn sweep_all(index: &mut MetadataIndex) -> Vec<Oid> {
            let mut removed = Vec::new();
            loop {
                let pass = classify(index);
                if pass.is_empty() {
                    return removed;
                }
                for oid in &pass {
                    index.remove(oid);
                }
                removed.extend(pass);
            }
        }

        proptest! {
            /// Cutting one node off a random tree removes exactly its subtree.
            #[test]
            fn removes_exactly_the_detached_subtree(
                links in prop::collection::vec(any::<Index>(), 1..40),
                cut in any::<Index>(),
            ) {
                // Node 0 is the root; node i hangs under an earlier node.
                let count = links.len() + 1;
                let parent_of: Vec<usize> = std::iter::once(0)
                    .chain(links.iter().enumerate().map(|(i, link)| link.index(i + 1)))
                    .collect();
                let oids: Vec<Oid> = std::iter::once(Oid::ROOT)
                    .chain((1..count).map(|_| Oid::new()))
                    .collect();
                let cut = cut.index(count - 1) + 1;

                let mut index = index_of(vec![resource(Oid::ROOT, None)]);
                for node in 1..count {
                    let parent = if node == cut { Oid::new() } else { oids[parent_of[node]] };
                    index.insert(oids[node], resource(oids[node], Some(parent)));
                }

                let mut expected: Vec<Oid> = (1..count)
                    .filter(|&node| {
                        let mut at = node;
                        while at != 0 {
                            if at == cut {
                                return true;
                            }
                            at = parent_of[at];
                        }
                        false
                    })
                    .map(|node| oids[node])
                    .collect();
                expected.sort();

                let mut removed = sweep_all(&mut index);
                removed.sort();
                prop_assert_eq!(removed, expected);
                prop_assert!(index.contains_key(&Oid::ROOT));
            }
        }
    }

    #[test]
    fn report_flags_removals() {
        assert!(!VacuumReport::default().removed_any());
        assert!(VacuumReport {
            removed: 2,
            ..VacuumReport::default()
        }
        .removed_any());
    }
}
