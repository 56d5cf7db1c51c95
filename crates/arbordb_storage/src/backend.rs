//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};
use crate::pool::{Connection, ConnectionPool};
use crate::types::{BlobId, ObjectMeta, ObjectRecord, ObjectWrite, Oid, Tid};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;

/// A transactional object store.
///
/// Backends persist object records and blob chunks and arbitrate commits.
/// They never interpret serialized state.
///
/// # Connections and transactions
///
/// Every call goes through a [`Connection`] checked out with [`open`] and
/// returned with [`close`]. A backend transaction is scoped to one
/// connection: [`start_transaction`] opens it, [`store`], [`delete`],
/// [`write_blob_chunk`] and [`del_blob`] stage changes in it, and
/// [`commit`] publishes every staged change at once. Nothing staged is
/// visible to other connections before that.
///
/// # Commit protocol
///
/// 1. [`get_next_tid`] enters the commit window (one committer at a time)
///    and reserves the tid this connection will publish under.
/// 2. [`store`] checks each write against the persisted serial and stages
///    it stamped with the reserved tid.
/// 3. [`get_conflicts`] reports what was committed since the transaction
///    started.
/// 4. [`commit`] publishes and leaves the commit window; [`abort`] discards
///    and leaves it.
///
/// A reserved tid that is never published is never observed anywhere, so
/// tids only ever name committed transactions.
///
/// # Invariants
///
/// - A record's serial changes if and only if a committed transaction changed it
/// - Deleting an object deletes its blob chunks in the same commit
/// - Chunk indices of a blob are contiguous from 0
///
/// All methods except [`read_blob_chunks`] are required.
///
/// [`open`]: StorageBackend::open
/// [`close`]: StorageBackend::close
/// [`start_transaction`]: StorageBackend::start_transaction
/// [`store`]: StorageBackend::store
/// [`delete`]: StorageBackend::delete
/// [`write_blob_chunk`]: StorageBackend::write_blob_chunk
/// [`del_blob`]: StorageBackend::del_blob
/// [`commit`]: StorageBackend::commit
/// [`abort`]: StorageBackend::abort
/// [`get_next_tid`]: StorageBackend::get_next_tid
/// [`get_conflicts`]: StorageBackend::get_conflicts
/// [`read_blob_chunks`]: StorageBackend::read_blob_chunks
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Registered name of this backend.
    fn name(&self) -> &str;

    /// The pool connections are drawn from.
    fn pool(&self) -> &ConnectionPool;

    // === Connections ===

    /// Checks out a connection, suspending while the pool is exhausted.
    async fn open(&self) -> StorageResult<Connection>;

    /// Returns a connection, discarding any transaction still open on it.
    ///
    /// A connection that is dropped instead still frees its pool slot; its
    /// id shows up in [`ConnectionPool::take_released`], and the backend
    /// must discard that connection's state from there.
    async fn close(&self, conn: Connection) -> StorageResult<()>;

    // === Transactions ===

    /// Opens a backend transaction on `conn` and returns the current tid.
    async fn start_transaction(&self, conn: &Connection) -> StorageResult<Tid>;

    /// Enters the commit window and reserves the tid `conn` will publish under.
    ///
    /// Calling it again on the same transaction returns the same tid.
    async fn get_next_tid(&self, conn: &Connection) -> StorageResult<Tid>;

    /// Returns the tid of the last published transaction.
    async fn get_current_tid(&self, conn: &Connection) -> StorageResult<Tid>;

    /// Oids written or deleted by transactions published after `since`.
    async fn get_conflicts(&self, conn: &Connection, since: Tid) -> StorageResult<HashSet<Oid>>;

    /// Publishes everything staged on `conn` and returns its tid.
    async fn commit(&self, conn: &Connection) -> StorageResult<Tid>;

    /// Discards everything staged on `conn`.
    async fn abort(&self, conn: &Connection) -> StorageResult<()>;

    // === Objects ===

    /// Loads an object.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the object does not exist.
    async fn load(&self, conn: &Connection, oid: Oid) -> StorageResult<ObjectRecord>;

    /// Stages a write and returns the serial it will carry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConflictDetected`] if the persisted serial of
    /// `oid` is not `expected_serial` (`None` meaning "must not exist").
    async fn store(
        &self,
        conn: &Connection,
        oid: Oid,
        expected_serial: Option<Tid>,
        write: &ObjectWrite,
    ) -> StorageResult<Tid>;

    /// Stages deletion of an object together with its blob chunks.
    async fn delete(&self, conn: &Connection, oid: Oid) -> StorageResult<()>;

    // === Containers ===

    /// Returns the resource named `name` under `parent`.
    async fn get_child(
        &self,
        conn: &Connection,
        parent: Oid,
        name: &str,
    ) -> StorageResult<Option<ObjectRecord>>;

    /// Returns true if `parent` has a child named `name`.
    async fn has_key(&self, conn: &Connection, parent: Oid, name: &str) -> StorageResult<bool>;

    /// Number of children of `parent`.
    async fn len(&self, conn: &Connection, parent: Oid) -> StorageResult<usize>;

    /// Names of all children of `parent`, sorted.
    async fn keys(&self, conn: &Connection, parent: Oid) -> StorageResult<Vec<String>>;

    /// All children of `parent`, sorted by name.
    async fn items(&self, conn: &Connection, parent: Oid) -> StorageResult<Vec<ObjectRecord>>;

    /// One page of child names. Pages are numbered from 1.
    async fn get_page_of_keys(
        &self,
        conn: &Connection,
        parent: Oid,
        page: usize,
        page_size: usize,
    ) -> StorageResult<Vec<String>>;

    // === Annotations ===

    /// Returns the sub-value named `name` owned by `owner`.
    async fn get_annotation(
        &self,
        conn: &Connection,
        owner: Oid,
        name: &str,
    ) -> StorageResult<Option<ObjectRecord>>;

    /// Names of all sub-values owned by `owner`, sorted.
    async fn get_annotation_keys(&self, conn: &Connection, owner: Oid)
        -> StorageResult<Vec<String>>;

    // === Reporting ===

    /// Number of stored objects, the root included.
    async fn get_total_number_of_objects(&self, conn: &Connection) -> StorageResult<u64>;

    /// Number of stored resources.
    async fn get_total_number_of_resources(&self, conn: &Connection) -> StorageResult<u64>;

    /// Number of resources of the given type.
    async fn get_total_resources_of_type(
        &self,
        conn: &Connection,
        type_name: &str,
    ) -> StorageResult<u64>;

    /// One page of resources of the given type, ordered by oid. Pages are numbered from 1.
    async fn get_page_of_resources_of_type(
        &self,
        conn: &Connection,
        type_name: &str,
        page: usize,
        page_size: usize,
    ) -> StorageResult<Vec<ObjectRecord>>;

    // === Blobs ===

    /// Stages one chunk of a blob owned by `oid`.
    async fn write_blob_chunk(
        &self,
        conn: &Connection,
        blob_id: BlobId,
        oid: Oid,
        chunk_index: u32,
        data: Bytes,
    ) -> StorageResult<()>;

    /// Reads one chunk.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::BlobChunkNotFound`] past the last chunk.
    async fn read_blob_chunk(
        &self,
        conn: &Connection,
        blob_id: BlobId,
        chunk_index: u32,
    ) -> StorageResult<Bytes>;

    /// Lazily reads every chunk of a blob in index order.
    ///
    /// The stream ends at the first missing index. Each call starts over
    /// from chunk 0.
    fn read_blob_chunks<'a>(
        &'a self,
        conn: &'a Connection,
        blob_id: BlobId,
    ) -> BoxStream<'a, StorageResult<Bytes>> {
        stream::unfold(Some(0u32), move |next| async move {
            let index = next?;
            match self.read_blob_chunk(conn, blob_id, index).await {
                Ok(data) => Some((Ok(data), Some(index + 1))),
                Err(StorageError::BlobChunkNotFound { .. }) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// Stages deletion of every chunk of a blob.
    async fn del_blob(&self, conn: &Connection, blob_id: BlobId) -> StorageResult<()>;

    // === Maintenance ===

    /// Identity and placement of up to `limit` objects starting at `offset`,
    /// ordered by oid.
    async fn get_page_of_object_metadata(
        &self,
        conn: &Connection,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<ObjectMeta>>;

    /// Immediately deletes every blob chunk owned by one of `oids`.
    ///
    /// Returns the number of chunks removed.
    async fn delete_blobs_of_objects(&self, conn: &Connection, oids: &[Oid]) -> StorageResult<u64>;

    /// Immediately deletes the given objects.
    ///
    /// Returns the number of objects removed.
    async fn delete_objects(&self, conn: &Connection, oids: &[Oid]) -> StorageResult<u64>;
}
