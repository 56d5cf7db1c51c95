//! Chunked blob transfer.
//!
//! A blob is stored as a sequence of fixed-size chunks next to, not inside,
//! the record of the object that owns it. Writing goes through a
//! [`BlobWriter`], which buffers arbitrary input into chunks of
//! [`EngineConfig::blob_chunk_size`](crate::EngineConfig::blob_chunk_size)
//! bytes and returns a [`Blob`] descriptor. Reading concatenates the chunks
//! in index order.
//!
//! [`BlobWriter::finish`] leaves the descriptor to the caller, who keeps it
//! in the owner's state. [`BlobWriter::finish_attached`] records it on the
//! owner instead, as an annotation holding the descriptor as JSON, where
//! [`Blob::attached`] finds it again.
//!
//! ```rust,ignore
//! let mut writer = txn.blob_writer(file_oid);
//! writer.write(&payload).await?;
//! writer.finish_attached("file").await?;
//!
//! let blob = Blob::attached(&txn, file_oid, "file").await?.unwrap();
//! assert_eq!(blob.read_all(&txn).await?, payload);
//! ```

use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use arbordb_storage::{BlobId, ObjectRecord, ObjectWrite, Oid};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Type name of annotations that hold a [`Blob`] descriptor.
pub const BLOB_ANNOTATION_TYPE: &str = "Blob";

/// Descriptor of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Identity of the chunk sequence.
    pub blob_id: BlobId,
    /// Object the blob belongs to.
    pub owning_oid: Oid,
    /// Number of chunks, `ceil(total_size / chunk_size)`.
    pub chunk_count: u32,
    /// Length of the content in bytes.
    pub total_size: u64,
}

impl Blob {
    /// Looks up the descriptor recorded on `owner` under `name` by
    /// [`BlobWriter::finish_attached`].
    ///
    /// Only committed annotations are found.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the annotation does not
    /// hold a blob descriptor.
    pub async fn attached(txn: &Transaction, owner: Oid, name: &str) -> CoreResult<Option<Blob>> {
        match txn.get_annotation(owner, name).await? {
            Some(record) => Self::from_record(&record).map(Some),
            None => Ok(None),
        }
    }

    fn from_record(record: &ObjectRecord) -> CoreResult<Blob> {
        if record.type_name != BLOB_ANNOTATION_TYPE {
            return Err(CoreError::invalid_operation(format!(
                "annotation {} of {} is a {}, not a blob",
                record.name.as_deref().unwrap_or_default(),
                record.oid,
                record.type_name
            )));
        }
        serde_json::from_slice(&record.state)
            .map_err(|e| CoreError::invalid_operation(format!("malformed blob descriptor: {e}")))
    }

    fn to_state(&self) -> CoreResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CoreError::internal(format!("encoding blob descriptor: {e}")))
    }

    /// Lazily reads the chunks in index order.
    ///
    /// Nothing is fetched until the stream is polled; every call starts
    /// over from the first chunk.
    pub fn read<'a>(&self, txn: &'a Transaction) -> BoxStream<'a, CoreResult<Bytes>> {
        let blob_id = self.blob_id;
        let count = self.chunk_count;
        stream::unfold(0u32, move |index| async move {
            if index >= count {
                return None;
            }
            let chunk = txn.read_blob_chunk(blob_id, index).await;
            Some((chunk, index + 1))
        })
        .boxed()
    }

    /// Reads the whole content.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BlobNotFound`] if a chunk is missing.
    pub async fn read_all(&self, txn: &Transaction) -> CoreResult<Bytes> {
        let capacity = usize::try_from(self.total_size).unwrap_or(0);
        let buffer = self
            .read(txn)
            .try_fold(BytesMut::with_capacity(capacity), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        Ok(buffer.freeze())
    }

    /// Stages deletion of every chunk.
    pub async fn delete(&self, txn: &Transaction) -> CoreResult<()> {
        txn.del_blob(self.blob_id).await
    }
}

/// Streams content into fixed-size chunks.
///
/// Chunks are handed to the backend as soon as they fill up; only the last
/// partial chunk is written by [`finish`](BlobWriter::finish). Dropping the
/// writer without finishing leaves the written chunks staged in the
/// transaction.
pub struct BlobWriter<'a> {
    txn: &'a Transaction,
    blob_id: BlobId,
    owning_oid: Oid,
    chunk_size: usize,
    buffer: BytesMut,
    next_index: u32,
    total_size: u64,
}

impl<'a> BlobWriter<'a> {
    pub(crate) fn new(txn: &'a Transaction, owning_oid: Oid) -> Self {
        let chunk_size = txn.blob_chunk_size().max(1);
        Self {
            txn,
            blob_id: BlobId::new(),
            owning_oid,
            chunk_size,
            buffer: BytesMut::with_capacity(chunk_size),
            next_index: 0,
            total_size: 0,
        }
    }

    /// Id of the blob being written.
    #[must_use]
    pub fn blob_id(&self) -> BlobId {
        self.blob_id
    }

    /// Appends bytes.
    pub async fn write(&mut self, mut data: &[u8]) -> CoreResult<()> {
        self.total_size += data.len() as u64;
        while !data.is_empty() {
            let room = self.chunk_size - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == self.chunk_size {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    /// Appends every item of a byte stream.
    pub async fn write_stream<S>(&mut self, mut input: S) -> CoreResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        while let Some(bytes) = input.next().await {
            self.write(&bytes?).await?;
        }
        Ok(())
    }

    /// Appends everything `reader` yields until end of file.
    pub async fn write_reader<R>(&mut self, mut reader: R) -> CoreResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut scratch = vec![0u8; self.chunk_size.min(64 * 1024)];
        loop {
            let read = reader.read(&mut scratch).await?;
            if read == 0 {
                return Ok(());
            }
            self.write(&scratch[..read]).await?;
        }
    }

    /// Writes the last partial chunk and returns the descriptor.
    pub async fn finish(mut self) -> CoreResult<Blob> {
        if !self.buffer.is_empty() {
            self.flush_chunk().await?;
        }
        Ok(Blob {
            blob_id: self.blob_id,
            owning_oid: self.owning_oid,
            chunk_count: self.next_index,
            total_size: self.total_size,
        })
    }

    /// Finishes the blob and records its descriptor on the owner as the
    /// annotation `name`.
    ///
    /// A blob previously recorded under the same name is replaced and its
    /// chunks are deleted with this transaction.
    pub async fn finish_attached(self, name: &str) -> CoreResult<Blob> {
        let txn = self.txn;
        let owner = self.owning_oid;
        let blob = self.finish().await?;
        let state = blob.to_state()?;

        match txn.get_annotation(owner, name).await? {
            Some(existing) => {
                if let Ok(previous) = Blob::from_record(&existing) {
                    if previous.blob_id != blob.blob_id {
                        previous.delete(txn).await?;
                    }
                }
                let mut write = existing.to_write().with_state(state);
                write.type_name = BLOB_ANNOTATION_TYPE.to_string();
                txn.update(write).await?;
            }
            None => txn.add(ObjectWrite::sub_value(
                Oid::new(),
                owner,
                name,
                BLOB_ANNOTATION_TYPE,
                state,
            ))?,
        }
        Ok(blob)
    }

    async fn flush_chunk(&mut self) -> CoreResult<()> {
        let chunk = self.buffer.split().freeze();
        let index = self.next_index;
        self.next_index = index
            .checked_add(1)
            .ok_or_else(|| CoreError::invalid_operation("blob has too many chunks"))?;
        self.txn
            .write_blob_chunk(self.blob_id, self.owning_oid, index, chunk)
            .await
    }
}
