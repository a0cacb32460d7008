//! Serialization façade (`spec.md` §4.1).
//!
//! An abstract reader/writer over row-group-paginated streams. The façade
//! itself does not enforce sort order — that is the external merge-sorter's
//! job (`crate::sort`). Two layers are split apart deliberately, mirroring
//! how `differential-dataflow` separates its `Batcher`/`Builder` traits from
//! the concrete container types they push into:
//!
//! - [`RawStream`]: an opaque, append-only sequence of byte chunks
//!   ("row groups"), supplied by a [`crate::persistence::PersistenceAdapter`]
//!   or a temp-stream factory (§6). Out of scope here: what actually backs
//!   it (local file, blob store, in-memory buffer).
//! - [`RecordSerializer`]: turns a row group's bytes into `Vec<T>` and back.
//!   The concrete columnar format (Parquet, MessagePack, ...) is out of
//!   scope per §1; [`BincodeSerializer`] is the reference implementation
//!   used by this crate's own tests and the in-memory storage backend.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StageError, StageResult};

/// Default row group size, per §4.1.
pub const DEFAULT_ROWS_PER_GROUP: usize = 100_000;

/// An opaque, append-only sequence of row-group-sized byte chunks.
///
/// Implementors provide seekable, read-write, truncatable storage; the
/// façade only ever appends chunks during a write pass and replays them in
/// order during a read pass. [`crate::storage::memory::MemoryStream`] is the
/// reference implementation.
#[async_trait]
pub trait RawStream: Send + Sync {
    /// Appends one row-group's encoded bytes.
    async fn append_chunk(&mut self, bytes: Vec<u8>) -> StageResult<()>;

    /// Replays all chunks written so far, in append order. Returns an
    /// empty stream when nothing has been written, matching §4.1's "returns
    /// empty sequence when stream length is zero."
    async fn read_chunks(&self) -> StageResult<BoxStream<'static, StageResult<Vec<u8>>>>;

    /// Discards all chunks and repositions the stream to empty. Used when a
    /// production is abandoned (cancellation) so the next attempt starts
    /// clean.
    async fn truncate(&mut self) -> StageResult<()>;

    /// Number of chunks written so far.
    fn len_chunks(&self) -> usize;
}

/// Encodes/decodes one row group's worth of `T` to/from bytes.
pub trait RecordSerializer<T>: Send + Sync {
    /// Encodes a batch (one row group).
    fn encode_batch(&self, batch: &[T]) -> StageResult<Vec<u8>>;
    /// Decodes a batch previously produced by [`Self::encode_batch`].
    fn decode_batch(&self, bytes: &[u8]) -> StageResult<Vec<T>>;
}

/// Reads every row of `T` out of `raw`, lazily, one row group at a time:
/// the next chunk is only decoded once the previous one's rows have been
/// consumed.
pub async fn read<T: Send + Sync + 'static>(
    raw: &dyn RawStream,
    serializer: Arc<dyn RecordSerializer<T>>,
) -> StageResult<BoxStream<'static, StageResult<T>>> {
    let chunks = raw.read_chunks().await?;
    let rows = chunks.flat_map(move |chunk| {
        let decoded = match chunk {
            Ok(bytes) => match serializer.decode_batch(&bytes) {
                Ok(rows) => rows.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            },
            Err(e) => vec![Err(e)],
        };
        stream::iter(decoded)
    });
    Ok(rows.boxed())
}

/// Write endpoint over a [`RawStream`]: `Add` appends one row group,
/// `Finish` closes the writer. Mirrors the `TraceWriter`/`Builder` split in
/// `differential-dataflow`'s `operators::arrange::writer`, simplified to a
/// single append-only sink.
pub struct Writer<'a, T> {
    raw: &'a mut dyn RawStream,
    serializer: &'a (dyn RecordSerializer<T> + 'static),
}

impl<'a, T> Writer<'a, T> {
    /// Wraps a raw stream and a serializer for `T`.
    pub fn new(raw: &'a mut dyn RawStream, serializer: &'a (dyn RecordSerializer<T> + 'static)) -> Self {
        Writer { raw, serializer }
    }

    /// Appends one row group.
    pub async fn add(&mut self, batch: &[T]) -> StageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let bytes = self.serializer.encode_batch(batch)?;
        self.raw.append_chunk(bytes).await
    }

    /// Closes the writer. A no-op for the in-memory backend, but present so
    /// backends that buffer (e.g. a real Parquet writer) have a place to
    /// flush their footer.
    pub async fn finish(self) -> StageResult<()> {
        Ok(())
    }
}

/// Buffers rows up to `rows_per_group` and writes them to a [`Writer`] as
/// whole row groups, so executors that produce an already-sorted stream of
/// output rows don't need to re-derive this chunking themselves.
pub struct BatchedWriter<'a, T> {
    writer: Writer<'a, T>,
    rows_per_group: usize,
    buffer: Vec<T>,
}

impl<'a, T> BatchedWriter<'a, T> {
    /// Wraps `writer`, batching up to `rows_per_group` rows per append.
    pub fn new(writer: Writer<'a, T>, rows_per_group: usize) -> Self {
        BatchedWriter { writer, rows_per_group, buffer: Vec::new() }
    }

    /// Buffers one row, flushing a full row group if the buffer is at
    /// capacity.
    pub async fn push(&mut self, row: T) -> StageResult<()> {
        self.buffer.push(row);
        if self.buffer.len() >= self.rows_per_group {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> StageResult<()> {
        if !self.buffer.is_empty() {
            self.writer.add(&self.buffer).await?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Flushes any remaining buffered rows and closes the underlying
    /// writer.
    pub async fn finish(mut self) -> StageResult<()> {
        self.flush().await?;
        self.writer.finish().await
    }
}

/// Reference [`RecordSerializer`] built on `serde` + `bincode`.
///
/// Named in `SPEC_FULL.md` as the crate's "at least two implementations are
/// envisaged" placeholder alongside a columnar format nobody here
/// implements; this one exists purely so the crate is testable without an
/// external dependency on an actual columnar library.
pub struct BincodeSerializer;

impl<T: Serialize + DeserializeOwned + Send + Sync> RecordSerializer<T> for BincodeSerializer {
    fn encode_batch(&self, batch: &[T]) -> StageResult<Vec<u8>> {
        bincode::serialize(batch).map_err(|e| StageError::Serialization(Box::new(e)))
    }

    fn decode_batch(&self, bytes: &[u8]) -> StageResult<Vec<T>> {
        bincode::deserialize(bytes).map_err(|e| StageError::Serialization(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStream;

    #[tokio::test]
    async fn round_trips_through_bincode_and_memory_stream() {
        let serializer: Arc<dyn RecordSerializer<i32>> = Arc::new(BincodeSerializer);
        let mut raw = MemoryStream::default();
        {
            let mut writer = Writer::new(&mut raw, serializer.as_ref());
            writer.add(&[1i32, 2, 3]).await.unwrap();
            writer.add(&[4, 5]).await.unwrap();
            writer.finish().await.unwrap();
        }
        let mut out = read(&raw, serializer.clone()).await.unwrap();
        let mut values = Vec::new();
        while let Some(v) = out.next().await {
            values.push(v.unwrap());
        }
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn empty_stream_reads_empty() {
        let serializer: Arc<dyn RecordSerializer<i32>> = Arc::new(BincodeSerializer);
        let raw = MemoryStream::default();
        let mut out = read::<i32>(&raw, serializer).await.unwrap();
        assert!(out.next().await.is_none());
    }
}
