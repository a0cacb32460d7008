//! An in-memory [`RawStream`], [`PersistenceAdapter`], and
//! [`TempStreamFactory`].

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use fnv::FnvHashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::StageResult;
use crate::persistence::{PersistenceAdapter, StreamKind, TempStreamFactory};
use crate::serialization::RawStream;

/// A stream backed by row-group chunks kept as [`Bytes`], so replaying the
/// same in-memory stream to several independent readers (the multi-source
/// merger's per-feeder passes over the affected-keys stream, in
/// particular) is a refcount bump per chunk rather than a byte copy.
#[derive(Default, Clone)]
pub struct MemoryStream {
    chunks: Vec<Bytes>,
}

#[async_trait]
impl RawStream for MemoryStream {
    async fn append_chunk(&mut self, bytes: Vec<u8>) -> StageResult<()> {
        self.chunks.push(Bytes::from(bytes));
        Ok(())
    }

    async fn read_chunks(&self) -> StageResult<BoxStream<'static, StageResult<Vec<u8>>>> {
        let chunks = self.chunks.clone();
        Ok(stream::iter(chunks.into_iter().map(|chunk| Ok(chunk.to_vec()))).boxed())
    }

    async fn truncate(&mut self) -> StageResult<()> {
        self.chunks.clear();
        Ok(())
    }

    fn len_chunks(&self) -> usize {
        self.chunks.len()
    }
}

/// Allocates [`MemoryStream`]s; labels are discarded immediately (nothing
/// to diagnose in memory).
#[derive(Default)]
pub struct MemoryTempStreamFactory;

impl TempStreamFactory for MemoryTempStreamFactory {
    fn create(&self, _label: &str) -> Box<dyn RawStream> {
        Box::new(MemoryStream::default())
    }
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct ObjectKey {
    name: String,
    kind_tag: u8,
    version: u64,
}

fn kind_tag(kind: StreamKind) -> u8 {
    match kind {
        StreamKind::Content => 0,
        StreamKind::KeyMappings => 1,
        StreamKind::Update => 2,
    }
}

/// An in-memory [`PersistenceAdapter`] keyed by `(name, kind, version)`.
/// Useful for tests and for exercising a `Stage` end-to-end without a real
/// blob store.
#[derive(Default)]
pub struct MemoryPersistence {
    objects: Mutex<FnvHashMap<ObjectKey, Vec<Bytes>>>,
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
    async fn open_read(
        &self,
        name: &str,
        kind: StreamKind,
        version: u64,
    ) -> StageResult<Box<dyn RawStream>> {
        let key = ObjectKey { name: name.to_string(), kind_tag: kind_tag(kind), version };
        let chunks = self
            .objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(MemoryStream { chunks }))
    }

    async fn upload(
        &self,
        name: &str,
        kind: StreamKind,
        version: u64,
        stream: Box<dyn RawStream>,
        _cancel: &CancellationToken,
    ) -> StageResult<()> {
        let key = ObjectKey { name: name.to_string(), kind_tag: kind_tag(kind), version };
        let mut chunks_stream = stream.read_chunks().await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = chunks_stream.next().await {
            chunks.push(chunk?);
        }
        let mut objects = self.objects.lock().unwrap();
        if chunks.is_empty() {
            objects.remove(&key);
        } else {
            objects.insert(key, chunks);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_version_reads_empty() {
        let adapter = MemoryPersistence::default();
        let stream = adapter.open_read("words", StreamKind::Content, 0).await.unwrap();
        assert_eq!(stream.len_chunks(), 0);
    }

    #[tokio::test]
    async fn upload_then_read_round_trips() {
        let adapter = MemoryPersistence::default();
        let mut stream = MemoryStream::default();
        stream.append_chunk(vec![1, 2, 3]).await.unwrap();
        let cancel = CancellationToken::new();
        adapter
            .upload("words", StreamKind::Content, 1, Box::new(stream), &cancel)
            .await
            .unwrap();
        let read_back = adapter.open_read("words", StreamKind::Content, 1).await.unwrap();
        assert_eq!(read_back.len_chunks(), 1);
    }

    #[tokio::test]
    async fn empty_upload_deletes_existing_object() {
        let adapter = MemoryPersistence::default();
        let cancel = CancellationToken::new();
        let mut stream = MemoryStream::default();
        stream.append_chunk(vec![9]).await.unwrap();
        adapter
            .upload("words", StreamKind::Content, 1, Box::new(stream), &cancel)
            .await
            .unwrap();
        adapter
            .upload("words", StreamKind::Content, 1, Box::new(MemoryStream::default()), &cancel)
            .await
            .unwrap();
        let read_back = adapter.open_read("words", StreamKind::Content, 1).await.unwrap();
        assert_eq!(read_back.len_chunks(), 0);
    }
}
