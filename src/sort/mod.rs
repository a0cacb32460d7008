//! External merge-sorter (`spec.md` §4.2).
//!
//! Buffers up to `rows_per_group * groups_per_batch` records, sorts each
//! overflow batch in memory, and flushes it to a temporary stream. On
//! [`ExternalSorter::read`], a k-way merge runs across every flushed batch
//! using the supplied [`Comparator`]. This is the same shape as
//! `differential-dataflow`'s `MergeBatcher` (`trace::implementations::merge_batcher`):
//! a chunker that consolidates incoming data into sorted runs, and a merge
//! step that combines runs — simplified here because a stage's records
//! carry no time/diff dimension to consolidate away, only a sort key.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};

use crate::cursor::Cursor;
use crate::error::StageResult;
use crate::order::Comparator;
use crate::persistence::TempStreamFactory;
use crate::serialization::{self, RecordSerializer, Writer};

/// Default batch capacity divisor: `rows_per_group * groups_per_batch` with
/// `groups_per_batch` defaulting to 20, giving the spec's 2,000,000 default.
pub const DEFAULT_GROUPS_PER_BATCH: usize = 20;

/// Buffers, sorts, and spills records of type `T`, then replays them in
/// total order.
///
/// `T` is required to be `Clone` so the k-way merge can hold a copy of each
/// active batch's head value in its selection heap while the authoritative
/// copy stays behind an (async, non-`Copy`) cursor.
pub struct ExternalSorter<T> {
    factory: Arc<dyn TempStreamFactory>,
    serializer: Arc<dyn RecordSerializer<T>>,
    comparator: Comparator<T>,
    rows_per_group: usize,
    batch_capacity: usize,
    buffer: Vec<T>,
    batches: Vec<Box<dyn serialization::RawStream>>,
    next_label: usize,
    label_prefix: String,
}

impl<T: Clone + Send + Sync + 'static> ExternalSorter<T> {
    /// Creates a sorter with the given row-group size and batch capacity
    /// (in row groups).
    pub fn new(
        label_prefix: impl Into<String>,
        factory: Arc<dyn TempStreamFactory>,
        serializer: Arc<dyn RecordSerializer<T>>,
        comparator: Comparator<T>,
        rows_per_group: usize,
        groups_per_batch: usize,
    ) -> Self {
        ExternalSorter {
            factory,
            serializer,
            comparator,
            rows_per_group,
            batch_capacity: rows_per_group * groups_per_batch,
            buffer: Vec::new(),
            batches: Vec::new(),
            next_label: 0,
            label_prefix: label_prefix.into(),
        }
    }

    /// Creates a sorter using the spec's defaults (100,000 rows per group,
    /// 2,000,000 rows per batch).
    pub fn with_defaults(
        label_prefix: impl Into<String>,
        factory: Arc<dyn TempStreamFactory>,
        serializer: Arc<dyn RecordSerializer<T>>,
        comparator: Comparator<T>,
    ) -> Self {
        Self::new(
            label_prefix,
            factory,
            serializer,
            comparator,
            serialization::DEFAULT_ROWS_PER_GROUP,
            DEFAULT_GROUPS_PER_BATCH,
        )
    }

    /// Buffers one record, spilling a sorted batch to a temporary stream
    /// once the buffer reaches capacity.
    pub async fn add(&mut self, record: T) -> StageResult<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_capacity {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flushes any remaining buffered records. Must be called before
    /// [`Self::read`].
    pub async fn finish(&mut self) -> StageResult<()> {
        if !self.buffer.is_empty() {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> StageResult<()> {
        let comparator = self.comparator.clone();
        self.buffer.sort_by(|a, b| comparator.compare(a, b));
        let label = format!("{}-batch-{}", self.label_prefix, self.next_label);
        self.next_label += 1;
        let mut stream = self.factory.create(&label);
        {
            let mut writer = Writer::new(stream.as_mut(), self.serializer.as_ref());
            for group in self.buffer.chunks(self.rows_per_group) {
                writer.add(group).await?;
            }
            writer.finish().await?;
        }
        self.batches.push(stream);
        self.buffer.clear();
        Ok(())
    }

    /// Replays every buffered record in total order. Consumes the sorter,
    /// releasing its temporary streams once the returned stream is dropped.
    pub async fn read(self) -> StageResult<BoxStream<'static, StageResult<T>>> {
        match self.batches.len() {
            0 => Ok(stream::empty().boxed()),
            1 => {
                let batch = &self.batches[0];
                serialization::read(batch.as_ref(), self.serializer.clone()).await
            }
            _ => self.merge_batches().await,
        }
    }

    async fn merge_batches(self) -> StageResult<BoxStream<'static, StageResult<T>>> {
        let mut cursors = Vec::with_capacity(self.batches.len());
        for batch in &self.batches {
            let rows = serialization::read(batch.as_ref(), self.serializer.clone()).await?;
            cursors.push(Cursor::new(rows).await?);
        }
        let comparator = self.comparator.clone();
        let mut heap = BinaryHeap::with_capacity(cursors.len());
        for (idx, cursor) in cursors.iter().enumerate() {
            if cursor.valid() {
                heap.push(HeapEntry { value: cursor.value().clone(), idx, comparator: comparator.clone() });
            }
        }
        let state = MergeState { cursors, heap };
        Ok(stream::unfold(state, |mut state| async move {
            let top = state.heap.pop()?;
            let HeapEntry { value, idx, comparator } = top;
            if let Err(e) = state.cursors[idx].next().await {
                return Some((Err(e), state));
            }
            if state.cursors[idx].valid() {
                state.heap.push(HeapEntry { value: state.cursors[idx].value().clone(), idx, comparator });
            }
            Some((Ok(value), state))
        })
        .boxed())
    }
}

struct MergeState<T> {
    cursors: Vec<Cursor<T>>,
    heap: BinaryHeap<HeapEntry<T>>,
}

struct HeapEntry<T> {
    value: T,
    idx: usize,
    comparator: Comparator<T>,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.comparator.compare(&self.value, &other.value) == Ordering::Equal
    }
}
impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the comparator's
        // smallest element first.
        self.comparator.compare(&self.value, &other.value).reverse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::BincodeSerializer;
    use crate::storage::memory::MemoryTempStreamFactory;

    async fn sort_all(values: Vec<i32>, rows_per_group: usize, groups_per_batch: usize) -> Vec<i32> {
        let factory = Arc::new(MemoryTempStreamFactory::default());
        let serializer = Arc::new(BincodeSerializer);
        let comparator = Comparator::<i32>::natural();
        let mut sorter = ExternalSorter::new("test", factory, serializer, comparator, rows_per_group, groups_per_batch);
        for v in values {
            sorter.add(v).await.unwrap();
        }
        sorter.finish().await.unwrap();
        let mut out = sorter.read().await.unwrap();
        let mut result = Vec::new();
        while let Some(v) = out.next().await {
            result.push(v.unwrap());
        }
        result
    }

    #[tokio::test]
    async fn single_batch_sorts_in_memory() {
        let result = sort_all(vec![5, 3, 1, 4, 2], 100, 1).await;
        assert_eq!(result, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn multiple_batches_k_way_merge() {
        // capacity of 2 rows forces several spilled batches.
        let result = sort_all(vec![9, 1, 8, 2, 7, 3, 6, 4, 5], 2, 1).await;
        assert_eq!(result, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let result = sort_all(vec![], 10, 1).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn duplicates_all_survive() {
        let result = sort_all(vec![2, 1, 2, 1, 2], 2, 1).await;
        assert_eq!(result, vec![1, 1, 2, 2, 2]);
    }
}
