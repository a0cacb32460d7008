//! Multi-source merger (`spec.md` §4.7).
//!
//! Turns N feeders' own `Updates` and `Content` into one ordered
//! `SourceUpdate<K, TV>` stream fit to drive a downstream stage's
//! [`crate::generator::generate_instructions`]. Three layers, run in order:
//!
//! 1. affected-keys set — a k-way merge of every feeder's `Updates` key
//!    column, deduplicated and persisted so each feeder can walk it again;
//! 2. per-feeder augmentation — real updates for touched keys, rows
//!    promoted from `Content` for untouched-but-affected keys;
//! 3. global merge plus the delta deduplicator, collapsing each key's group
//!    down to "one Delete, or one-or-more non-deletes."

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use smallvec::SmallVec;

use crate::cursor::Cursor;
use crate::error::StageResult;
use crate::order::Comparator;
use crate::persistence::TempStreamFactory;
use crate::record::SourceUpdate;
use crate::serialization::{self, RecordSerializer, Writer};

/// One upstream stage's contribution to a multi-source merge.
///
/// Deliberately narrower than a full [`crate::stage::Stage`]: the merger
/// only ever needs a feeder's `Updates` (as `SourceUpdate<K, TV>`, `K` being
/// the feeder's own `TargetKey`) and its Content reshaped down to
/// `(TargetKey, Value)` pairs sorted by `TargetKey`. Both must be
/// independently re-openable, since the affected-keys pass and the
/// augmentation pass each need their own walk.
#[async_trait]
pub trait Feeder<K, TV>: Send + Sync {
    /// Opens this feeder's Updates stream, sorted by key.
    async fn open_updates(&self) -> StageResult<BoxStream<'static, StageResult<SourceUpdate<K, TV>>>>;

    /// Opens this feeder's Content, reshaped to `(TargetKey, Value)` pairs
    /// sorted by `TargetKey` (i.e. projected and stripped of `SourceKey`).
    async fn open_content_values(&self) -> StageResult<BoxStream<'static, StageResult<(K, TV)>>>;
}

/// Runs the full three-layer merge described in `spec.md` §4.7.
pub async fn merge_sources<K, TV>(
    feeders: &[Arc<dyn Feeder<K, TV>>],
    comparator: Comparator<K>,
    temp_factory: &dyn TempStreamFactory,
    key_serializer: Arc<dyn RecordSerializer<K>>,
) -> StageResult<BoxStream<'static, StageResult<SourceUpdate<K, TV>>>>
where
    K: Clone + PartialEq + Send + Sync + 'static,
    TV: Clone + Send + Sync + 'static,
{
    let affected_keys =
        build_affected_keys(feeders, comparator.clone(), temp_factory, key_serializer.clone()).await?;

    let mut augmented_cursors = Vec::with_capacity(feeders.len());
    for feeder in feeders {
        // Each feeder takes its own independent read pass over the shared
        // affected-keys stream (`RawStream::read_chunks` replays from the
        // start every time it is called).
        let affected_cursor =
            Cursor::new(serialization::read(affected_keys.as_ref(), key_serializer.clone()).await?).await?;
        let updates_cursor = Cursor::new(feeder.open_updates().await?).await?;
        let content_cursor = Cursor::new(feeder.open_content_values().await?).await?;
        let augmented =
            augment_feeder(affected_cursor, updates_cursor, content_cursor, comparator.clone()).await?;
        augmented_cursors.push(Cursor::new(augmented).await?);
    }

    let key_comparator = comparator.clone();
    let update_comparator: Comparator<SourceUpdate<K, TV>> =
        Comparator::new(move |a: &SourceUpdate<K, TV>, b: &SourceUpdate<K, TV>| key_comparator.compare(&a.key, &b.key));
    let merged = k_way_merge(augmented_cursors, update_comparator).await?;
    let merged_cursor = Cursor::new(merged).await?;

    dedup_deltas(merged_cursor, comparator).await
}

async fn build_affected_keys<K, TV>(
    feeders: &[Arc<dyn Feeder<K, TV>>],
    comparator: Comparator<K>,
    temp_factory: &dyn TempStreamFactory,
    key_serializer: Arc<dyn RecordSerializer<K>>,
) -> StageResult<Box<dyn serialization::RawStream>>
where
    K: Clone + PartialEq + Send + Sync + 'static,
    TV: Clone + Send + Sync + 'static,
{
    let mut key_cursors = Vec::with_capacity(feeders.len());
    for feeder in feeders {
        let updates = feeder.open_updates().await?;
        let keys = updates.map(|row| row.map(|u| u.key)).boxed();
        key_cursors.push(Cursor::new(keys).await?);
    }
    let merged_keys = k_way_merge(key_cursors, comparator.clone()).await?;

    let mut out = temp_factory.create("affected-keys");
    {
        let mut writer = Writer::new(out.as_mut(), key_serializer.as_ref());
        let mut merged = merged_keys;
        let mut last: Option<K> = None;
        let mut batch = Vec::new();
        while let Some(item) = merged.next().await {
            let key = item?;
            if last.as_ref().map(|l| comparator.compare(l, &key) == Ordering::Equal).unwrap_or(false) {
                continue;
            }
            last = Some(key.clone());
            batch.push(key);
            if batch.len() >= serialization::DEFAULT_ROWS_PER_GROUP {
                writer.add(&batch).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            writer.add(&batch).await?;
        }
        writer.finish().await?;
    }
    Ok(out)
}

/// Layer 2: builds one feeder's augmented stream by walking the affected
/// keys against that feeder's own Updates and Content in lockstep.
async fn augment_feeder<K, TV>(
    mut affected: Cursor<K>,
    mut updates: Cursor<SourceUpdate<K, TV>>,
    mut content: Cursor<(K, TV)>,
    comparator: Comparator<K>,
) -> StageResult<BoxStream<'static, StageResult<SourceUpdate<K, TV>>>>
where
    K: Clone + PartialEq + Send + Sync + 'static,
    TV: Clone + Send + Sync + 'static,
{
    let mut out = Vec::new();
    while affected.valid() {
        let k = affected.value().clone();

        while updates.valid() && comparator.compare(&updates.value().key, &k) == Ordering::Less {
            updates.next().await?;
        }
        while content.valid() && comparator.compare(&content.value().0, &k) == Ordering::Less {
            content.next().await?;
        }

        if updates.valid() && comparator.compare(&updates.value().key, &k) == Ordering::Equal {
            while updates.valid() && comparator.compare(&updates.value().key, &k) == Ordering::Equal {
                out.push(updates.value().clone());
                updates.next().await?;
            }
        } else {
            while content.valid() && comparator.compare(&content.value().0, &k) == Ordering::Equal {
                let (key, value) = content.value().clone();
                out.push(SourceUpdate::update(key, value));
                content.next().await?;
            }
        }

        affected.next().await?;
    }
    Ok(stream::iter(out.into_iter().map(Ok)).boxed())
}

/// Layer 3's second half: collapses each key's group of merged rows down to
/// "exactly one Delete, or one-or-more non-deletes", per §4.7's delta
/// deduplicator.
async fn dedup_deltas<K, TV>(
    mut merged: Cursor<SourceUpdate<K, TV>>,
    comparator: Comparator<K>,
) -> StageResult<BoxStream<'static, StageResult<SourceUpdate<K, TV>>>>
where
    K: Clone + PartialEq + Send + Sync + 'static,
    TV: Clone + Send + Sync + 'static,
{
    let mut out = Vec::new();
    while merged.valid() {
        let k = merged.value().key.clone();
        // Most keys are touched by a small minority of feeders, so a group
        // rarely spills past the inline capacity onto the heap.
        let mut group: SmallVec<[SourceUpdate<K, TV>; 4]> = SmallVec::new();
        while merged.valid() && comparator.compare(&merged.value().key, &k) == Ordering::Equal {
            group.push(merged.value().clone());
            merged.next().await?;
        }
        let any_upsert = group.iter().any(|u| u.is_upsert());
        if any_upsert {
            out.extend(group.into_iter().filter(|u| u.is_upsert()));
        } else if let Some(delete) = group.into_iter().next() {
            out.push(delete);
        }
    }
    Ok(stream::iter(out.into_iter().map(Ok)).boxed())
}

/// Generic k-way sorted merge over already-sorted cursors, used both for
/// the affected-keys pass (`T = K`) and the global merge (`T =
/// SourceUpdate<K, TV>`).
async fn k_way_merge<T>(
    cursors: Vec<Cursor<T>>,
    comparator: Comparator<T>,
) -> StageResult<BoxStream<'static, StageResult<T>>>
where
    T: Clone + Send + Sync + 'static,
{
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
        self.comparator.compare(&self.value, &other.value).reverse()
    }
}
