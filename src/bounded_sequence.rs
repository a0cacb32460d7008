//! The single-use, bounded value sequence handed to `Produce` (`spec.md`
//! §4.4, §9).
//!
//! Modeled as a small finite-state object rather than a lazy view that
//! outlives the call, per the design note in §9: it reads from the outer
//! source-update cursor and stops the instant the key changes, and its
//! exhaustion flag is inspected once `Produce` returns to detect
//! under-consumption.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;

use crate::cursor::Cursor;
use crate::order::Comparator;
use crate::record::SourceUpdate;

/// Shared exhaustion flag, set once the bounded sequence has yielded every
/// row sharing its key (or hit the end of input). The instruction generator
/// inspects this after `Produce` returns to detect under-consumption.
#[derive(Default)]
struct Shared {
    exhausted: bool,
}

/// A handle the instruction generator keeps after handing a
/// [`BoundedValues`] stream to `Produce`, to check consumption afterwards.
#[derive(Clone)]
pub struct BoundedValuesHandle(Arc<std::sync::Mutex<Shared>>);

impl BoundedValuesHandle {
    /// True once the sequence has yielded every row sharing its key.
    pub fn is_exhausted(&self) -> bool {
        self.0.lock().unwrap().exhausted
    }

    fn mark_exhausted(&self) {
        self.0.lock().unwrap().exhausted = true;
    }
}

/// Builds the bounded sequence for one source key and returns it alongside
/// the handle used to check exhaustion.
///
/// `cursor` is the shared forward cursor over source updates, already
/// positioned at the row *after* `first_value` (the generator extracts the
/// head row itself before constructing this). The returned stream consumes
/// further rows directly from `cursor` as it is polled, stopping the
/// instant the key changes or the cursor runs out.
pub fn bounded_values<SK, SV>(
    key: SK,
    comparator: Comparator<SK>,
    first_value: SV,
    cursor: Arc<Mutex<Cursor<SourceUpdate<SK, SV>>>>,
) -> (BoxStream<'static, SV>, BoundedValuesHandle)
where
    SK: Clone + Send + Sync + 'static,
    SV: Clone + Send + Sync + 'static,
{
    let handle = BoundedValuesHandle(Arc::new(std::sync::Mutex::new(Shared::default())));
    let handle_for_stream = handle.clone();

    let stream = stream::unfold(Some(first_value), move |pending| {
        let cursor = cursor.clone();
        let key = key.clone();
        let comparator = comparator.clone();
        let handle = handle_for_stream.clone();
        async move {
            if let Some(v) = pending {
                return Some((v, None));
            }
            let mut cursor = cursor.lock().await;
            if !cursor.valid() || comparator.compare(&cursor.value().key, &key) != Ordering::Equal {
                handle.mark_exhausted();
                return None;
            }
            let value = match &cursor.value().value {
                Some(v) => v.clone(),
                // A value-less row sharing this key violates the per-key
                // invariant; the generator's own ordering scan is
                // responsible for rejecting that input before `Produce` is
                // ever invoked, so this arm is unreachable in practice.
                None => {
                    handle.mark_exhausted();
                    return None;
                }
            };
            if cursor.next().await.is_err() {
                handle.mark_exhausted();
                return None;
            }
            Some((value, None))
        }
    })
    .boxed();

    (stream, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourceUpdate;
    use futures::stream::{self as fstream, StreamExt as _};

    async fn cursor_of(updates: Vec<SourceUpdate<i32, &'static str>>) -> Cursor<SourceUpdate<i32, &'static str>> {
        let s = fstream::iter(updates.into_iter().map(Ok)).boxed();
        Cursor::new(s).await.unwrap()
    }

    #[tokio::test]
    async fn stops_at_key_change() {
        let mut cursor = cursor_of(vec![
            SourceUpdate::update(1, "b"),
            SourceUpdate::update(1, "c"),
            SourceUpdate::update(2, "d"),
        ])
        .await;
        // Extract head row ("b") as the generator would, then advance the
        // shared cursor past it before handing the rest to `Produce`.
        let first = cursor.value().value.unwrap();
        cursor.next().await.unwrap();
        let shared = Arc::new(Mutex::new(cursor));
        let (mut stream, handle) = bounded_values(1, Comparator::natural(), first, shared.clone());
        let mut seen = Vec::new();
        while let Some(v) = stream.next().await {
            seen.push(v);
        }
        assert_eq!(seen, vec!["b", "c"]);
        assert!(handle.is_exhausted());
        let remaining = shared.lock().await;
        assert!(remaining.valid());
        assert_eq!(remaining.value().key, 2);
    }
}
