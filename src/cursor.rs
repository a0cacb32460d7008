//! A single-step forward cursor over an async sequence (`spec.md` §4.3).
//!
//! This is the navigation primitive used everywhere the algorithm needs
//! *peek + conditional advance*: the instruction generator's mapping scan,
//! both instruction executors, and the multi-source merger's affected-keys
//! walk. It deliberately exposes far less than `differential-dataflow`'s own
//! `Cursor` trait (no key/val split, no seek) — the streams here are always
//! consumed strictly in order, one row at a time.

use futures::stream::{BoxStream, StreamExt};

use crate::error::StageResult;

/// A forward-only cursor with one item of look-ahead.
pub struct Cursor<T> {
    stream: BoxStream<'static, StageResult<T>>,
    current: Option<T>,
}

impl<T> Cursor<T> {
    /// Wraps a stream, eagerly pulling its first item so `valid`/`value`
    /// are meaningful immediately.
    pub async fn new(stream: BoxStream<'static, StageResult<T>>) -> StageResult<Self> {
        let mut cursor = Cursor { stream, current: None };
        cursor.advance().await?;
        Ok(cursor)
    }

    /// False once the underlying stream is exhausted.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The current element. Panics if `!valid()`, mirroring the teacher
    /// cursor's "asserts if invalid" contract for its `key`/`val` accessors.
    pub fn value(&self) -> &T {
        self.current.as_ref().expect("Cursor::value called on exhausted cursor")
    }

    /// Takes the current element without requiring a further call to
    /// `next`; used where an executor wants to move a row out rather than
    /// borrow it.
    pub fn value_mut(&mut self) -> &mut T {
        self.current.as_mut().expect("Cursor::value_mut called on exhausted cursor")
    }

    /// Advances to the next element, or marks the cursor exhausted.
    pub async fn next(&mut self) -> StageResult<()> {
        self.advance().await
    }

    async fn advance(&mut self) -> StageResult<()> {
        self.current = match self.stream.next().await {
            Some(item) => Some(item?),
            None => None,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn cursor_of(values: Vec<i32>) -> BoxStream<'static, StageResult<i32>> {
        stream::iter(values.into_iter().map(Ok)).boxed()
    }

    #[tokio::test]
    async fn walks_values_in_order() {
        let mut cursor = Cursor::new(cursor_of(vec![1, 2, 3])).await.unwrap();
        let mut seen = Vec::new();
        while cursor.valid() {
            seen.push(*cursor.value());
            cursor.next().await.unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_stream_is_never_valid() {
        let cursor = Cursor::new(cursor_of(vec![])).await.unwrap();
        assert!(!cursor.valid());
    }
}
