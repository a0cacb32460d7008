//! The persisted and in-flight record types of `spec.md` §3.

use serde::{Deserialize, Serialize};

/// The three kinds of change an externally- or internally-supplied update
/// stream can describe for a given key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    /// Introduces a key that was not previously present.
    Add,
    /// Replaces the value(s) previously associated with a key.
    Update,
    /// Removes a key entirely.
    Delete,
}

/// An externally supplied change, or a stage's own republished delta.
///
/// Input invariant (`spec.md` §3): the stream containing these is sorted by
/// `key` under the source comparator, and for a given key either exactly
/// one `Delete` appears, or one-or-more non-delete rows appear — never a
/// mix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceUpdate<K, V> {
    /// Add, Update, or Delete.
    pub update_type: UpdateType,
    /// The key this update concerns.
    pub key: K,
    /// The new value. Ignored (and conventionally absent) when
    /// `update_type == UpdateType::Delete`.
    pub value: Option<V>,
}

impl<K, V> SourceUpdate<K, V> {
    /// Builds an `Add` update.
    pub fn add(key: K, value: V) -> Self {
        SourceUpdate { update_type: UpdateType::Add, key, value: Some(value) }
    }

    /// Builds an `Update` update.
    pub fn update(key: K, value: V) -> Self {
        SourceUpdate { update_type: UpdateType::Update, key, value: Some(value) }
    }

    /// Builds a `Delete` update.
    pub fn delete(key: K) -> Self {
        SourceUpdate { update_type: UpdateType::Delete, key, value: None }
    }

    /// True for `Add`/`Update` rows.
    pub fn is_upsert(&self) -> bool {
        !matches!(self.update_type, UpdateType::Delete)
    }
}

/// A row of the persisted view: one `(TK, SK, TV)` triple produced from
/// some source key. Uniqueness on `(TK, SK, TV)` is not required — if
/// `Produce` emits the same triple more than once, duplicates survive
/// (`spec.md` §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentRecord<TK, SK, TV> {
    /// Target key.
    pub target_key: TK,
    /// Source key this row was produced from.
    pub source_key: SK,
    /// The produced value.
    pub value: TV,
}

/// One row for every `(TK, SK)` combination present in Content; multiplicity
/// on `(SK, TK)` mirrors multiplicity in Content (`spec.md` §3 invariant 2).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapping<SK, TK> {
    /// Source key.
    pub source_key: SK,
    /// Target key it maps to.
    pub target_key: TK,
}

impl<TK: Ord, SK: Ord, TV> ContentRecord<TK, SK, TV> {
    /// Orders by `(TargetKey, SourceKey)`, the sort order Content is kept
    /// in under the default comparators.
    pub fn cmp_by_tk_sk(a: &Self, b: &Self) -> std::cmp::Ordering {
        (&a.target_key, &a.source_key).cmp(&(&b.target_key, &b.source_key))
    }
}

impl<SK: Ord, TK: Ord> KeyMapping<SK, TK> {
    /// Orders by `(SourceKey, TargetKey)`.
    pub fn cmp_by_sk_tk(a: &Self, b: &Self) -> std::cmp::Ordering {
        (&a.source_key, &a.target_key).cmp(&(&b.source_key, &b.target_key))
    }
}
