//! Internal ephemeral instruction records emitted by the instruction
//! generator (§4.4) and consumed by the instruction executors (§4.5, §4.6).
//!
//! These never outlive one production — they only ever live in a sorter's
//! spilled batches — but still cross the same [`crate::serialization::RecordSerializer`]
//! seam as persisted records, so they need the same `serde` impls.

use serde::{Deserialize, Serialize};

/// `(TK, SK, V?, Deletion)`, sorted by `(TK, SK)`.
///
/// Within identical `(TK, SK)`, both deletion- and add-instructions may
/// occur; the sort order alone does not disambiguate which runs first (see
/// `spec.md` §4.6 case 1 and §9's open question about the redundant
/// re-compare step).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentInstruction<TK, SK, TV> {
    /// Target key.
    pub target_key: TK,
    /// Source key.
    pub source_key: SK,
    /// Present unless this is a deletion instruction.
    pub value: Option<TV>,
    /// True when this instruction removes `(target_key, source_key)`.
    pub deletion: bool,
}

impl<TK: Ord, SK: Ord, TV> ContentInstruction<TK, SK, TV> {
    /// Orders by `(TargetKey, SourceKey)`.
    pub fn cmp_by_tk_sk(a: &Self, b: &Self) -> std::cmp::Ordering {
        (&a.target_key, &a.source_key).cmp(&(&b.target_key, &b.source_key))
    }
}

/// `(SK, TK, Deletion)`, sorted by `(SK, TK)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyMappingInstruction<SK, TK> {
    /// Source key.
    pub source_key: SK,
    /// Target key.
    pub target_key: TK,
    /// True when this instruction removes `(source_key, target_key)`.
    pub deletion: bool,
}

impl<SK: Ord, TK: Ord> KeyMappingInstruction<SK, TK> {
    /// Orders by `(SourceKey, TargetKey)`.
    pub fn cmp_by_sk_tk(a: &Self, b: &Self) -> std::cmp::Ordering {
        (&a.source_key, &a.target_key).cmp(&(&b.source_key, &b.target_key))
    }
}
