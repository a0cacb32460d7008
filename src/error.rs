//! Error types surfaced by a [`crate::stage::Stage`] update.
//!
//! Every variant here is fatal to the `Update` call that produced it: no
//! partial version is ever published (see `spec.md` §7).

use std::fmt::Debug;

/// Errors that can arise while driving a single-stage `Update` or a
/// multi-source merge.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// An input update stream was not monotonically non-decreasing by key,
    /// or a `Delete` was followed by further rows sharing its key.
    #[error("ordering violation in stage {stage:?}: {detail}")]
    Ordering {
        /// Name of the stage whose input violated the ordering invariant.
        stage: String,
        /// Human-readable detail (e.g. the two offending keys).
        detail: String,
    },

    /// The user's `Produce` returned before consuming its bounded input
    /// sequence.
    #[error("producer for stage {stage:?} did not consume its input for key {key}")]
    ProducerUnderconsumed {
        /// Name of the stage whose producer under-consumed.
        stage: String,
        /// Debug rendering of the source key in question.
        key: String,
    },

    /// A content-deletion instruction referred to a `(TK, SK)` pair absent
    /// from prior Content — prior KeyMappings had desynchronised from
    /// Content.
    #[error("instruction referenced (target, source) = {target}/{source} absent from prior content in stage {stage:?}")]
    UnexpectedDeletion {
        /// Name of the stage.
        stage: String,
        /// Debug rendering of the target key.
        target: String,
        /// Debug rendering of the source key.
        source: String,
    },

    /// Propagated verbatim from a [`crate::serialization::RecordSerializer`].
    #[error("serialization error: {0}")]
    Serialization(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Propagated verbatim from a [`crate::persistence::PersistenceAdapter`].
    #[error("io error: {0}")]
    Io(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// A stage with the same name is already present in the registry.
    #[error("duplicate stage registration: {0:?}")]
    DuplicateStage(String),

    /// Cooperative cancellation fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the crate.
pub type StageResult<T> = Result<T, StageError>;
