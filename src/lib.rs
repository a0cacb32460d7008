//! An incrementally-updatable, sorted materialized-view engine.
//!
//! A [`stage::Stage`] turns a stream of keyed source updates into a sorted
//! `(TargetKey, SourceKey, Value)` Content table and its own derived
//! `(TargetKey, Value)` Updates, by running a user-supplied
//! [`producer::Produce`] across a forward scan of prior state
//! (`generator::generate_instructions`) and applying the resulting
//! instructions to the prior KeyMappings and Content tables
//! (`executor::key_mappings`, `executor::content`). Stages compose into a
//! DAG (`registry::StageRegistry`): a downstream stage's own source updates
//! are the [`merge::merge_sources`] of its upstreams' Updates and Content.
//!
//! Every persisted stream is read and written through the
//! [`serialization::RawStream`]/[`persistence::PersistenceAdapter`] seam, so
//! the engine itself is storage-agnostic; `storage::memory` is a reference
//! in-memory backend used by this crate's own tests.

pub mod bounded_sequence;
pub mod config;
pub mod cursor;
pub mod error;
pub mod executor;
pub mod generator;
pub mod instruction;
pub mod merge;
pub mod order;
pub mod persistence;
pub mod producer;
pub mod record;
pub mod registry;
pub mod serialization;
pub mod sort;
pub mod stage;
pub mod storage;

pub use error::{StageError, StageResult};
pub use order::Comparator;
pub use producer::{FnProducer, Produce};
pub use record::{ContentRecord, KeyMapping, SourceUpdate, UpdateType};
pub use registry::{StageId, StageRegistry};
pub use stage::{DynStage, Stage, StageFeeder};
