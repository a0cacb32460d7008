//! The persistence adapter: the only I/O boundary a [`crate::stage::Stage`]
//! crosses to read or publish a version (`spec.md` §6).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StageResult;
use crate::serialization::RawStream;

/// Which of a stage's three persisted streams is being addressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// `(TargetKey, SourceKey, Value)`, sorted by `(TK, SK)`.
    Content,
    /// `(SourceKey, TargetKey)`, sorted by `(SK, TK)`.
    KeyMappings,
    /// `(Type, Key, Value?)`, sorted by `TK`.
    Update,
}

/// A stage's versioned storage backend.
///
/// Implementors own whatever lives behind `name`/`kind`/`version` — local
/// files, an object store, anything with read-after-write consistency per
/// version. The engine itself only ever opens a version for read, or
/// uploads a fully-built version; see `spec.md` §5 for why no locking is
/// required.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Opens `(name, kind, version)` for reading. Non-existent objects
    /// (typically `version == 0`, "no prior state") resolve to an empty
    /// stream rather than an error.
    async fn open_read(
        &self,
        name: &str,
        kind: StreamKind,
        version: u64,
    ) -> StageResult<Box<dyn RawStream>>;

    /// Persists `stream`'s full contents under `(name, kind, version)`. A
    /// zero-length stream causes any existing object at that address to be
    /// deleted instead of replaced with an empty one.
    async fn upload(
        &self,
        name: &str,
        kind: StreamKind,
        version: u64,
        stream: Box<dyn RawStream>,
        cancel: &CancellationToken,
    ) -> StageResult<()>;
}

/// Produces fresh, scoped-to-one-production temporary streams.
///
/// Labels are diagnostic only; implementors are free to ignore them beyond
/// logging. Every stream handed out by one call is expected to be released
/// (dropped) by the end of the production that requested it, on every exit
/// path including cancellation and error (`spec.md` §5).
pub trait TempStreamFactory: Send + Sync {
    /// Allocates a new, empty temporary stream.
    fn create(&self, label: &str) -> Box<dyn RawStream>;
}
