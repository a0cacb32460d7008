//! The user contract: `Produce<SK, SV, TK, TV>` (`spec.md` §6).

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Turns one source key and its (bounded, single-use) values into zero or
/// more target pairs.
///
/// Must fully consume `values` before returning — otherwise the caller
/// raises [`crate::error::StageError::ProducerUnderconsumed`]. May yield
/// target pairs in any order; the surrounding sorters normalize order away.
/// Must not retain references to `values` past return.
#[async_trait]
pub trait Produce<SK, SV, TK, TV>: Send + Sync {
    /// Produces target pairs for one source key.
    async fn produce(&self, key: &SK, values: BoxStream<'static, SV>) -> BoxStream<'static, (TK, TV)>;
}

/// Adapts a plain synchronous closure-like function into a [`Produce`].
///
/// Many producers (see `spec.md` §8's scenarios) are simple enough to write
/// as `Fn(&SK, Vec<SV>) -> Vec<(TK, TV)>` once the bounded sequence has been
/// drained to a `Vec`; this wrapper does that draining so the common case
/// doesn't need to hand-write stream plumbing.
pub struct FnProducer<F>(pub F);

#[async_trait]
impl<SK, SV, TK, TV, F> Produce<SK, SV, TK, TV> for FnProducer<F>
where
    SK: Send + Sync + 'static,
    SV: Send + Sync + 'static,
    TK: Send + Sync + 'static,
    TV: Send + Sync + 'static,
    F: Fn(&SK, Vec<SV>) -> Vec<(TK, TV)> + Send + Sync,
{
    async fn produce(&self, key: &SK, values: BoxStream<'static, SV>) -> BoxStream<'static, (TK, TV)> {
        use futures::stream::{self, StreamExt};
        let drained: Vec<SV> = values.collect().await;
        let out = (self.0)(key, drained);
        stream::iter(out).boxed()
    }
}
