//! Stage façade (`spec.md` §4.8).
//!
//! Owns a stage's identity, its persistence adapter, the user's `Produce`,
//! the comparators, and the temporary-stream factory. Drives one version
//! transition end to end: open prior `(KeyMappings, Content)`, run the
//! production through the generator and both executors, upload the new
//! version's three streams.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::config::StageConfig;
use crate::cursor::Cursor;
use crate::error::StageResult;
use crate::executor;
use crate::generator;
use crate::instruction::{ContentInstruction, KeyMappingInstruction};
use crate::merge::{self, Feeder};
use crate::order::Comparator;
use crate::persistence::{PersistenceAdapter, StreamKind, TempStreamFactory};
use crate::producer::Produce;
use crate::record::{ContentRecord, KeyMapping, SourceUpdate};
use crate::serialization::{self, BatchedWriter, RecordSerializer, Writer};
use crate::sort::ExternalSorter;

/// A stage: one node in the DAG, materializing `(TK, SK, TV)` Content and
/// its `(TK, TV)` Updates from `(SK, SV)` source updates via `P`.
pub struct Stage<SK, SV, TK, TV, P> {
    name: String,
    persistence: Arc<dyn PersistenceAdapter>,
    temp_factory: Arc<dyn TempStreamFactory>,
    producer: P,
    source_comparator: Comparator<SK>,
    target_comparator: Comparator<TK>,
    config: StageConfig<TV>,
    source_key_serializer: Arc<dyn RecordSerializer<SK>>,
    mapping_serializer: Arc<dyn RecordSerializer<KeyMapping<SK, TK>>>,
    content_serializer: Arc<dyn RecordSerializer<ContentRecord<TK, SK, TV>>>,
    update_serializer: Arc<dyn RecordSerializer<SourceUpdate<TK, TV>>>,
    content_instruction_serializer: Arc<dyn RecordSerializer<ContentInstruction<TK, SK, TV>>>,
    mapping_instruction_serializer: Arc<dyn RecordSerializer<KeyMappingInstruction<SK, TK>>>,
    upstream: Vec<Arc<dyn Feeder<SK, SV>>>,
    _marker: std::marker::PhantomData<SV>,
}

impl<SK, SV, TK, TV, P> Stage<SK, SV, TK, TV, P>
where
    SK: Clone + PartialEq + Send + Sync + Debug + Serialize + DeserializeOwned + 'static,
    SV: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    TK: Clone + PartialEq + Send + Sync + Debug + Serialize + DeserializeOwned + 'static,
    TV: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    P: Produce<SK, SV, TK, TV>,
{
    /// Builds a stage with no upstreams (source stage, driven directly via
    /// [`Self::update`]).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        persistence: Arc<dyn PersistenceAdapter>,
        temp_factory: Arc<dyn TempStreamFactory>,
        producer: P,
        source_comparator: Comparator<SK>,
        target_comparator: Comparator<TK>,
        config: StageConfig<TV>,
        source_key_serializer: Arc<dyn RecordSerializer<SK>>,
        mapping_serializer: Arc<dyn RecordSerializer<KeyMapping<SK, TK>>>,
        content_serializer: Arc<dyn RecordSerializer<ContentRecord<TK, SK, TV>>>,
        update_serializer: Arc<dyn RecordSerializer<SourceUpdate<TK, TV>>>,
        content_instruction_serializer: Arc<dyn RecordSerializer<ContentInstruction<TK, SK, TV>>>,
        mapping_instruction_serializer: Arc<dyn RecordSerializer<KeyMappingInstruction<SK, TK>>>,
    ) -> Self {
        Stage {
            name: name.into(),
            persistence,
            temp_factory,
            producer,
            source_comparator,
            target_comparator,
            config,
            source_key_serializer,
            mapping_serializer,
            content_serializer,
            update_serializer,
            content_instruction_serializer,
            mapping_instruction_serializer,
            upstream: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Registers upstream feeders; `update_from_sources` merges them via
    /// [`crate::merge::merge_sources`] before driving [`Self::update`].
    pub fn with_upstream(mut self, upstream: Vec<Arc<dyn Feeder<SK, SV>>>) -> Self {
        self.upstream = upstream;
        self
    }

    /// This stage's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pure single-stage transition: runs the production against
    /// `source_updates` atop version `based_on_version`, uploading the new
    /// streams under `based_on_version + 1`. Returns the new version
    /// number.
    ///
    /// Every major phase below — opening prior streams, instruction
    /// generation, each instruction executor, each upload — races against
    /// `cancel` via [`tokio::select!`]; a cancellation observed between
    /// phases short-circuits with `StageError::Cancelled` before the next
    /// one starts, and every temporary stream/sorter already allocated is
    /// released by its own `Drop` impl as the function unwinds.
    #[instrument(skip_all, fields(stage = %self.name, based_on_version))]
    pub async fn update(
        &self,
        source_updates: BoxStream<'static, StageResult<SourceUpdate<SK, SV>>>,
        based_on_version: u64,
        cancel: &CancellationToken,
    ) -> StageResult<u64> {
        macro_rules! race {
            ($fut:expr) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(crate::error::StageError::Cancelled),
                    res = $fut => res?,
                }
            };
        }

        let production_id = Uuid::new_v4();
        tracing::info!(stage = %self.name, %production_id, based_on_version, "starting production");

        let prior_mappings_raw =
            race!(self.persistence.open_read(&self.name, StreamKind::KeyMappings, based_on_version));
        let prior_content_raw =
            race!(self.persistence.open_read(&self.name, StreamKind::Content, based_on_version));

        tracing::debug!(stage = %self.name, %production_id, "generating instructions");
        let mapping_rows_for_generator =
            race!(serialization::read(prior_mappings_raw.as_ref(), self.mapping_serializer.clone()));
        let mapping_cursor_for_generator = race!(Cursor::new(mapping_rows_for_generator));
        let source_cursor = race!(Cursor::new(source_updates));

        let mut content_instr_sorter = ExternalSorter::new(
            format!("{}-content-instr", self.name),
            self.temp_factory.clone(),
            self.content_instruction_serializer.clone(),
            Comparator::new({
                let tcmp = self.target_comparator.clone();
                let scmp = self.source_comparator.clone();
                move |a: &ContentInstruction<TK, SK, TV>, b: &ContentInstruction<TK, SK, TV>| {
                    match tcmp.compare(&a.target_key, &b.target_key) {
                        Ordering::Equal => scmp.compare(&a.source_key, &b.source_key),
                        ord => ord,
                    }
                }
            }),
            self.config.rows_per_group,
            self.config.groups_per_batch,
        );
        let mut mapping_instr_sorter = ExternalSorter::new(
            format!("{}-mapping-instr", self.name),
            self.temp_factory.clone(),
            self.mapping_instruction_serializer.clone(),
            Comparator::new({
                let scmp = self.source_comparator.clone();
                let tcmp = self.target_comparator.clone();
                move |a: &KeyMappingInstruction<SK, TK>, b: &KeyMappingInstruction<SK, TK>| {
                    match scmp.compare(&a.source_key, &b.source_key) {
                        Ordering::Equal => tcmp.compare(&a.target_key, &b.target_key),
                        ord => ord,
                    }
                }
            }),
            self.config.rows_per_group,
            self.config.groups_per_batch,
        );

        race!(generator::generate_instructions(
            &self.name,
            mapping_cursor_for_generator,
            source_cursor,
            &self.producer,
            self.source_comparator.clone(),
            &mut content_instr_sorter,
            &mut mapping_instr_sorter,
        ));
        race!(content_instr_sorter.finish());
        race!(mapping_instr_sorter.finish());
        let content_instr_rows = race!(content_instr_sorter.read());
        let content_instr_cursor = race!(Cursor::new(content_instr_rows));
        let mapping_instr_rows = race!(mapping_instr_sorter.read());
        let mapping_instr_cursor = race!(Cursor::new(mapping_instr_rows));

        tracing::debug!(stage = %self.name, %production_id, "applying KeyMappings instructions");
        let prior_mappings_rows_for_exec =
            race!(serialization::read(prior_mappings_raw.as_ref(), self.mapping_serializer.clone()));
        let prior_mappings_for_exec = race!(Cursor::new(prior_mappings_rows_for_exec));
        let mut new_mappings_raw = self.temp_factory.create(&format!("{}-mappings", self.name));
        {
            let writer = Writer::new(new_mappings_raw.as_mut(), self.mapping_serializer.as_ref());
            let batched = BatchedWriter::new(writer, self.config.rows_per_group);
            race!(executor::key_mappings::execute(
                prior_mappings_for_exec,
                mapping_instr_cursor,
                self.source_comparator.clone(),
                self.target_comparator.clone(),
                batched,
            ));
        }

        tracing::debug!(stage = %self.name, %production_id, "applying Content instructions and deriving deltas");
        let prior_content_rows =
            race!(serialization::read(prior_content_raw.as_ref(), self.content_serializer.clone()));
        let prior_content_cursor = race!(Cursor::new(prior_content_rows));
        let mut new_content_raw = self.temp_factory.create(&format!("{}-content", self.name));
        let mut new_updates_raw = self.temp_factory.create(&format!("{}-updates", self.name));
        {
            let content_writer = Writer::new(new_content_raw.as_mut(), self.content_serializer.as_ref());
            let content_batched = BatchedWriter::new(content_writer, self.config.rows_per_group);
            let update_writer = Writer::new(new_updates_raw.as_mut(), self.update_serializer.as_ref());
            let update_batched = BatchedWriter::new(update_writer, self.config.rows_per_group);
            race!(executor::content::execute(
                &self.name,
                prior_content_cursor,
                content_instr_cursor,
                self.target_comparator.clone(),
                self.source_comparator.clone(),
                self.config.preserve_key_values.clone(),
                content_batched,
                Some(update_batched),
            ));
        }

        let new_version = based_on_version + 1;
        race!(self.persistence.upload(&self.name, StreamKind::KeyMappings, new_version, new_mappings_raw, cancel));
        race!(self.persistence.upload(&self.name, StreamKind::Content, new_version, new_content_raw, cancel));
        race!(self.persistence.upload(&self.name, StreamKind::Update, new_version, new_updates_raw, cancel));
        tracing::info!(stage = %self.name, %production_id, new_version, "production complete");
        Ok(new_version)
    }

    /// Reads this stage's upstreams' version-`based_on_version` Updates and
    /// Content through [`crate::merge::merge_sources`] and drives
    /// [`Self::update`] with the result.
    pub async fn update_from_sources(
        &self,
        based_on_version: u64,
        cancel: &CancellationToken,
    ) -> StageResult<u64> {
        let merged = merge::merge_sources(
            &self.upstream,
            self.source_comparator.clone(),
            self.temp_factory.as_ref(),
            self.source_key_serializer.clone(),
        )
        .await?;
        self.update(merged, based_on_version, cancel).await
    }

    /// Streams this stage's Updates at `version` for downstream
    /// consumption.
    pub async fn read_updates(
        &self,
        version: u64,
    ) -> StageResult<BoxStream<'static, StageResult<SourceUpdate<TK, TV>>>> {
        let raw = self.persistence.open_read(&self.name, StreamKind::Update, version).await?;
        serialization::read(raw.as_ref(), self.update_serializer.clone()).await
    }

    /// Streams this stage's Content at `version`, reshaped to the
    /// `(TargetKey, Value)` pairs a downstream [`Feeder`] promotes from.
    pub async fn read_content_values(
        &self,
        version: u64,
    ) -> StageResult<BoxStream<'static, StageResult<(TK, TV)>>> {
        use futures::stream::StreamExt;
        let raw = self.persistence.open_read(&self.name, StreamKind::Content, version).await?;
        let stream = serialization::read(raw.as_ref(), self.content_serializer.clone()).await?;
        Ok(stream.map(|row| row.map(|c: ContentRecord<TK, SK, TV>| (c.target_key, c.value))).boxed())
    }
}

/// A type-erased stage, used by [`update_targets`] to drive a fan-out of
/// otherwise differently-typed stages across a [`crate::registry::StageRegistry`].
#[async_trait]
pub trait DynStage: Send + Sync {
    /// This stage's registered name.
    fn name(&self) -> &str;

    /// See [`Stage::update_from_sources`].
    async fn update_from_sources(
        &self,
        based_on_version: u64,
        cancel: &CancellationToken,
    ) -> StageResult<u64>;
}

#[async_trait]
impl<SK, SV, TK, TV, P> DynStage for Stage<SK, SV, TK, TV, P>
where
    SK: Clone + PartialEq + Send + Sync + Debug + Serialize + DeserializeOwned + 'static,
    SV: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    TK: Clone + PartialEq + Send + Sync + Debug + Serialize + DeserializeOwned + 'static,
    TV: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    P: Produce<SK, SV, TK, TV> + Send + Sync,
{
    fn name(&self) -> &str {
        Stage::name(self)
    }

    async fn update_from_sources(
        &self,
        based_on_version: u64,
        cancel: &CancellationToken,
    ) -> StageResult<u64> {
        Stage::update_from_sources(self, based_on_version, cancel).await
    }
}

/// Adapts a [`Stage`] as an upstream [`Feeder`] for its downstream stages:
/// `open_updates`/`open_content_values` read a fixed, already-published
/// version.
pub struct StageFeeder<SK, SV, TK, TV, P> {
    stage: Arc<Stage<SK, SV, TK, TV, P>>,
    version: u64,
}

impl<SK, SV, TK, TV, P> StageFeeder<SK, SV, TK, TV, P> {
    /// Wraps `stage`, fixed at `version`.
    pub fn new(stage: Arc<Stage<SK, SV, TK, TV, P>>, version: u64) -> Self {
        StageFeeder { stage, version }
    }
}

#[async_trait]
impl<SK, SV, TK, TV, P> Feeder<TK, TV> for StageFeeder<SK, SV, TK, TV, P>
where
    SK: Clone + PartialEq + Send + Sync + Debug + Serialize + DeserializeOwned + 'static,
    SV: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    TK: Clone + PartialEq + Send + Sync + Debug + Serialize + DeserializeOwned + 'static,
    TV: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    P: Produce<SK, SV, TK, TV> + Send + Sync,
{
    async fn open_updates(&self) -> StageResult<BoxStream<'static, StageResult<SourceUpdate<TK, TV>>>> {
        self.stage.read_updates(self.version).await
    }

    async fn open_content_values(&self) -> StageResult<BoxStream<'static, StageResult<(TK, TV)>>> {
        self.stage.read_content_values(self.version).await
    }
}

/// Drives `Stage::update_from_sources` across every *proper* transitive
/// downstream of `root` (`root` itself has already been updated directly,
/// by the caller, via `Stage::update`), in topological order, all at the
/// same `based_on_version` — the simplifying reading of §4.8's
/// `UpdateTargets` adopted here (see `DESIGN.md`: per-stage version
/// tracking is left to the persistence backend / caller, not modeled as
/// registry state).
pub async fn update_targets(
    registry: &crate::registry::StageRegistry,
    stages: &std::collections::HashMap<crate::registry::StageId, Arc<dyn DynStage>>,
    root: crate::registry::StageId,
    based_on_version: u64,
    cancel: &CancellationToken,
) -> StageResult<()> {
    for id in registry.topological_order(root) {
        if id == root {
            continue;
        }
        if let Some(stage) = stages.get(&id) {
            stage.update_from_sources(based_on_version, cancel).await?;
        }
    }
    Ok(())
}
