//! Instruction executor for Content, with delta derivation (`spec.md`
//! §4.6). The densest subsystem in the engine: a k-way merge of prior
//! Content and content-instructions under `(TK, SK)`, plus a
//! [`PendingDelete`] state machine that collapses raw instruction-derived
//! deltas down to "per key: exactly one Delete, or one-or-more Add/Update."

use std::cmp::Ordering;
use std::sync::Arc;

use crate::cursor::Cursor;
use crate::error::{StageError, StageResult};
use crate::instruction::ContentInstruction;
use crate::order::Comparator;
use crate::record::{ContentRecord, SourceUpdate};
use crate::serialization::BatchedWriter;

/// User hook carrying identity fields (e.g. an assigned id) across a
/// deletion/re-add of the same target key (`spec.md` §6).
pub type PreserveKeyValues<TV> = Arc<dyn Fn(&TV, Option<&TV>) -> TV + Send + Sync>;

/// Tracks whether a downstream `Delete` is still pending for some `TK`, and
/// cancels it the instant an upsert for the same `TK` arrives. See the
/// state table in `spec.md` §4.6.
enum PendingDelete<TK> {
    None,
    Requested(TK),
    RuledOut(TK),
}

impl<TK: Clone + PartialEq> PendingDelete<TK> {
    fn new() -> Self {
        PendingDelete::None
    }

    /// Returns `Some(t)` when a previously requested delete for a
    /// *different* key `t` must now be emitted.
    fn send_delete(&mut self, k: TK) -> Option<TK> {
        let (next, flushed) = match std::mem::replace(self, PendingDelete::None) {
            PendingDelete::None => (PendingDelete::Requested(k), None),
            PendingDelete::Requested(t) => {
                if k == t {
                    (PendingDelete::Requested(t), None)
                } else {
                    (PendingDelete::Requested(k), Some(t))
                }
            }
            PendingDelete::RuledOut(t) => {
                if k == t {
                    (PendingDelete::RuledOut(t), None)
                } else {
                    (PendingDelete::Requested(k), None)
                }
            }
        };
        *self = next;
        flushed
    }

    /// Always signals that `Update(k)` should be emitted by the caller;
    /// returns `Some(t)` when a pending delete for a different key `t` must
    /// also be flushed first.
    fn send_upsert(&mut self, k: TK) -> Option<TK> {
        let (next, flushed) = match std::mem::replace(self, PendingDelete::None) {
            PendingDelete::None => (PendingDelete::None, None),
            PendingDelete::Requested(t) => {
                if k == t {
                    (PendingDelete::RuledOut(t), None)
                } else {
                    (PendingDelete::None, Some(t))
                }
            }
            PendingDelete::RuledOut(t) => {
                if k == t {
                    (PendingDelete::RuledOut(t), None)
                } else {
                    (PendingDelete::None, None)
                }
            }
        };
        *self = next;
        flushed
    }

    /// Flushes any still-pending delete at the end of the pass.
    fn finish(&mut self) -> Option<TK> {
        match std::mem::replace(self, PendingDelete::None) {
            PendingDelete::Requested(t) => Some(t),
            _ => None,
        }
    }
}

/// The two most recently touched instruction target keys. A touched
/// existing row whose `TargetKey` matches either slot also gets an upsert
/// delta emitted for it, carrying full-list-of-values semantics downstream.
/// See `spec.md` §4.6 "why the window is two."
struct RecentTargetKeys<TK> {
    slots: [Option<TK>; 2],
}

impl<TK: PartialEq + Clone> RecentTargetKeys<TK> {
    fn new() -> Self {
        RecentTargetKeys { slots: [None, None] }
    }

    fn note(&mut self, tk: TK) {
        if self.slots[1].as_ref() == Some(&tk) {
            return;
        }
        self.slots[0] = self.slots[1].take();
        self.slots[1] = Some(tk);
    }

    fn contains(&self, tk: &TK) -> bool {
        self.slots.iter().flatten().any(|s| s == tk)
    }
}

/// A ≤2-slot exemplar cache of recently seen existing Content values, keyed
/// by target key, backing [`PreserveKeyValues`].
struct ExemplarCache<TK, TV> {
    slots: [Option<(TK, TV)>; 2],
}

impl<TK: PartialEq + Clone, TV: Clone> ExemplarCache<TK, TV> {
    fn new() -> Self {
        ExemplarCache { slots: [None, None] }
    }

    fn note(&mut self, tk: TK, value: TV) {
        self.slots[0] = self.slots[1].take();
        self.slots[1] = Some((tk, value));
    }

    fn lookup(&self, tk: &TK) -> Option<&TV> {
        self.slots.iter().flatten().find(|(k, _)| k == tk).map(|(_, v)| v)
    }
}

fn pair_cmp<TK, SK>(
    target_comparator: &Comparator<TK>,
    source_comparator: &Comparator<SK>,
    tk_a: &TK,
    sk_a: &SK,
    tk_b: &TK,
    sk_b: &SK,
) -> Ordering {
    match target_comparator.compare(tk_a, tk_b) {
        Ordering::Equal => source_comparator.compare(sk_a, sk_b),
        ord => ord,
    }
}

/// Runs the Content executor, writing the new Content stream through
/// `content_out` and, if present, the derived delta stream through
/// `delta_out`.
pub async fn execute<TK, SK, TV>(
    stage_name: &str,
    mut prior: Cursor<ContentRecord<TK, SK, TV>>,
    mut instructions: Cursor<ContentInstruction<TK, SK, TV>>,
    target_comparator: Comparator<TK>,
    source_comparator: Comparator<SK>,
    preserve_key_values: Option<PreserveKeyValues<TV>>,
    mut content_out: BatchedWriter<'_, ContentRecord<TK, SK, TV>>,
    mut delta_out: Option<BatchedWriter<'_, SourceUpdate<TK, TV>>>,
) -> StageResult<()>
where
    TK: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static,
    SK: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static,
    TV: Clone + Send + Sync + 'static,
{
    let mut pending = PendingDelete::new();
    let mut recent_instruction_tks: RecentTargetKeys<TK> = RecentTargetKeys::new();
    let mut exemplars: ExemplarCache<TK, TV> = ExemplarCache::new();

    macro_rules! emit_delete {
        ($tk:expr) => {
            if let Some(writer) = delta_out.as_mut() {
                writer.push(SourceUpdate::delete($tk)).await?;
            }
        };
    }
    macro_rules! emit_update {
        ($tk:expr, $tv:expr) => {
            if let Some(writer) = delta_out.as_mut() {
                writer.push(SourceUpdate::update($tk, $tv)).await?;
            }
        };
    }

    loop {
        match (prior.valid(), instructions.valid()) {
            (false, false) => break,
            (true, false) => {
                handle_existing_precedes(
                    &mut prior,
                    &recent_instruction_tks,
                    &mut exemplars,
                    &mut pending,
                    &mut content_out,
                    &mut delta_out,
                )
                .await?;
            }
            (false, true) => {
                handle_instruction_precedes(
                    stage_name,
                    &mut instructions,
                    &source_comparator,
                    &target_comparator,
                    &preserve_key_values,
                    &exemplars,
                    &mut recent_instruction_tks,
                    &mut pending,
                    &mut content_out,
                    &mut delta_out,
                )
                .await?;
            }
            (true, true) => {
                let existing = prior.value();
                let instr = instructions.value();
                let ord = pair_cmp(
                    &target_comparator,
                    &source_comparator,
                    &existing.target_key,
                    &existing.source_key,
                    &instr.target_key,
                    &instr.source_key,
                );
                match ord {
                    Ordering::Less => {
                        handle_existing_precedes(
                            &mut prior,
                            &recent_instruction_tks,
                            &mut exemplars,
                            &mut pending,
                            &mut content_out,
                            &mut delta_out,
                        )
                        .await?;
                    }
                    Ordering::Greater => {
                        handle_instruction_precedes(
                            stage_name,
                            &mut instructions,
                            &source_comparator,
                            &target_comparator,
                            &preserve_key_values,
                            &exemplars,
                            &mut recent_instruction_tks,
                            &mut pending,
                            &mut content_out,
                            &mut delta_out,
                        )
                        .await?;
                    }
                    Ordering::Equal => {
                        let tk = existing.target_key.clone();
                        let sk = existing.source_key.clone();
                        // (a) discard every existing row matching (TK, SK).
                        while prior.valid()
                            && pair_cmp(
                                &target_comparator,
                                &source_comparator,
                                &prior.value().target_key,
                                &prior.value().source_key,
                                &tk,
                                &sk,
                            ) == Ordering::Equal
                        {
                            exemplars.note(prior.value().target_key.clone(), prior.value().value.clone());
                            prior.next().await?;
                        }
                        // (b) process every instruction matching (TK, SK).
                        while instructions.valid()
                            && pair_cmp(
                                &target_comparator,
                                &source_comparator,
                                &instructions.value().target_key,
                                &instructions.value().source_key,
                                &tk,
                                &sk,
                            ) == Ordering::Equal
                        {
                            let instr = instructions.value().clone();
                            recent_instruction_tks.note(instr.target_key.clone());
                            if instr.deletion {
                                if let Some(flushed) = pending.send_delete(instr.target_key.clone()) {
                                    emit_delete!(flushed);
                                }
                            } else {
                                let raw_value = instr.value.expect("non-deletion instruction missing value");
                                let final_value = match &preserve_key_values {
                                    Some(hook) => hook(&raw_value, exemplars.lookup(&instr.target_key)),
                                    None => raw_value,
                                };
                                content_out
                                    .push(ContentRecord {
                                        target_key: instr.target_key.clone(),
                                        source_key: instr.source_key.clone(),
                                        value: final_value.clone(),
                                    })
                                    .await?;
                                if let Some(flushed) = pending.send_upsert(instr.target_key.clone()) {
                                    emit_delete!(flushed);
                                }
                                emit_update!(instr.target_key.clone(), final_value);
                            }
                            instructions.next().await?;
                        }
                    }
                }
            }
        }
    }

    if let Some(t) = pending.finish() {
        emit_delete!(t);
    }

    content_out.finish().await?;
    if let Some(writer) = delta_out {
        writer.finish().await?;
    }
    Ok(())
}

/// Case 2 of §4.6: the instruction cursor's `(TK, SK)` has no match in
/// prior Content.
#[allow(clippy::too_many_arguments)]
async fn handle_instruction_precedes<TK, SK, TV>(
    stage_name: &str,
    instructions: &mut Cursor<ContentInstruction<TK, SK, TV>>,
    source_comparator: &Comparator<SK>,
    target_comparator: &Comparator<TK>,
    preserve_key_values: &Option<PreserveKeyValues<TV>>,
    exemplars: &ExemplarCache<TK, TV>,
    recent_instruction_tks: &mut RecentTargetKeys<TK>,
    pending: &mut PendingDelete<TK>,
    content_out: &mut BatchedWriter<'_, ContentRecord<TK, SK, TV>>,
    delta_out: &mut Option<BatchedWriter<'_, SourceUpdate<TK, TV>>>,
) -> StageResult<()>
where
    TK: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static,
    SK: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static,
    TV: Clone + Send + Sync + 'static,
{
    let _ = (source_comparator, target_comparator);
    let instr = instructions.value().clone();
    recent_instruction_tks.note(instr.target_key.clone());
    if instr.deletion {
        return Err(StageError::UnexpectedDeletion {
            stage: stage_name.to_string(),
            target: format!("{:?}", instr.target_key),
            source: format!("{:?}", instr.source_key),
        });
    }
    let raw_value = instr.value.expect("non-deletion instruction missing value");
    let final_value = match preserve_key_values {
        Some(hook) => hook(&raw_value, exemplars.lookup(&instr.target_key)),
        None => raw_value,
    };
    content_out
        .push(ContentRecord {
            target_key: instr.target_key.clone(),
            source_key: instr.source_key.clone(),
            value: final_value.clone(),
        })
        .await?;
    if let Some(flushed) = pending.send_upsert(instr.target_key.clone()) {
        if let Some(writer) = delta_out.as_mut() {
            writer.push(SourceUpdate::delete(flushed)).await?;
        }
    }
    if let Some(writer) = delta_out.as_mut() {
        writer.push(SourceUpdate::update(instr.target_key, final_value)).await?;
    }
    instructions.next().await
}

/// Case 3 of §4.6: the existing cursor's `(TK, SK)` has no match in the
/// instruction stream.
async fn handle_existing_precedes<TK, SK, TV>(
    prior: &mut Cursor<ContentRecord<TK, SK, TV>>,
    recent_instruction_tks: &RecentTargetKeys<TK>,
    exemplars: &mut ExemplarCache<TK, TV>,
    pending: &mut PendingDelete<TK>,
    content_out: &mut BatchedWriter<'_, ContentRecord<TK, SK, TV>>,
    delta_out: &mut Option<BatchedWriter<'_, SourceUpdate<TK, TV>>>,
) -> StageResult<()>
where
    TK: Clone + PartialEq + Send + Sync + 'static,
    SK: Clone + Send + Sync + 'static,
    TV: Clone + Send + Sync + 'static,
{
    let row = prior.value().clone();
    exemplars.note(row.target_key.clone(), row.value.clone());
    content_out.push(row.clone()).await?;
    if recent_instruction_tks.contains(&row.target_key) {
        if let Some(flushed) = pending.send_upsert(row.target_key.clone()) {
            if let Some(writer) = delta_out.as_mut() {
                writer.push(SourceUpdate::delete(flushed)).await?;
            }
        }
        if let Some(writer) = delta_out.as_mut() {
            writer.push(SourceUpdate::update(row.target_key, row.value)).await?;
        }
    }
    prior.next().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, StreamExt};
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    use crate::record::UpdateType;
    use crate::serialization::{BincodeSerializer, RecordSerializer, Writer};
    use crate::storage::memory::MemoryStream;

    async fn cursor_of<T: Send + Sync + 'static>(items: Vec<T>) -> Cursor<T> {
        Cursor::new(stream::iter(items.into_iter().map(Ok)).boxed()).await.unwrap()
    }

    struct RunResult<TK, SK, TV> {
        content: Vec<ContentRecord<TK, SK, TV>>,
        deltas: Vec<SourceUpdate<TK, TV>>,
    }

    async fn run<TV>(
        prior: Vec<ContentRecord<i32, i32, TV>>,
        instructions: Vec<ContentInstruction<i32, i32, TV>>,
        preserve_key_values: Option<PreserveKeyValues<TV>>,
    ) -> StageResult<RunResult<i32, i32, TV>>
    where
        TV: Serialize + DeserializeOwned + Clone + Send + Sync + std::fmt::Debug + 'static,
    {
        let prior_cursor = cursor_of(prior).await;
        let instr_cursor = cursor_of(instructions).await;

        let content_serializer: Arc<dyn RecordSerializer<ContentRecord<i32, i32, TV>>> =
            Arc::new(BincodeSerializer);
        let delta_serializer: Arc<dyn RecordSerializer<SourceUpdate<i32, TV>>> = Arc::new(BincodeSerializer);
        let mut content_raw = MemoryStream::default();
        let mut delta_raw = MemoryStream::default();
        {
            let content_writer = Writer::new(&mut content_raw, content_serializer.as_ref());
            let content_batched = BatchedWriter::new(content_writer, 10);
            let delta_writer = Writer::new(&mut delta_raw, delta_serializer.as_ref());
            let delta_batched = BatchedWriter::new(delta_writer, 10);
            execute(
                "test-stage",
                prior_cursor,
                instr_cursor,
                Comparator::natural(),
                Comparator::natural(),
                preserve_key_values,
                content_batched,
                Some(delta_batched),
            )
            .await?;
        }
        let mut content_stream = crate::serialization::read(&content_raw, content_serializer).await?;
        let mut content = Vec::new();
        while let Some(row) = content_stream.next().await {
            content.push(row?);
        }
        let mut delta_stream = crate::serialization::read(&delta_raw, delta_serializer).await?;
        let mut deltas = Vec::new();
        while let Some(row) = delta_stream.next().await {
            deltas.push(row?);
        }
        Ok(RunResult { content, deltas })
    }

    fn keys<TV>(deltas: &[SourceUpdate<i32, TV>]) -> Vec<(UpdateType, i32)> {
        deltas.iter().map(|d| (d.update_type, d.key)).collect()
    }

    #[tokio::test]
    async fn passthrough_when_no_instructions() {
        let prior = vec![
            ContentRecord { target_key: 1, source_key: 1, value: "a".to_string() },
            ContentRecord { target_key: 2, source_key: 1, value: "b".to_string() },
        ];
        let result = run(prior, vec![], None).await.unwrap();
        assert_eq!(result.content.len(), 2);
        assert_eq!(result.content[0].value, "a");
        assert_eq!(result.content[1].value, "b");
        assert!(result.deltas.is_empty());
    }

    #[tokio::test]
    async fn deletion_instruction_with_no_prior_row_errors() {
        let instructions =
            vec![ContentInstruction { target_key: 1, source_key: 1, value: None, deletion: true }];
        let err = run::<String>(vec![], instructions, None).await.unwrap_err();
        assert!(matches!(err, StageError::UnexpectedDeletion { .. }));
    }

    #[tokio::test]
    async fn addition_instruction_with_no_prior_row_emits_content_and_update_delta() {
        let instructions = vec![ContentInstruction {
            target_key: 1,
            source_key: 1,
            value: Some("new".to_string()),
            deletion: false,
        }];
        let result = run(vec![], instructions, None).await.unwrap();
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.content[0].value, "new");
        assert_eq!(keys(&result.deltas), vec![(UpdateType::Update, 1)]);
    }

    #[tokio::test]
    async fn matching_deletion_removes_existing_row_and_emits_delete_delta() {
        let prior = vec![ContentRecord { target_key: 1, source_key: 1, value: "a".to_string() }];
        let instructions =
            vec![ContentInstruction { target_key: 1, source_key: 1, value: None, deletion: true }];
        let result = run(prior, instructions, None).await.unwrap();
        assert!(result.content.is_empty());
        assert_eq!(keys(&result.deltas), vec![(UpdateType::Delete, 1)]);
    }

    #[tokio::test]
    async fn delete_then_readd_same_target_key_cancels_pending_delete() {
        // Deletes (1, sk=1), then re-adds at (1, sk=2). The pending delete
        // for target key 1 must be ruled out by the later upsert: the delta
        // stream should carry only the Update, never a Delete.
        let prior = vec![ContentRecord { target_key: 1, source_key: 1, value: "a".to_string() }];
        let instructions = vec![
            ContentInstruction { target_key: 1, source_key: 1, value: None, deletion: true },
            ContentInstruction { target_key: 1, source_key: 2, value: Some("b".to_string()), deletion: false },
        ];
        let result = run(prior, instructions, None).await.unwrap();
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.content[0].source_key, 2);
        assert_eq!(keys(&result.deltas), vec![(UpdateType::Update, 1)]);
    }

    #[tokio::test]
    async fn existing_row_with_recently_touched_target_key_is_promoted_into_delta_stream() {
        // Two instructions touch target key 5; a third, untouched existing
        // row at the same target key sorts after them and must still be
        // promoted into the delta stream, since its key is in the window.
        let prior = vec![ContentRecord { target_key: 5, source_key: 3, value: "existing".to_string() }];
        let instructions = vec![
            ContentInstruction { target_key: 5, source_key: 1, value: Some("one".to_string()), deletion: false },
            ContentInstruction { target_key: 5, source_key: 2, value: Some("two".to_string()), deletion: false },
        ];
        let result = run(prior, instructions, None).await.unwrap();
        assert_eq!(result.content.len(), 3);
        assert_eq!(
            keys(&result.deltas),
            vec![(UpdateType::Update, 5), (UpdateType::Update, 5), (UpdateType::Update, 5)]
        );
    }

    #[tokio::test]
    async fn preserve_key_values_hook_carries_identity_across_delete_and_readd() {
        let prior = vec![ContentRecord { target_key: 1, source_key: 1, value: (100i32, "foo".to_string()) }];
        let instructions = vec![
            ContentInstruction { target_key: 1, source_key: 1, value: None, deletion: true },
            ContentInstruction {
                target_key: 1,
                source_key: 2,
                value: Some((0, "bar".to_string())),
                deletion: false,
            },
        ];
        let hook: PreserveKeyValues<(i32, String)> = Arc::new(|new_value, exemplar| match exemplar {
            Some((preserved_id, _)) => (*preserved_id, new_value.1.clone()),
            None => new_value.clone(),
        });
        let result = run(prior, instructions, Some(hook)).await.unwrap();
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.content[0].value, (100, "bar".to_string()));
        // The id-preserving re-add ruled out the pending delete: only the
        // Update with the carried-forward id survives.
        assert_eq!(result.deltas.len(), 1);
        assert_eq!(result.deltas[0].update_type, UpdateType::Update);
        assert_eq!(result.deltas[0].value.as_ref().unwrap(), &(100, "bar".to_string()));
    }
}
