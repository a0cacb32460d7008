//! Instruction executor for KeyMappings (`spec.md` §4.5).
//!
//! A k-way sorted merge of prior KeyMappings and mapping-instructions under
//! `(SK, TK)`, with the secondary tiebreak that instructions precede
//! existing rows at an identical `(SK, TK)`. Within a group sharing that
//! key pair: if the group's first row is an instruction, every instruction
//! in the group is processed (non-deletions emitted) and every existing row
//! in the group is discarded; otherwise the lone existing row is emitted
//! unchanged (two sorted inputs agreeing on `(SK, TK)` can only ever
//! contribute one existing row, since KeyMappings carries no further
//! dimension to disambiguate duplicates at identical key pairs).

use std::cmp::Ordering;

use crate::cursor::Cursor;
use crate::error::StageResult;
use crate::instruction::KeyMappingInstruction;
use crate::order::Comparator;
use crate::record::KeyMapping;
use crate::serialization::BatchedWriter;

/// Runs the KeyMappings executor, writing the new KeyMappings stream
/// through `output`.
pub async fn execute<SK, TK>(
    mut prior: Cursor<KeyMapping<SK, TK>>,
    mut instructions: Cursor<KeyMappingInstruction<SK, TK>>,
    source_comparator: Comparator<SK>,
    target_comparator: Comparator<TK>,
    mut output: BatchedWriter<'_, KeyMapping<SK, TK>>,
) -> StageResult<()>
where
    SK: Clone + Send + Sync + 'static,
    TK: Clone + Send + Sync + 'static,
{
    let pair_cmp = |sk_a: &SK, tk_a: &TK, sk_b: &SK, tk_b: &TK| -> Ordering {
        match source_comparator.compare(sk_a, sk_b) {
            Ordering::Equal => target_comparator.compare(tk_a, tk_b),
            ord => ord,
        }
    };

    loop {
        match (prior.valid(), instructions.valid()) {
            (false, false) => break,
            (true, false) => {
                output.push(prior.value().clone()).await?;
                prior.next().await?;
            }
            (false, true) => {
                process_instruction_group(&mut instructions, &pair_cmp, &mut output).await?;
            }
            (true, true) => {
                let existing = prior.value();
                let instr = instructions.value();
                match pair_cmp(&existing.source_key, &existing.target_key, &instr.source_key, &instr.target_key) {
                    Ordering::Less => {
                        output.push(existing.clone()).await?;
                        prior.next().await?;
                    }
                    Ordering::Greater => {
                        process_instruction_group(&mut instructions, &pair_cmp, &mut output).await?;
                    }
                    Ordering::Equal => {
                        // Instructions win the tiebreak: drain every
                        // instruction in this group, then skip the (single)
                        // matching existing row.
                        process_instruction_group(&mut instructions, &pair_cmp, &mut output).await?;
                        prior.next().await?;
                    }
                }
            }
        }
    }

    output.finish().await
}

/// Consumes every instruction sharing the current `(SK, TK)` group,
/// emitting a mapping for each non-deletion.
async fn process_instruction_group<SK, TK>(
    instructions: &mut Cursor<KeyMappingInstruction<SK, TK>>,
    pair_cmp: &impl Fn(&SK, &TK, &SK, &TK) -> Ordering,
    output: &mut BatchedWriter<'_, KeyMapping<SK, TK>>,
) -> StageResult<()>
where
    SK: Clone + Send + Sync + 'static,
    TK: Clone + Send + Sync + 'static,
{
    let anchor = instructions.value().clone();
    while instructions.valid()
        && pair_cmp(
            &instructions.value().source_key,
            &instructions.value().target_key,
            &anchor.source_key,
            &anchor.target_key,
        ) == Ordering::Equal
    {
        let instr = instructions.value().clone();
        if !instr.deletion {
            output
                .push(KeyMapping { source_key: instr.source_key, target_key: instr.target_key })
                .await?;
        }
        instructions.next().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, StreamExt};
    use std::sync::Arc;

    use crate::serialization::{BincodeSerializer, RecordSerializer, Writer};
    use crate::storage::memory::MemoryStream;

    async fn cursor_of<T: Send + Sync + 'static>(items: Vec<T>) -> Cursor<T> {
        Cursor::new(stream::iter(items.into_iter().map(Ok)).boxed()).await.unwrap()
    }

    async fn run(
        prior: Vec<KeyMapping<i32, i32>>,
        instructions: Vec<KeyMappingInstruction<i32, i32>>,
    ) -> Vec<KeyMapping<i32, i32>> {
        let prior_cursor = cursor_of(prior).await;
        let instr_cursor = cursor_of(instructions).await;
        let serializer: Arc<dyn RecordSerializer<KeyMapping<i32, i32>>> = Arc::new(BincodeSerializer);
        let mut raw = MemoryStream::default();
        {
            let writer = Writer::new(&mut raw, serializer.as_ref());
            let batched = BatchedWriter::new(writer, 10);
            execute(
                prior_cursor,
                instr_cursor,
                Comparator::natural(),
                Comparator::natural(),
                batched,
            )
            .await
            .unwrap();
        }
        let mut out = crate::serialization::read(&raw, serializer).await.unwrap();
        let mut result = Vec::new();
        while let Some(row) = out.next().await {
            result.push(row.unwrap());
        }
        result
    }

    #[tokio::test]
    async fn passthrough_when_no_instructions() {
        let prior = vec![
            KeyMapping { source_key: 1, target_key: 10 },
            KeyMapping { source_key: 2, target_key: 20 },
        ];
        let result = run(prior.clone(), vec![]).await;
        assert_eq!(result, prior);
    }

    #[tokio::test]
    async fn deletion_instruction_removes_existing_mapping() {
        let prior = vec![
            KeyMapping { source_key: 1, target_key: 10 },
            KeyMapping { source_key: 2, target_key: 20 },
        ];
        let instructions = vec![KeyMappingInstruction { source_key: 1, target_key: 10, deletion: true }];
        let result = run(prior, instructions).await;
        assert_eq!(result, vec![KeyMapping { source_key: 2, target_key: 20 }]);
    }

    #[tokio::test]
    async fn addition_instruction_with_no_prior_row_is_inserted() {
        let instructions = vec![KeyMappingInstruction { source_key: 3, target_key: 30, deletion: false }];
        let result = run(vec![], instructions).await;
        assert_eq!(result, vec![KeyMapping { source_key: 3, target_key: 30 }]);
    }

    #[tokio::test]
    async fn multiple_instructions_same_pair_all_processed() {
        // A delete followed by a re-add at the same (SK, TK): both process,
        // net effect is the mapping survives.
        let prior = vec![KeyMapping { source_key: 1, target_key: 10 }];
        let instructions = vec![
            KeyMappingInstruction { source_key: 1, target_key: 10, deletion: true },
            KeyMappingInstruction { source_key: 1, target_key: 10, deletion: false },
        ];
        let result = run(prior, instructions).await;
        assert_eq!(result, vec![KeyMapping { source_key: 1, target_key: 10 }]);
    }
}
