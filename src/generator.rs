//! Instruction generator (`spec.md` §4.4): a single simultaneous forward
//! scan of prior KeyMappings and incoming source updates, invoking
//! `Produce` per source key and emitting typed instructions into the
//! content- and mapping-instruction sorters.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::stream::StreamExt;
use tokio::sync::Mutex;

use crate::bounded_sequence::bounded_values;
use crate::cursor::Cursor;
use crate::error::{StageError, StageResult};
use crate::instruction::{ContentInstruction, KeyMappingInstruction};
use crate::order::Comparator;
use crate::producer::Produce;
use crate::record::{KeyMapping, SourceUpdate, UpdateType};
use crate::sort::ExternalSorter;

/// Runs the generator over one stage's prior KeyMappings and incoming
/// source updates, writing instructions into `content_sorter` and
/// `mapping_sorter`.
pub async fn generate_instructions<SK, SV, TK, TV, P>(
    stage_name: &str,
    prior_mappings: Cursor<KeyMapping<SK, TK>>,
    source_updates: Cursor<SourceUpdate<SK, SV>>,
    producer: &P,
    source_comparator: Comparator<SK>,
    content_sorter: &mut ExternalSorter<ContentInstruction<TK, SK, TV>>,
    mapping_sorter: &mut ExternalSorter<KeyMappingInstruction<SK, TK>>,
) -> StageResult<()>
where
    SK: Clone + Send + Sync + std::fmt::Debug + 'static,
    SV: Clone + Send + Sync + 'static,
    TK: Clone + Send + Sync + 'static,
    TV: Clone + Send + Sync + 'static,
    P: Produce<SK, SV, TK, TV>,
{
    let mut mapping_cursor = prior_mappings;
    let source_cursor = Arc::new(Mutex::new(source_updates));

    loop {
        let key = {
            let guard = source_cursor.lock().await;
            if !guard.valid() {
                break;
            }
            guard.value().key.clone()
        };

        // Step 1: fast-forward through, then delete, every prior mapping
        // sharing `key`.
        while mapping_cursor.valid()
            && source_comparator.compare(&mapping_cursor.value().source_key, &key) == Ordering::Less
        {
            mapping_cursor.next().await?;
        }
        while mapping_cursor.valid()
            && source_comparator.compare(&mapping_cursor.value().source_key, &key) == Ordering::Equal
        {
            let mapping = mapping_cursor.value().clone();
            content_sorter
                .add(ContentInstruction {
                    target_key: mapping.target_key.clone(),
                    source_key: mapping.source_key.clone(),
                    value: None,
                    deletion: true,
                })
                .await?;
            mapping_sorter
                .add(KeyMappingInstruction {
                    source_key: mapping.source_key,
                    target_key: mapping.target_key,
                    deletion: true,
                })
                .await?;
            mapping_cursor.next().await?;
        }

        let update_type = { source_cursor.lock().await.value().update_type };

        if update_type == UpdateType::Delete {
            {
                let mut guard = source_cursor.lock().await;
                guard.next().await?;
            }
            let guard = source_cursor.lock().await;
            if guard.valid() && source_comparator.compare(&guard.value().key, &key) != Ordering::Greater {
                return Err(StageError::Ordering {
                    stage: stage_name.to_string(),
                    detail: format!(
                        "Delete for key {key:?} followed by another row with the same key"
                    ),
                });
            }
        } else {
            let first_value = {
                let mut guard = source_cursor.lock().await;
                let value = guard
                    .value()
                    .value
                    .clone()
                    .expect("non-delete source update missing value");
                guard.next().await?;
                value
            };

            let (values_stream, handle) =
                bounded_values(key.clone(), source_comparator.clone(), first_value, source_cursor.clone());

            let mut produced = producer.produce(&key, values_stream).await;
            while let Some((target_key, target_value)) = produced.next().await {
                content_sorter
                    .add(ContentInstruction {
                        target_key: target_key.clone(),
                        source_key: key.clone(),
                        value: Some(target_value),
                        deletion: false,
                    })
                    .await?;
                mapping_sorter
                    .add(KeyMappingInstruction {
                        source_key: key.clone(),
                        target_key,
                        deletion: false,
                    })
                    .await?;
            }

            if !handle.is_exhausted() {
                return Err(StageError::ProducerUnderconsumed {
                    stage: stage_name.to_string(),
                    key: format!("{key:?}"),
                });
            }

            let guard = source_cursor.lock().await;
            if guard.valid() && source_comparator.compare(&guard.value().key, &key) != Ordering::Greater {
                return Err(StageError::Ordering {
                    stage: stage_name.to_string(),
                    detail: format!("source updates for key {key:?} are not contiguous/sorted"),
                });
            }
        }
    }

    Ok(())
}
