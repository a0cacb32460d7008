//! Stage configuration (`spec.md` §6 ambient addition, `SPEC_FULL.md` §6).
//!
//! `differential-dataflow` itself carries almost no runtime configuration —
//! a dataflow is built once and its `Config` lives at the `timely`
//! worker level, not per-operator. A stage here is configured once at
//! construction instead, so this follows the same configuration-light
//! spirit: a plain struct with a small builder, no environment parsing, no
//! reload.

use std::sync::Arc;

use crate::executor::content::PreserveKeyValues;
use crate::serialization::DEFAULT_ROWS_PER_GROUP;
use crate::sort::DEFAULT_GROUPS_PER_BATCH;

/// Tunables for one stage's productions.
pub struct StageConfig<TV> {
    /// Row group size for every persisted/temporary stream this stage
    /// writes. Default [`DEFAULT_ROWS_PER_GROUP`].
    pub rows_per_group: usize,
    /// Row groups buffered per sort batch before spilling. Default
    /// [`DEFAULT_GROUPS_PER_BATCH`], giving the spec's 2,000,000-row default
    /// batch capacity.
    pub groups_per_batch: usize,
    /// Optional identity-preserving hook consulted by the Content executor
    /// when emitting an add-instruction (`spec.md` §6).
    pub preserve_key_values: Option<PreserveKeyValues<TV>>,
}

impl<TV> StageConfig<TV> {
    /// Starts a builder seeded with the spec's defaults.
    pub fn builder() -> StageConfigBuilder<TV> {
        StageConfigBuilder::default()
    }

    /// Total rows buffered in memory before the external sorter spills a
    /// batch.
    pub fn batch_capacity(&self) -> usize {
        self.rows_per_group * self.groups_per_batch
    }
}

impl<TV> Default for StageConfig<TV> {
    fn default() -> Self {
        StageConfig::builder().build()
    }
}

/// Builder for [`StageConfig`].
pub struct StageConfigBuilder<TV> {
    rows_per_group: usize,
    groups_per_batch: usize,
    preserve_key_values: Option<PreserveKeyValues<TV>>,
}

impl<TV> Default for StageConfigBuilder<TV> {
    fn default() -> Self {
        StageConfigBuilder {
            rows_per_group: DEFAULT_ROWS_PER_GROUP,
            groups_per_batch: DEFAULT_GROUPS_PER_BATCH,
            preserve_key_values: None,
        }
    }
}

impl<TV> StageConfigBuilder<TV> {
    /// Overrides the row group size.
    pub fn rows_per_group(mut self, rows_per_group: usize) -> Self {
        self.rows_per_group = rows_per_group;
        self
    }

    /// Overrides the number of row groups buffered per sort batch.
    pub fn groups_per_batch(mut self, groups_per_batch: usize) -> Self {
        self.groups_per_batch = groups_per_batch;
        self
    }

    /// Installs a `PreserveKeyValues` hook.
    pub fn preserve_key_values(mut self, hook: Arc<dyn Fn(&TV, Option<&TV>) -> TV + Send + Sync>) -> Self {
        self.preserve_key_values = Some(hook);
        self
    }

    /// Builds the final config.
    pub fn build(self) -> StageConfig<TV> {
        StageConfig {
            rows_per_group: self.rows_per_group,
            groups_per_batch: self.groups_per_batch,
            preserve_key_values: self.preserve_key_values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config: StageConfig<i32> = StageConfig::default();
        assert_eq!(config.rows_per_group, 100_000);
        assert_eq!(config.groups_per_batch, 20);
        assert_eq!(config.batch_capacity(), 2_000_000);
        assert!(config.preserve_key_values.is_none());
    }

    #[test]
    fn builder_overrides_apply() {
        let config: StageConfig<i32> =
            StageConfig::builder().rows_per_group(10).groups_per_batch(2).build();
        assert_eq!(config.batch_capacity(), 20);
    }
}
