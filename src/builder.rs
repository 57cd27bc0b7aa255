//! Attribute configuration and builder.
//!
//! [`AttributeConfig`] gathers every option of the store layers in one
//! serde-friendly struct. [`AttributeBuilder`] is the entry point for
//! creating attributes from it.

use crate::error::{Error, Result};
use attrstore_core::{
    ArrayStoreConfig, BufferGrowth, CompactionStrategy, GrowStrategy, RefLayout,
};
use attrstore_primitives::{
    MultiValueAttribute, MultiValueMapping, DEFAULT_GENERATION_LAG_WARNING,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// All options of a multi-value attribute.
///
/// Missing fields take their defaults when deserialized.
///
/// # Example
///
/// ```
/// use attrstore::AttributeConfig;
///
/// let config = AttributeConfig::from_json(r#"{ "max_small_array_size": 16 }"#).unwrap();
/// assert_eq!(config.max_small_array_size, 16);
/// assert!(!config.enable_free_lists);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
    /// Arrays up to this length are stored inline in per-length buffers
    pub max_small_array_size: usize,
    /// Reference bit split
    pub ref_layout: RefLayout,
    /// Sizing of new value buffers
    pub buffer_growth: BufferGrowth,
    /// Recycle trimmed slots for new arrays of the same length
    pub enable_free_lists: bool,
    /// Growth of the doc id index
    pub grow_strategy: GrowStrategy,
    /// When dead space warrants compaction
    pub compaction: CompactionStrategy,
    /// Generation lag at which commits warn about stalled readers
    pub generation_lag_warning: u64,
}

impl AttributeConfig {
    /// Settings for many small attributes.
    ///
    /// Buffers and the doc id index start small and grow by half.
    pub fn small_footprint() -> Self {
        AttributeConfig {
            buffer_growth: BufferGrowth {
                min_arrays: 64,
                grow_percent: 50,
                ..BufferGrowth::default()
            },
            grow_strategy: GrowStrategy::new(64, 50, 0),
            ..Self::default()
        }
    }

    /// Settings for attributes whose values are rewritten often.
    ///
    /// Trimmed slots are recycled and compaction starts at half the
    /// default dead ratio.
    pub fn high_churn() -> Self {
        AttributeConfig {
            enable_free_lists: true,
            compaction: CompactionStrategy::new(0.1, 0.1),
            ..Self::default()
        }
    }

    /// Parse a config from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AttributeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Render the config as JSON text.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::from)
    }

    /// Array store options carried by this config.
    pub fn array_store_config(&self) -> ArrayStoreConfig {
        ArrayStoreConfig {
            max_small_array_size: self.max_small_array_size,
            ref_layout: self.ref_layout,
            growth: self.buffer_growth,
            enable_free_lists: self.enable_free_lists,
        }
    }

    /// Check every option.
    pub fn validate(&self) -> Result<()> {
        self.array_store_config().validate()?;
        self.grow_strategy.validate()?;
        self.compaction.validate()?;
        if self.generation_lag_warning == 0 {
            return Err(Error::InvalidConfig(
                "generation_lag_warning must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AttributeConfig {
    fn default() -> Self {
        let array_store = ArrayStoreConfig::default();
        AttributeConfig {
            max_small_array_size: array_store.max_small_array_size,
            ref_layout: array_store.ref_layout,
            buffer_growth: array_store.growth,
            enable_free_lists: array_store.enable_free_lists,
            grow_strategy: GrowStrategy::default(),
            compaction: CompactionStrategy::default(),
            generation_lag_warning: DEFAULT_GENERATION_LAG_WARNING,
        }
    }
}

/// Builder for multi-value attributes.
///
/// # Example
///
/// ```
/// use attrstore::AttributeBuilder;
///
/// let attr = AttributeBuilder::new("tags")
///     .max_small_array_size(4)
///     .free_lists(true)
///     .build::<u32>()
///     .unwrap();
/// let doc = attr.add_doc();
/// attr.set(doc, &[1, 2, 3]);
/// attr.commit();
/// assert_eq!(attr.read().get(doc), &[1, 2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct AttributeBuilder {
    name: String,
    config: AttributeConfig,
}

impl AttributeBuilder {
    /// Create a builder with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: AttributeConfig::default(),
        }
    }

    /// Replace every option with `config`.
    pub fn config(mut self, config: AttributeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the [`AttributeConfig::small_footprint`] preset.
    pub fn small_footprint(self) -> Self {
        self.config(AttributeConfig::small_footprint())
    }

    /// Use the [`AttributeConfig::high_churn`] preset.
    pub fn high_churn(self) -> Self {
        self.config(AttributeConfig::high_churn())
    }

    /// Set the longest array stored inline.
    pub fn max_small_array_size(mut self, max_small_array_size: usize) -> Self {
        self.config.max_small_array_size = max_small_array_size;
        self
    }

    /// Set the reference bit split.
    pub fn ref_layout(mut self, ref_layout: RefLayout) -> Self {
        self.config.ref_layout = ref_layout;
        self
    }

    /// Set the sizing of new value buffers.
    pub fn buffer_growth(mut self, growth: BufferGrowth) -> Self {
        self.config.buffer_growth = growth;
        self
    }

    /// Recycle trimmed slots.
    pub fn free_lists(mut self, enable: bool) -> Self {
        self.config.enable_free_lists = enable;
        self
    }

    /// Set the growth of the doc id index.
    pub fn grow_strategy(mut self, grow: GrowStrategy) -> Self {
        self.config.grow_strategy = grow;
        self
    }

    /// Set the compaction thresholds.
    pub fn compaction(mut self, compaction: CompactionStrategy) -> Self {
        self.config.compaction = compaction;
        self
    }

    /// Set the generation lag at which commits warn.
    pub fn generation_lag_warning(mut self, lag: u64) -> Self {
        self.config.generation_lag_warning = lag;
        self
    }

    /// Options collected so far.
    pub fn current_config(&self) -> &AttributeConfig {
        &self.config
    }

    /// Create a bare mapping for single-threaded use.
    pub fn build_mapping<T: Copy + Send + Sync + 'static>(&self) -> Result<MultiValueMapping<T>> {
        self.config.validate()?;
        let mapping =
            MultiValueMapping::new(self.config.array_store_config(), self.config.grow_strategy)?;
        Ok(mapping)
    }

    /// Create the attribute.
    pub fn build<T: Copy + Send + Sync + 'static>(self) -> Result<MultiValueAttribute<T>> {
        let mapping = self.build_mapping::<T>()?;
        let attribute = MultiValueAttribute::new(self.name, mapping, self.config.compaction);
        attribute.set_generation_lag_warning(self.config.generation_lag_warning);
        info!(
            attribute = attribute.name(),
            max_small_array_size = self.config.max_small_array_size,
            free_lists = self.config.enable_free_lists,
            "created attribute"
        );
        Ok(attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AttributeConfig::default().validate().is_ok());
        assert!(AttributeConfig::small_footprint().validate().is_ok());
        assert!(AttributeConfig::high_churn().validate().is_ok());
    }

    #[test]
    fn test_json_round_trip_keeps_options() {
        let config = AttributeConfig {
            max_small_array_size: 3,
            ..AttributeConfig::high_churn()
        };
        let parsed = AttributeConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_json_partial_nested_fields() {
        let config = AttributeConfig::from_json(
            r#"{ "ref_layout": { "offset_bits": 22, "buffer_bits": 10 },
                 "compaction": { "max_dead_bytes_ratio": 0.5 } }"#,
        )
        .unwrap();
        assert_eq!(config.ref_layout, RefLayout::new(22, 10).unwrap());
        assert_eq!(config.compaction.max_dead_bytes_ratio, 0.5);
        assert_eq!(
            config.compaction.dead_bytes_slack,
            CompactionStrategy::default().dead_bytes_slack
        );
    }

    #[test]
    fn test_invalid_json_rejected() {
        let err = AttributeConfig::from_json("{ not json").unwrap_err();
        assert!(err.is_serialization_error());

        let err = AttributeConfig::from_json(r#"{ "max_small_array_size": 100000 }"#).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_aligned_layout_rejected() {
        let err = AttributeBuilder::new("a")
            .ref_layout(RefLayout::aligned(19, 13, 2).unwrap())
            .build::<u32>()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLayout(_)));
    }

    #[test]
    fn test_zero_lag_warning_rejected() {
        let err = AttributeBuilder::new("a")
            .generation_lag_warning(0)
            .build::<u8>()
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_builder_applies_options() {
        let builder = AttributeBuilder::new("a")
            .small_footprint()
            .max_small_array_size(2)
            .free_lists(true);
        assert_eq!(builder.current_config().max_small_array_size, 2);
        assert_eq!(builder.current_config().buffer_growth.min_arrays, 64);

        let mapping = builder.build_mapping::<u16>().unwrap();
        assert_eq!(mapping.array_store().max_small_array_size(), 2);
        assert!(mapping.array_store().config().enable_free_lists);

        let attr = builder.build::<u16>().unwrap();
        assert_eq!(attr.name(), "a");
    }
}
