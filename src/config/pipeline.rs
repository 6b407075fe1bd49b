use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::sources::SourceId;

/// Retrieval pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Hits requested from each source.
    #[serde(default = "default_top_k_per_source")]
    pub top_k_per_source: usize,

    /// Hits kept after merging and ranking.
    #[serde(default = "default_top_k_global")]
    pub top_k_global: usize,

    /// Overall deadline for one pipeline execution in milliseconds.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Per-source search timeout in milliseconds.
    #[serde(default = "default_per_source_timeout_ms")]
    pub per_source_timeout_ms: u64,

    /// Fan-out deadline in milliseconds, covering all sources together.
    #[serde(default = "default_fan_out_deadline_ms")]
    pub fan_out_deadline_ms: u64,

    /// Maximum source searches in flight at once.
    #[serde(default = "default_max_concurrent_sources")]
    pub max_concurrent_sources: usize,

    /// Token budget for the context block of the prompt.
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: usize,

    /// Per-source ranking weights. Sources without an entry weigh 1.0.
    #[serde(default)]
    pub source_weights: BTreeMap<SourceId, f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k_per_source: default_top_k_per_source(),
            top_k_global: default_top_k_global(),
            deadline_ms: default_deadline_ms(),
            per_source_timeout_ms: default_per_source_timeout_ms(),
            fan_out_deadline_ms: default_fan_out_deadline_ms(),
            max_concurrent_sources: default_max_concurrent_sources(),
            context_token_budget: default_context_token_budget(),
            source_weights: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k_per_source == 0 || self.top_k_global == 0 {
            return Err(ConfigError::Validation(
                "pipeline.top_k_per_source and top_k_global must be greater than 0".into(),
            ));
        }
        if self.max_concurrent_sources == 0 {
            return Err(ConfigError::Validation(
                "pipeline.max_concurrent_sources must be greater than 0".into(),
            ));
        }
        for (source, weight) in &self.source_weights {
            if *weight <= 0.0 || !weight.is_finite() {
                return Err(ConfigError::Validation(format!(
                    "pipeline.source_weights.{source} must be a positive number"
                )));
            }
        }
        Ok(())
    }

    /// Ranking weight for a source, defaulting to 1.0.
    pub fn source_weight(&self, source: &SourceId) -> f64 {
        self.source_weights.get(source).copied().unwrap_or(1.0)
    }
}

fn default_top_k_per_source() -> usize {
    10
}

fn default_top_k_global() -> usize {
    8
}

fn default_deadline_ms() -> u64 {
    25_000
}

fn default_per_source_timeout_ms() -> u64 {
    4_000
}

fn default_fan_out_deadline_ms() -> u64 {
    8_000
}

fn default_max_concurrent_sources() -> usize {
    6
}

fn default_context_token_budget() -> usize {
    2_000
}
