use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Semantic response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of entries.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Maximum total size of cached answer values in bytes.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Base TTL for new entries in seconds.
    #[serde(default = "default_ttl_base_secs")]
    pub ttl_base_secs: u64,

    /// Interval of the background expired-entry purge in seconds.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Semantic (similarity) lookup configuration.
    #[serde(default)]
    pub semantic: SemanticCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            ttl_base_secs: default_ttl_base_secs(),
            purge_interval_secs: default_purge_interval_secs(),
            semantic: SemanticCacheConfig::default(),
        }
    }
}

impl CacheConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::Validation(
                "cache.max_entries must be greater than 0".into(),
            ));
        }
        if self.max_bytes == 0 {
            return Err(ConfigError::Validation(
                "cache.max_bytes must be greater than 0".into(),
            ));
        }
        self.semantic.validate()
    }
}

/// Similarity-lookup parameters.
///
/// The acceptance threshold for an entry relaxes with its popularity:
/// `clamp(base - hit_count_boost * log2(1 + hit_count), min, max)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SemanticCacheConfig {
    /// Whether semantic lookups are performed at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Acceptance threshold for an entry that has never been hit.
    #[serde(default = "default_base_threshold")]
    pub base_threshold: f64,

    /// Floor of the adaptive threshold.
    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,

    /// Ceiling of the adaptive threshold.
    #[serde(default = "default_max_threshold")]
    pub max_threshold: f64,

    /// How strongly popularity relaxes the threshold.
    #[serde(default = "default_hit_count_boost")]
    pub hit_count_boost: f64,

    /// Size of the recently-touched-entry ring probed before a full scan.
    #[serde(default = "default_probe_window")]
    pub probe_window: usize,

    /// TTL extension per hit: `ttl_base * (1 + factor * min(hits, cap))`.
    #[serde(default = "default_ttl_hit_factor")]
    pub ttl_hit_factor: f64,

    /// Hit count beyond which the TTL stops growing.
    #[serde(default = "default_ttl_hit_cap")]
    pub ttl_hit_cap: u32,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_threshold: default_base_threshold(),
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            hit_count_boost: default_hit_count_boost(),
            probe_window: default_probe_window(),
            ttl_hit_factor: default_ttl_hit_factor(),
            ttl_hit_cap: default_ttl_hit_cap(),
        }
    }
}

impl SemanticCacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.base_threshold)
            || !(0.0..=1.0).contains(&self.min_threshold)
            || !(0.0..=1.0).contains(&self.max_threshold)
        {
            return Err(ConfigError::Validation(
                "cache.semantic thresholds must be within [0, 1]".into(),
            ));
        }
        if self.min_threshold > self.base_threshold || self.base_threshold > self.max_threshold {
            return Err(ConfigError::Validation(
                "cache.semantic thresholds must satisfy min <= base <= max".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    10_000
}

fn default_max_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_ttl_base_secs() -> u64 {
    3600
}

fn default_purge_interval_secs() -> u64 {
    300
}

fn default_base_threshold() -> f64 {
    0.88
}

fn default_min_threshold() -> f64 {
    0.78
}

fn default_max_threshold() -> f64 {
    0.95
}

fn default_hit_count_boost() -> f64 {
    0.01
}

fn default_probe_window() -> usize {
    128
}

fn default_ttl_hit_factor() -> f64 {
    0.1
}

fn default_ttl_hit_cap() -> u32 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misordered_thresholds_are_rejected() {
        let config = SemanticCacheConfig {
            base_threshold: 0.7,
            min_threshold: 0.8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
