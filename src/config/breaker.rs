use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Circuit breaker configuration, applied per dependency (each source and
/// the LLM get their own breaker instance).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    /// Whether breakers are enforced at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Absolute failure weight within the window that trips the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Failure rate within the window that trips the breaker.
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,

    /// Number of recent call outcomes considered.
    #[serde(default = "default_window")]
    pub window: usize,

    /// Cool-down before an open breaker admits a probe, in milliseconds.
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,

    /// Cap on the doubled cool-down after repeated failed probes.
    #[serde(default = "default_max_cool_down_ms")]
    pub max_cool_down_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            failure_rate: default_failure_rate(),
            window: default_window(),
            cool_down_ms: default_cool_down_ms(),
            max_cool_down_ms: default_max_cool_down_ms(),
        }
    }
}

impl BreakerConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 {
            return Err(ConfigError::Validation(
                "breaker.window must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::Validation(
                "breaker.failure_rate must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_rate() -> f64 {
    0.5
}

fn default_window() -> usize {
    20
}

fn default_cool_down_ms() -> u64 {
    30_000
}

fn default_max_cool_down_ms() -> u64 {
    300_000
}
