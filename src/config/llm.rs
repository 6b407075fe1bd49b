use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Completion provider kind.
///
/// Two wire formats are supported; additional providers are an extension
/// point behind the same adapter trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    /// OpenAI-compatible `/chat/completions` endpoint.
    OpenAi,
    /// Anthropic `/v1/messages` endpoint.
    Anthropic,
}

/// Completion provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// Which wire format the provider speaks.
    #[serde(default = "default_provider")]
    pub provider: LlmProviderKind,

    /// Base URL of the provider.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// API key. Optional for local providers.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            attempt_timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl LlmConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::Validation(
                "llm.base_url cannot be empty".into(),
            ));
        }
        if self.model.is_empty() {
            return Err(ConfigError::Validation("llm.model cannot be empty".into()));
        }
        Ok(())
    }
}

/// Retry policy for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of retries (not counting the initial attempt).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random jitter applied to each delay, as a fraction of the delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Backoff delay for a given retry attempt (0-indexed), with jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let base = (self.initial_delay_ms as f64) * 2f64.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let jitter_range = capped * self.jitter;
        let jitter = if jitter_range > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        std::time::Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

fn default_provider() -> LlmProviderKind {
    LlmProviderKind::OpenAi
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_jitter() -> f64 {
    0.2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let config = RetryConfig {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(0).as_millis(), 250);
        assert_eq!(config.delay_for_attempt(1).as_millis(), 500);
        assert_eq!(config.delay_for_attempt(4).as_millis(), 2_000);
    }

    #[test]
    fn jitter_stays_within_range() {
        let config = RetryConfig::default();
        for attempt in 0..3 {
            let delay = config.delay_for_attempt(attempt).as_millis() as f64;
            let base = (250f64 * 2f64.powi(attempt as i32)).min(2_000.0);
            assert!(delay >= base * 0.8 - 1.0 && delay <= base * 1.2 + 1.0);
        }
    }
}
