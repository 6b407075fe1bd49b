use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Embedding provider configuration.
///
/// The embedding client speaks the OpenAI-compatible `/embeddings` wire
/// format; any provider exposing that shape works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// Embedding vector dimension. Every vector entering the system must
    /// have exactly this many components.
    pub dim: usize,

    /// Base URL of the embedding provider.
    pub provider_url: String,

    /// API key sent as a bearer token. Optional for local providers.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model identifier passed to the provider.
    #[serde(default = "default_model")]
    pub model: String,

    /// Capacity of the in-process text → vector LRU.
    #[serde(default = "default_lru_capacity")]
    pub lru_capacity: usize,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl EmbeddingConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.dim == 0 {
            return Err(ConfigError::Validation(
                "embedding.dim must be greater than 0".into(),
            ));
        }
        if self.provider_url.is_empty() {
            return Err(ConfigError::Validation(
                "embedding.provider_url cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_lru_capacity() -> usize {
    2048
}

fn default_timeout_secs() -> u64 {
    10
}
