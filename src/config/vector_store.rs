use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::sources::SourceId;

/// Vector database configuration.
///
/// The keys of `collections` declare the closed set of sources the gateway
/// knows about; each source maps 1:1 to a collection in the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VectorStoreConfig {
    /// Vector store server URL (e.g. "http://localhost:6333").
    pub url: String,

    /// Optional API key, sent in the `api-key` header.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Source → collection name mapping. At least one entry is required.
    pub collections: BTreeMap<SourceId, String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl VectorStoreConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Validation(
                "vector_store.url cannot be empty".into(),
            ));
        }
        if self.collections.is_empty() {
            return Err(ConfigError::Validation(
                "vector_store.collections must declare at least one source".into(),
            ));
        }
        for (source, collection) in &self.collections {
            if collection.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "vector_store.collections.{source} cannot be empty"
                )));
            }
        }
        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    30
}
