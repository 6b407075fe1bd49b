//! Configuration module for the answer gateway.
//!
//! The gateway is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [embedding]
//! dim = 1536
//! provider_url = "https://api.openai.com/v1"
//! api_key = "${EMBEDDING_API_KEY}"
//!
//! [vector_store]
//! url = "http://localhost:6333"
//!
//! [vector_store.collections]
//! JIRA = "helpdesk_jira"
//! CONFLUENCE = "helpdesk_confluence"
//! ```

mod breaker;
mod cache;
mod embedding;
mod llm;
mod observability;
mod pipeline;
mod server;
mod vector_store;

use std::{collections::BTreeMap, path::Path};

pub use breaker::*;
pub use cache::*;
pub use embedding::*;
pub use llm::*;
pub use observability::*;
pub use pipeline::*;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use vector_store::*;

use crate::sources::SourceId;

/// Root configuration for the answer gateway.
///
/// All sections except `embedding` and `vector_store` are optional with
/// sensible defaults. Unknown fields anywhere in the file are a load error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,

    /// Vector database configuration, including the closed set of sources.
    pub vector_store: VectorStoreConfig,

    /// Completion provider configuration.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Semantic response cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Retrieval pipeline configuration (fan-out, ranking, deadlines).
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Circuit breaker configuration, shared by all sources and the LLM.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Client routing table: recognised client keywords mapped to the
    /// sources that hold their documents.
    #[serde(default)]
    pub clients: BTreeMap<String, ClientRoutingConfig>,

    /// Observability configuration (logging, metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Routing entry for a recognised client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientRoutingConfig {
    /// Keywords that identify the client in question text (matched
    /// case-insensitively as substrings).
    pub keywords: Vec<String>,

    /// Sources searched when the client is recognised.
    pub sources: Vec<SourceId>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing variables cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: GatewayConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.vector_store.validate()?;
        self.llm.validate()?;
        self.cache.validate()?;
        self.pipeline.validate()?;
        self.breaker.validate()?;

        // Source weights and client routing may only reference declared sources.
        for source in self.pipeline.source_weights.keys() {
            if !self.vector_store.collections.contains_key(source) {
                return Err(ConfigError::Validation(format!(
                    "pipeline.source_weights references undeclared source '{source}'"
                )));
            }
        }
        for (client, routing) in &self.clients {
            if routing.keywords.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "clients.{client} must declare at least one keyword"
                )));
            }
            for source in &routing.sources {
                if !self.vector_store.collections.contains_key(source) {
                    return Err(ConfigError::Validation(format!(
                        "clients.{client} references undeclared source '{source}'"
                    )));
                }
            }
        }

        Ok(())
    }

    /// The closed set of sources, in declaration order.
    pub fn enabled_sources(&self) -> Vec<SourceId> {
        self.vector_store.collections.keys().cloned().collect()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand `${VAR_NAME}` references against the process environment.
fn expand_env_vars(contents: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(contents.len());
    let mut rest = contents;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference; keep the literal text.
            result.push_str(&rest[start..]);
            return Ok(result);
        };
        let name = &after[..end];
        let value =
            std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.to_string()))?;
        result.push_str(&value);
        rest = &after[end + 1..];
    }
    result.push_str(rest);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [embedding]
        dim = 1536
        provider_url = "http://localhost:9100"

        [vector_store]
        url = "http://localhost:6333"

        [vector_store.collections]
        JIRA = "helpdesk_jira"
        CONFLUENCE = "helpdesk_confluence"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = GatewayConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.pipeline.top_k_global, 8);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.enabled_sources().len(), 2);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let contents = format!("{MINIMAL}\n[cache]\nmax_entires = 5\n");
        let err = GatewayConfig::from_toml_str(&contents).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_vars_are_expanded() {
        // Test-only variable, never read elsewhere.
        unsafe { std::env::set_var("DESKGATE_TEST_KEY", "sk-test") };
        let contents = MINIMAL.replace(
            "provider_url = \"http://localhost:9100\"",
            "provider_url = \"http://localhost:9100\"\napi_key = \"${DESKGATE_TEST_KEY}\"",
        );
        let config = GatewayConfig::from_toml_str(&contents).unwrap();
        assert_eq!(config.embedding.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn missing_env_var_is_an_error() {
        let contents = MINIMAL.replace(
            "provider_url = \"http://localhost:9100\"",
            "provider_url = \"http://localhost:9100\"\napi_key = \"${DESKGATE_MISSING_VAR}\"",
        );
        let err = GatewayConfig::from_toml_str(&contents).unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarNotFound(_)));
    }

    #[test]
    fn undeclared_source_weight_is_rejected() {
        let contents = format!("{MINIMAL}\n[pipeline.source_weights]\nSAP = 2.0\n");
        let err = GatewayConfig::from_toml_str(&contents).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn client_routing_must_reference_declared_sources() {
        let contents = format!(
            "{MINIMAL}\n[clients.acme]\nkeywords = [\"acme\"]\nsources = [\"NETSUITE\"]\n"
        );
        let err = GatewayConfig::from_toml_str(&contents).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
