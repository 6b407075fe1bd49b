//! Source identities and retrieval hit model.
//!
//! A source is a named corpus (ticket system, wiki, ERP knowledge base)
//! mapped 1:1 to a vector-store collection. The set of sources is closed:
//! it is declared at startup by the `vector_store.collections` config table
//! and nothing outside that set is ever queried.

use serde::{Deserialize, Serialize};

/// Opaque source identifier, e.g. `JIRA`, `CONFLUENCE`, `SAP`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The fields of a document the response builder consumes.
///
/// Source payloads arrive as free-form JSON; the vector-store adapter
/// extracts this record from them, and anything that fails extraction or
/// validation is dropped before ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitPayload {
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl HitPayload {
    /// Minimum-field validation applied to every hit before ranking.
    pub fn is_valid(&self) -> bool {
        !self.title.trim().is_empty()
            && !self.url.trim().is_empty()
            && !self.snippet.trim().is_empty()
    }
}

/// One raw search hit from a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub source: SourceId,
    pub doc_id: String,
    /// Cosine similarity against the query vector, in [-1, 1].
    pub score: f64,
    pub payload: HitPayload,
    /// Stored snippet embedding, when the store returns vectors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f64>>,
}

/// A hit after source weighting and deduplication.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub hit: Hit,
    /// `score * source_weight`.
    pub final_score: f64,
    /// Index of the duplicate group this hit won.
    pub dedup_group: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(title: &str, url: &str, snippet: &str) -> HitPayload {
        HitPayload {
            title: title.to_string(),
            url: url.to_string(),
            snippet: snippet.to_string(),
            updated_at: None,
        }
    }

    #[test]
    fn payload_validation_requires_all_fields() {
        assert!(payload("VPN setup", "https://wiki/vpn", "Install the client").is_valid());
        assert!(!payload("", "https://wiki/vpn", "Install the client").is_valid());
        assert!(!payload("VPN setup", "  ", "Install the client").is_valid());
        assert!(!payload("VPN setup", "https://wiki/vpn", "").is_valid());
    }
}
