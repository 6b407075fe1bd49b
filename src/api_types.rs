//! Wire types for the HTTP API.

use serde::{Deserialize, Serialize};

use crate::sources::SourceId;

/// Answer length/style mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    #[default]
    Concise,
    Detailed,
}

impl AnswerMode {
    /// Stable wire form, also used inside cache fingerprints.
    pub fn as_str(self) -> &'static str {
        match self {
            AnswerMode::Concise => "concise",
            AnswerMode::Detailed => "detailed",
        }
    }
}

/// Body of `POST /query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryRequest {
    /// The user's question.
    pub text: String,

    /// Answer mode; defaults to concise.
    #[serde(default)]
    pub mode: AnswerMode,

    /// Optional restriction to a subset of sources.
    #[serde(default)]
    pub sources: Option<Vec<SourceId>>,

    /// Optional tenant tag, folded into the cache fingerprint.
    #[serde(default)]
    pub tenant: Option<String>,

    /// Whether a semantically similar cached answer may be reused.
    #[serde(default = "default_true")]
    pub allow_semantic: bool,
}

fn default_true() -> bool {
    true
}

/// How the cache participated in producing an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheResult {
    /// Served from the cache by exact fingerprint.
    Exact,
    /// Served from the cache by embedding similarity.
    Semantic,
    /// Full pipeline execution.
    Miss,
    /// Full pipeline execution with no retrieved context (all sources failed).
    MissNoContext,
}

impl CacheResult {
    /// Stable label for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            CacheResult::Exact => "exact",
            CacheResult::Semantic => "semantic",
            CacheResult::Miss => "miss",
            CacheResult::MissNoContext => "miss_no_context",
        }
    }
}

/// A structured block of the answer, for rich chat front-ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerBlock {
    Section {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heading: Option<String>,
        body: String,
    },
    Divider,
}

/// Reference to a context document the answer drew on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based index matching the `[i]` markers in the context block.
    pub index: usize,
    pub source: SourceId,
    pub title: String,
    pub url: String,
}

/// Per-answer metrics echoed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Sources that contributed at least one ranked hit.
    pub sources_used: Vec<SourceId>,
    pub cache_result: CacheResult,
    /// Similarity of the matched entry, present on semantic hits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    /// True when some selected source was skipped, timed out, or failed.
    pub partial: bool,
}

/// Body of a successful `POST /query` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub blocks: Vec<AnswerBlock>,
    pub citations: Vec<Citation>,
    pub metrics: AnswerMetrics,
}

/// Body of `POST /invalidate`. Exactly one field must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvalidateRequest {
    /// Exact fingerprint to drop.
    #[serde(default)]
    pub key: Option<String>,

    /// Drop every entry whose normalized question starts with this prefix.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Body of a `POST /invalidate` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_request_defaults() {
        let request: QueryRequest =
            serde_json::from_str(r#"{"text": "printer offline"}"#).unwrap();
        assert_eq!(request.mode, AnswerMode::Concise);
        assert!(request.allow_semantic);
        assert!(request.sources.is_none());
        assert!(request.tenant.is_none());
    }

    #[test]
    fn unknown_request_fields_are_rejected() {
        let result: Result<QueryRequest, _> =
            serde_json::from_str(r#"{"text": "hi", "stream": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn cache_result_wire_form() {
        assert_eq!(
            serde_json::to_string(&CacheResult::MissNoContext).unwrap(),
            "\"miss_no_context\""
        );
    }

    #[test]
    fn answer_blocks_are_tagged() {
        let block = AnswerBlock::Section {
            heading: Some("Steps".to_string()),
            body: "Restart the spooler".to_string(),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "section");
        assert_eq!(
            serde_json::to_value(AnswerBlock::Divider).unwrap()["type"],
            "divider"
        );
    }
}
