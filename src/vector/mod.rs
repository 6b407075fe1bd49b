//! Vector store adapter.
//!
//! A thin client over a Qdrant-style HTTP API. Every retrieval source maps
//! to one named collection; the query engine searches several collections
//! in parallel with the same query vector.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    breaker::CallOutcome,
    config::VectorStoreConfig,
    observability::metrics,
    sources::HitPayload,
};

/// Errors from vector store operations.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("vector store returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse vector store response: {0}")]
    Serialization(String),

    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl VectorStoreError {
    /// How this error counts against the source's circuit breaker.
    /// `None` means the call is not recorded (caller mistakes and internal
    /// invariant violations are not the dependency's fault).
    pub fn breaker_outcome(&self) -> Option<CallOutcome> {
        match self {
            VectorStoreError::Http(_) | VectorStoreError::Unavailable(_) => {
                Some(CallOutcome::Failure)
            }
            VectorStoreError::Status { status, .. } => match status {
                429 => Some(CallOutcome::RateLimited),
                500.. => Some(CallOutcome::Failure),
                _ => None,
            },
            VectorStoreError::Serialization(_) | VectorStoreError::DimensionMismatch { .. } => {
                None
            }
        }
    }
}

pub type VectorStoreResult<T> = Result<T, VectorStoreError>;

/// One scored point returned by a collection search. The query engine
/// attaches the source id to build a [`Hit`](crate::sources::Hit).
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub doc_id: String,
    /// Cosine similarity in [-1, 1].
    pub score: f64,
    pub payload: HitPayload,
    pub vector: Option<Vec<f64>>,
}

/// A point to upsert into a collection.
#[derive(Debug, Clone)]
pub struct PointRecord {
    pub id: String,
    pub vector: Vec<f64>,
    pub payload: serde_json::Value,
}

/// Optional search constraints applied server-side.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Restrict to points tagged with this tenant.
    pub tenant: Option<String>,
}

impl SearchFilter {
    fn is_empty(&self) -> bool {
        self.tenant.is_none()
    }
}

/// Abstract vector store, the seam for tests and alternative backends.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn search(
        &self,
        collection: &str,
        vector: &[f64],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> VectorStoreResult<Vec<ScoredPoint>>;

    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> VectorStoreResult<()>;

    async fn health_check(&self) -> VectorStoreResult<()>;

    fn dimensions(&self) -> usize;
}

// Wire types for the Qdrant HTTP API.

#[derive(Serialize)]
struct SearchRequest {
    vector: Vec<f64>,
    limit: usize,
    with_payload: bool,
    with_vector: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<SearchResultPoint>,
}

#[derive(Deserialize)]
struct SearchResultPoint {
    id: serde_json::Value,
    score: f64,
    payload: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    vector: Option<Vec<f64>>,
}

#[derive(Serialize)]
struct UpsertRequest {
    points: Vec<UpsertPoint>,
}

#[derive(Serialize)]
struct UpsertPoint {
    id: String,
    vector: Vec<f64>,
    payload: serde_json::Value,
}

/// Qdrant HTTP implementation of [`VectorBackend`].
pub struct QdrantStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    dimensions: usize,
    timeout: Duration,
}

impl QdrantStore {
    pub fn new(config: &VectorStoreConfig, dimensions: usize, client: Client) -> Self {
        Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            dimensions,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        request.header("Content-Type", "application/json")
    }

    fn check_dimensions(&self, vector: &[f64]) -> VectorStoreResult<()> {
        if vector.len() != self.dimensions {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn build_filter(filter: Option<&SearchFilter>) -> Option<serde_json::Value> {
        let filter = filter?;
        if filter.is_empty() {
            return None;
        }
        let mut must = Vec::new();
        if let Some(tenant) = &filter.tenant {
            must.push(serde_json::json!({
                "key": "tenant",
                "match": {"value": tenant}
            }));
        }
        Some(serde_json::json!({"must": must}))
    }

    /// Map a raw point payload into the fields the response builder
    /// consumes. Points missing the mapping entirely are dropped.
    fn payload_from_json(payload: &HashMap<String, serde_json::Value>) -> Option<HitPayload> {
        let string_field = |keys: &[&str]| {
            keys.iter().find_map(|key| {
                payload
                    .get(*key)
                    .and_then(|value| value.as_str())
                    .map(|s| s.to_string())
            })
        };

        let title = string_field(&["title"])?;
        let url = string_field(&["url", "link"])?;
        let snippet = string_field(&["snippet", "text_snippet", "text", "content"])?;
        let updated_at = payload
            .get("updated_at")
            .and_then(|value| value.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Some(HitPayload {
            title,
            url,
            snippet,
            updated_at,
        })
    }

    fn point_id_to_string(id: &serde_json::Value) -> Option<String> {
        match id {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[async_trait]
impl VectorBackend for QdrantStore {
    async fn search(
        &self,
        collection: &str,
        vector: &[f64],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> VectorStoreResult<Vec<ScoredPoint>> {
        self.check_dimensions(vector)?;

        let start = Instant::now();
        let body = SearchRequest {
            vector: vector.to_vec(),
            limit,
            with_payload: true,
            with_vector: true,
            filter: Self::build_filter(filter),
        };

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/search"),
            )
            .json(&body)
            .send()
            .await;

        let duration = start.elapsed().as_secs_f64();
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                metrics::record_vector_search(collection, "error", duration, 0);
                warn!(collection, error = %e, "vector search failed");
                return Err(VectorStoreError::Http(e.to_string()));
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            metrics::record_vector_search(collection, "error", duration, 0);
            warn!(collection, status, "vector search returned error status");
            return Err(VectorStoreError::Status { status, body });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| VectorStoreError::Serialization(e.to_string()))?;

        let points: Vec<ScoredPoint> = parsed
            .result
            .into_iter()
            .filter_map(|point| {
                let doc_id = Self::point_id_to_string(&point.id)?;
                let payload = Self::payload_from_json(point.payload.as_ref()?)?;
                Some(ScoredPoint {
                    doc_id,
                    score: point.score,
                    payload,
                    vector: point.vector,
                })
            })
            .collect();

        metrics::record_vector_search(collection, "success", duration, points.len());
        debug!(
            collection,
            hits = points.len(),
            duration_ms = (duration * 1000.0) as u64,
            "vector search completed"
        );
        Ok(points)
    }

    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> VectorStoreResult<()> {
        for point in &points {
            self.check_dimensions(&point.vector)?;
        }

        let body = UpsertRequest {
            points: points
                .into_iter()
                .map(|p| UpsertPoint {
                    id: p.id,
                    vector: p.vector,
                    payload: p.payload,
                })
                .collect(),
        };

        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points"),
            )
            .query(&[("wait", "true")])
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorStoreError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(VectorStoreError::Status { status, body });
        }

        Ok(())
    }

    async fn health_check(&self) -> VectorStoreResult<()> {
        let response = self
            .request(reqwest::Method::GET, "/collections")
            .send()
            .await
            .map_err(|e| VectorStoreError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VectorStoreError::Unavailable(format!(
                "vector store returned status {}",
                response.status()
            )));
        }

        Ok(())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
