//! Embedding client.
//!
//! Turns text into a fixed-dimension unit-normalised vector via an
//! OpenAI-compatible `/embeddings` endpoint, with a small in-process LRU on
//! text → vector so repeated questions and cache probes do not re-pay the
//! provider round trip.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{config::EmbeddingConfig, observability::metrics};

/// Acceptable deviation from unit length.
pub const UNIT_NORM_TOLERANCE: f64 = 1e-6;

/// Errors from embedding generation.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse embedding response: {0}")]
    Parse(String),

    #[error("no embeddings returned from provider")]
    EmptyResponse,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Serialize)]
struct CreateEmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct CreateEmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f64>,
}

struct LruEntry {
    vector: Arc<Vec<f64>>,
    last_access: Instant,
}

/// Embedding HTTP client with text → vector LRU.
pub struct EmbeddingClient {
    http: Client,
    config: EmbeddingConfig,
    lru: Mutex<HashMap<String, LruEntry>>,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig, http: Client) -> Self {
        Self {
            http,
            config,
            lru: Mutex::new(HashMap::new()),
        }
    }

    /// Embed a text, returning a unit-normalised vector of the configured
    /// dimension.
    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f64>>, EmbeddingError> {
        if let Some(vector) = self.lru_get(text) {
            metrics::record_embedding_request("lru_hit", 0.0);
            return Ok(vector);
        }

        let start = Instant::now();
        let result = self.fetch(text).await;
        let duration = start.elapsed().as_secs_f64();

        match result {
            Ok(vector) => {
                metrics::record_embedding_request("success", duration);
                let vector = Arc::new(vector);
                self.lru_put(text, vector.clone());
                Ok(vector)
            }
            Err(e) => {
                metrics::record_embedding_request("error", duration);
                Err(e)
            }
        }
    }

    async fn fetch(&self, text: &str) -> Result<Vec<f64>, EmbeddingError> {
        let url = format!(
            "{}/embeddings",
            self.config.provider_url.trim_end_matches('/')
        );
        let body = CreateEmbeddingRequest {
            input: text,
            model: &self.config.model,
            dimensions: self.config.dim,
        };

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status { status, body });
        }

        let parsed: CreateEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Parse(e.to_string()))?;
        let raw = parsed
            .data
            .into_iter()
            .next()
            .ok_or(EmbeddingError::EmptyResponse)?
            .embedding;

        if raw.len() != self.config.dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.config.dim,
                actual: raw.len(),
            });
        }

        debug!(dim = raw.len(), "embedding generated");
        Ok(l2_normalize(raw))
    }

    fn lru_get(&self, text: &str) -> Option<Arc<Vec<f64>>> {
        let mut lru = self.lru.lock();
        let entry = lru.get_mut(text)?;
        entry.last_access = Instant::now();
        Some(entry.vector.clone())
    }

    fn lru_put(&self, text: &str, vector: Arc<Vec<f64>>) {
        let mut lru = self.lru.lock();
        if lru.len() >= self.config.lru_capacity.max(1)
            && !lru.contains_key(text)
            && let Some(oldest) = lru
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
        {
            lru.remove(&oldest);
        }
        lru.insert(
            text.to_string(),
            LruEntry {
                vector,
                last_access: Instant::now(),
            },
        );
    }

    /// Ping the provider by embedding a single short text.
    pub async fn ping(&self) -> Result<(), EmbeddingError> {
        self.fetch("ping").await.map(|_| ())
    }

    pub fn dim(&self) -> usize {
        self.config.dim
    }
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("model", &self.config.model)
            .field("dim", &self.config.dim)
            .finish()
    }
}

/// Scale a vector to unit L2 length. Zero vectors are returned unchanged.
pub fn l2_normalize(mut vector: Vec<f64>) -> Vec<f64> {
    let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// `|‖v‖₂ − 1|`, the distance from unit length.
pub fn unit_norm_error(vector: &[f64]) -> f64 {
    (vector.iter().map(|x| x * x).sum::<f64>().sqrt() - 1.0).abs()
}

/// Cosine similarity. For unit vectors this is the dot product; inputs that
/// are not unit length are normalised by their magnitudes.
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn test_config(url: &str, dim: usize, lru_capacity: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dim,
            provider_url: url.to_string(),
            api_key: None,
            model: "test-embedding".to_string(),
            lru_capacity,
            timeout_secs: 5,
        }
    }

    fn embedding_body(vector: &[f64]) -> serde_json::Value {
        serde_json::json!({
            "data": [{"embedding": vector, "index": 0}],
            "usage": {"prompt_tokens": 3, "total_tokens": 3}
        })
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let normalized = l2_normalize(vec![3.0, 4.0]);
        assert!(unit_norm_error(&normalized) <= UNIT_NORM_TOLERANCE);
        assert!((normalized[0] - 0.6).abs() < 1e-12);
        assert!((normalized[1] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn cosine_of_identical_unit_vectors_is_one() {
        let v = l2_normalize(vec![1.0, 2.0, 3.0]);
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0]), 0.0);
    }

    #[tokio::test]
    async fn embed_returns_normalized_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(&[3.0, 4.0])))
            .mount(&server)
            .await;

        let client = EmbeddingClient::new(test_config(&server.uri(), 2, 16), Client::new());
        let vector = client.embed("reset my password").await.unwrap();
        assert!(unit_norm_error(&vector) <= UNIT_NORM_TOLERANCE);
    }

    #[tokio::test]
    async fn repeated_embeds_hit_the_lru() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(&[1.0, 0.0])))
            .expect(1)
            .mount(&server)
            .await;

        let client = EmbeddingClient::new(test_config(&server.uri(), 2, 16), Client::new());
        let first = client.embed("vpn down").await.unwrap();
        let second = client.embed("vpn down").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(&[1.0, 0.0])))
            .expect(4)
            .mount(&server)
            .await;

        let client = EmbeddingClient::new(test_config(&server.uri(), 2, 2), Client::new());
        client.embed("a").await.unwrap();
        client.embed("b").await.unwrap();
        // Touch "a" so "b" is the eviction candidate.
        client.embed("a").await.unwrap();
        client.embed("c").await.unwrap();
        // "b" was evicted and must be re-fetched.
        client.embed("b").await.unwrap();
    }

    #[tokio::test]
    async fn dimension_mismatch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(&[1.0, 0.0])))
            .mount(&server)
            .await;

        let client = EmbeddingClient::new(test_config(&server.uri(), 1536, 16), Client::new());
        let err = client.embed("hello").await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 1536,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn provider_errors_surface_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = EmbeddingClient::new(test_config(&server.uri(), 2, 16), Client::new());
        let err = client.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Status { status: 503, .. }));
    }
}
