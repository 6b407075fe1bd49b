//! Pipeline orchestrator.
//!
//! Single entry point for the whole retrieval-and-response flow:
//! exact cache lookup, single-flight coalescing, semantic cache lookup,
//! multi-source fan-out, answer building, cache write. Every execution
//! runs under one deadline; when it fires, outstanding child work is
//! cancelled and the caller gets a timeout immediately.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    api_types::{Answer, CacheResult, QueryRequest},
    cache::{
        Flight, PutRequest, QueryKey, SemanticCache, SingleFlight, await_flight,
    },
    embedding::EmbeddingClient,
    error::GatewayError,
    llm::LlmError,
    observability::metrics,
    query::{QueryEngine, RetrievalOutcome, SourceError},
    response::ResponseBuilder,
};

pub struct Orchestrator {
    cache: Arc<SemanticCache>,
    embedding: Arc<EmbeddingClient>,
    engine: Arc<QueryEngine>,
    builder: Arc<ResponseBuilder>,
    flights: SingleFlight,
    deadline: Duration,
    semantic_enabled: bool,
}

impl Orchestrator {
    pub fn new(
        cache: Arc<SemanticCache>,
        embedding: Arc<EmbeddingClient>,
        engine: Arc<QueryEngine>,
        builder: Arc<ResponseBuilder>,
        deadline: Duration,
        semantic_enabled: bool,
    ) -> Self {
        Self {
            cache,
            embedding,
            engine,
            builder,
            flights: SingleFlight::new(),
            deadline,
            semantic_enabled,
        }
    }

    /// Handle one query end to end.
    pub async fn handle(&self, request: QueryRequest) -> Result<Answer, GatewayError> {
        if request.text.trim().is_empty() {
            return Err(GatewayError::BadRequest("text must not be empty".into()));
        }

        let start = std::time::Instant::now();
        let result = match tokio::time::timeout(self.deadline, self.execute(&request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(deadline_ms = self.deadline.as_millis() as u64, "pipeline deadline exceeded");
                Err(GatewayError::Timeout)
            }
        };

        let duration = start.elapsed().as_secs_f64();
        match &result {
            Ok(answer) => {
                metrics::record_query(answer.metrics.cache_result, duration);
                info!(
                    cache_result = ?answer.metrics.cache_result,
                    partial = answer.metrics.partial,
                    duration_ms = (duration * 1000.0) as u64,
                    "query answered"
                );
            }
            Err(error) => {
                metrics::record_query_error(error.code(), duration);
            }
        }
        result
    }

    async fn execute(&self, request: &QueryRequest) -> Result<Answer, GatewayError> {
        let key = QueryKey::new(&request.text, request.mode, request.tenant.as_deref());

        // Step 1: exact lookup.
        if let Some(hit) = self.cache.get_exact(&key) {
            let mut answer = hit.answer;
            answer.metrics.cache_result = CacheResult::Exact;
            answer.metrics.similarity = None;
            return Ok(answer);
        }

        // Step 2: coalesce concurrent executions of the same fingerprint.
        match self.flights.join(&key.fingerprint) {
            Flight::Follower(receiver) => match await_flight(receiver).await {
                Some(Ok(answer)) => Ok(answer),
                Some(Err(body)) => Err(GatewayError::from_body(body)),
                None => Err(GatewayError::unavailable(
                    "coalesced execution was cancelled",
                )),
            },
            Flight::Leader(guard) => {
                // The flight slot may have been won after another leader
                // finished; a fresh read avoids re-running the pipeline.
                if let Some(hit) = self.cache.get_exact(&key) {
                    let mut answer = hit.answer;
                    answer.metrics.cache_result = CacheResult::Exact;
                    answer.metrics.similarity = None;
                    guard.finish(Ok(answer.clone()));
                    return Ok(answer);
                }

                let result = self.run_miss(request, &key).await;
                match &result {
                    Ok(answer) => guard.finish(Ok(answer.clone())),
                    Err(error) => guard.finish(Err(error.to_body())),
                }
                result
            }
        }
    }

    /// Steps 3-6: semantic lookup, fan-out, build, cache write.
    async fn run_miss(
        &self,
        request: &QueryRequest,
        key: &QueryKey,
    ) -> Result<Answer, GatewayError> {
        // The question is embedded at most once; the same vector serves the
        // semantic lookup, every source search, and the cache write.
        let mut query_vec = None;

        // Step 3: semantic lookup.
        if request.allow_semantic && self.semantic_enabled {
            match self.embedding.embed(&key.normalized_text).await {
                Ok(vector) => {
                    let hit = self
                        .cache
                        .get_semantic(&vector, key.mode, key.tenant.as_deref())
                        .await;
                    query_vec = Some(vector);
                    if let Some(hit) = hit {
                        let mut answer = hit.answer;
                        answer.metrics.cache_result = CacheResult::Semantic;
                        answer.metrics.similarity = Some(hit.similarity);
                        return Ok(answer);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "embedding failed, semantic lookup treated as miss");
                }
            }
        }

        // Step 4: fan-out.
        let sources = self
            .engine
            .select_sources(&request.text, request.sources.as_deref())?;
        self.cache.record_miss();

        if query_vec.is_none() {
            query_vec = match self.embedding.embed(&key.normalized_text).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!(error = %e, "embedding unavailable, answering without retrieval");
                    None
                }
            };
        }

        let retrieval = match &query_vec {
            Some(vector) => {
                self.engine
                    .retrieve(vector.clone(), &sources, request.tenant.as_deref())
                    .await
            }
            // No vector, no search: every selected source is unreachable.
            None => RetrievalOutcome {
                hits: Vec::new(),
                partial: true,
                errors: sources
                    .iter()
                    .map(|source| SourceError {
                        source: source.clone(),
                        reason: "embedding unavailable".to_string(),
                    })
                    .collect(),
            },
        };

        let cache_result = if retrieval.hits.is_empty() {
            debug!(errors = retrieval.errors.len(), "no context retrieved");
            CacheResult::MissNoContext
        } else {
            CacheResult::Miss
        };

        // Step 5: build the answer.
        let answer = self
            .builder
            .build(
                &request.text,
                &retrieval.hits,
                request.mode,
                retrieval.partial,
                cache_result,
            )
            .await
            .map_err(map_llm_error)?;

        // Step 6: cache write. The stored tokens_value is what this answer
        // cost, so future hits credit exactly that.
        let tokens_value = answer.metrics.prompt_tokens + answer.metrics.completion_tokens;
        self.cache.put(PutRequest {
            key: key.clone(),
            answer: answer.clone(),
            tokens_value,
            embedding: if request.allow_semantic {
                query_vec
            } else {
                None
            },
            semantic_eligible: request.allow_semantic,
        });

        Ok(answer)
    }

    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }
}

fn map_llm_error(error: LlmError) -> GatewayError {
    match error {
        LlmError::CircuitOpen(open) => {
            let retry_after_ms = match &open {
                crate::breaker::BreakerError::Open { retry_after, .. } => {
                    Some(retry_after.as_millis() as u64)
                }
            };
            GatewayError::Unavailable {
                message: "language model temporarily unavailable".to_string(),
                retry_after_ms,
            }
        }
        LlmError::Http(_) | LlmError::Timeout => {
            GatewayError::unavailable("language model unreachable")
        }
        LlmError::Status { status, .. } if status == 429 || status >= 500 => {
            GatewayError::unavailable("language model unavailable")
        }
        other => GatewayError::Internal(format!("completion failed: {other}")),
    }
}
