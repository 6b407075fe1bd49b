//! Query engine: source selection, parallel fan-out, merging and ranking.
//!
//! The question is embedded exactly once; the same vector is searched
//! against every selected source's collection in parallel, bounded by a
//! semaphore, a per-source timeout, and an overall fan-out deadline. Each
//! search is gated by the source's circuit breaker; an open breaker yields
//! an immediate "skipped" outcome rather than a failure.

mod dedup;
mod select;

use std::{collections::HashMap, sync::Arc, time::Duration};

pub use dedup::{dedup_and_rank, normalize_url};
pub use select::SourceSelector;
use tokio::{sync::Semaphore, task::JoinSet, time::timeout};
use tracing::{debug, warn};

use crate::{
    breaker::{BreakerRegistry, CallOutcome},
    config::{GatewayConfig, PipelineConfig},
    error::GatewayError,
    observability::metrics,
    sources::{Hit, RankedHit, SourceId},
    vector::{SearchFilter, VectorBackend},
};

/// Terminal state of one source's search.
#[derive(Debug)]
enum SourceOutcome {
    Hits(Vec<Hit>),
    /// Breaker open; the source was never called.
    Skipped,
    TimedOut,
    Failed(String),
}

impl SourceOutcome {
    fn label(&self) -> &'static str {
        match self {
            SourceOutcome::Hits(_) => "hits",
            SourceOutcome::Skipped => "skipped",
            SourceOutcome::TimedOut => "timed_out",
            SourceOutcome::Failed(_) => "failed",
        }
    }
}

/// What a source contributed to a degraded answer, for logs and errors.
#[derive(Debug, Clone)]
pub struct SourceError {
    pub source: SourceId,
    pub reason: String,
}

/// Merged, ranked result of one fan-out.
#[derive(Debug)]
pub struct RetrievalOutcome {
    pub hits: Vec<RankedHit>,
    /// True when any selected source was skipped, timed out, or failed.
    pub partial: bool,
    pub errors: Vec<SourceError>,
}

pub struct QueryEngine {
    pipeline: PipelineConfig,
    /// Source → collection, the closed set.
    collections: HashMap<SourceId, String>,
    selector: SourceSelector,
    store: Arc<dyn VectorBackend>,
    breakers: Arc<BreakerRegistry>,
    semaphore: Arc<Semaphore>,
}

impl QueryEngine {
    pub fn new(
        config: &GatewayConfig,
        store: Arc<dyn VectorBackend>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let selector = SourceSelector::new(config.enabled_sources(), &config.clients);
        Self {
            pipeline: config.pipeline.clone(),
            collections: config
                .vector_store
                .collections
                .iter()
                .map(|(source, collection)| (source.clone(), collection.clone()))
                .collect(),
            selector,
            store,
            breakers,
            semaphore: Arc::new(Semaphore::new(config.pipeline.max_concurrent_sources)),
        }
    }

    /// Pick the sources to search for one question.
    pub fn select_sources(
        &self,
        text: &str,
        hint: Option<&[SourceId]>,
    ) -> Result<Vec<SourceId>, GatewayError> {
        self.selector.select(text, hint)
    }

    /// Fan out one query vector across the selected sources and merge.
    pub async fn retrieve(
        &self,
        query_vec: Arc<Vec<f64>>,
        sources: &[SourceId],
        tenant: Option<&str>,
    ) -> RetrievalOutcome {
        let per_source_timeout = Duration::from_millis(self.pipeline.per_source_timeout_ms);
        let fan_out_deadline = Duration::from_millis(self.pipeline.fan_out_deadline_ms);
        let filter = tenant.map(|tenant| SearchFilter {
            tenant: Some(tenant.to_string()),
        });

        let mut tasks: JoinSet<(SourceId, SourceOutcome)> = JoinSet::new();
        for source in sources {
            let Some(collection) = self.collections.get(source).cloned() else {
                // select_sources only emits declared sources.
                continue;
            };
            let source = source.clone();
            let store = self.store.clone();
            let breaker = self.breakers.get(source.as_str());
            let semaphore = self.semaphore.clone();
            let query_vec = query_vec.clone();
            let filter = filter.clone();
            let top_k = self.pipeline.top_k_per_source;

            tasks.spawn(async move {
                // Queue in FIFO order behind the concurrency bound.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (source, SourceOutcome::Failed("shutdown".to_string())),
                };

                if let Err(e) = breaker.check() {
                    debug!(source = %source, error = %e, "source skipped, breaker open");
                    return (source, SourceOutcome::Skipped);
                }

                let search = store.search(&collection, &query_vec, top_k, filter.as_ref());
                match timeout(per_source_timeout, search).await {
                    Err(_) => {
                        breaker.record(CallOutcome::Failure);
                        warn!(source = %source, "source search timed out");
                        (source, SourceOutcome::TimedOut)
                    }
                    Ok(Err(e)) => {
                        if let Some(outcome) = e.breaker_outcome() {
                            breaker.record(outcome);
                        }
                        warn!(source = %source, error = %e, "source search failed");
                        (source, SourceOutcome::Failed(e.to_string()))
                    }
                    Ok(Ok(points)) => {
                        breaker.record(CallOutcome::Success);
                        let hits = points
                            .into_iter()
                            .map(|point| Hit {
                                source: source.clone(),
                                doc_id: point.doc_id,
                                score: point.score,
                                payload: point.payload,
                                vector: point.vector,
                            })
                            .collect();
                        (source, SourceOutcome::Hits(hits))
                    }
                }
            });
        }

        // Collect until done or the fan-out deadline fires; sources still
        // running at the deadline are aborted and reported as timed out.
        let mut outcomes: HashMap<SourceId, SourceOutcome> = HashMap::new();
        let collect = async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((source, outcome)) = joined {
                    outcomes.insert(source, outcome);
                }
            }
        };
        if timeout(fan_out_deadline, collect).await.is_err() {
            tasks.abort_all();
        }
        for source in sources {
            outcomes
                .entry(source.clone())
                .or_insert(SourceOutcome::TimedOut);
        }

        self.aggregate(sources, outcomes)
    }

    fn aggregate(
        &self,
        sources: &[SourceId],
        mut outcomes: HashMap<SourceId, SourceOutcome>,
    ) -> RetrievalOutcome {
        let mut all_hits = Vec::new();
        let mut errors = Vec::new();
        let mut partial = false;

        for source in sources {
            let Some(outcome) = outcomes.remove(source) else {
                continue;
            };
            metrics::record_source_outcome(source.as_str(), outcome.label());
            match outcome {
                SourceOutcome::Hits(hits) => all_hits.extend(hits),
                SourceOutcome::Skipped => {
                    partial = true;
                    errors.push(SourceError {
                        source: source.clone(),
                        reason: "skipped: circuit open".to_string(),
                    });
                }
                SourceOutcome::TimedOut => {
                    partial = true;
                    errors.push(SourceError {
                        source: source.clone(),
                        reason: "timed out".to_string(),
                    });
                }
                SourceOutcome::Failed(reason) => {
                    partial = true;
                    errors.push(SourceError {
                        source: source.clone(),
                        reason,
                    });
                }
            }
        }

        let hits = dedup_and_rank(
            all_hits,
            |source| self.pipeline.source_weight(source),
            self.pipeline.top_k_global,
        );

        debug!(
            selected = sources.len(),
            ranked = hits.len(),
            partial,
            errors = errors.len(),
            "fan-out aggregated"
        );
        RetrievalOutcome {
            hits,
            partial,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        sources::HitPayload,
        vector::{PointRecord, ScoredPoint, VectorStoreError, VectorStoreResult},
    };

    /// Scripted in-memory store: per-collection responses with optional
    /// delays and failures.
    #[derive(Default)]
    struct FakeStore {
        responses: Mutex<HashMap<String, FakeResponse>>,
        calls: Mutex<Vec<String>>,
    }

    enum FakeResponse {
        Points(Vec<ScoredPoint>),
        Error(VectorStoreError),
        Hang(Duration),
    }

    impl FakeStore {
        fn with_points(self, collection: &str, points: Vec<ScoredPoint>) -> Self {
            self.responses
                .lock()
                .insert(collection.to_string(), FakeResponse::Points(points));
            self
        }

        fn with_error(self, collection: &str, error: VectorStoreError) -> Self {
            self.responses
                .lock()
                .insert(collection.to_string(), FakeResponse::Error(error));
            self
        }

        fn with_hang(self, collection: &str, delay: Duration) -> Self {
            self.responses
                .lock()
                .insert(collection.to_string(), FakeResponse::Hang(delay));
            self
        }
    }

    #[async_trait]
    impl VectorBackend for FakeStore {
        async fn search(
            &self,
            collection: &str,
            _vector: &[f64],
            _limit: usize,
            _filter: Option<&SearchFilter>,
        ) -> VectorStoreResult<Vec<ScoredPoint>> {
            self.calls.lock().push(collection.to_string());
            let response = self.responses.lock().remove(collection);
            match response {
                Some(FakeResponse::Points(points)) => Ok(points),
                Some(FakeResponse::Error(error)) => Err(error),
                Some(FakeResponse::Hang(delay)) => {
                    tokio::time::sleep(delay).await;
                    Ok(Vec::new())
                }
                None => Ok(Vec::new()),
            }
        }

        async fn upsert(
            &self,
            _collection: &str,
            _points: Vec<PointRecord>,
        ) -> VectorStoreResult<()> {
            Ok(())
        }

        async fn health_check(&self) -> VectorStoreResult<()> {
            Ok(())
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn point(doc_id: &str, score: f64) -> ScoredPoint {
        ScoredPoint {
            doc_id: doc_id.to_string(),
            score,
            payload: HitPayload {
                title: format!("doc {doc_id}"),
                url: format!("https://kb.example.com/{doc_id}"),
                snippet: "relevant text".to_string(),
                updated_at: None,
            },
            vector: None,
        }
    }

    fn test_config(sources: &[&str]) -> GatewayConfig {
        let toml = format!(
            r#"
            [embedding]
            dim = 2
            provider_url = "http://localhost:9"

            [vector_store]
            url = "http://localhost:9"

            [vector_store.collections]
            {}

            [pipeline]
            per_source_timeout_ms = 100
            fan_out_deadline_ms = 400
            "#,
            sources
                .iter()
                .map(|s| format!("{s} = \"{}\"", s.to_lowercase()))
                .collect::<Vec<_>>()
                .join("\n")
        );
        GatewayConfig::from_toml_str(&toml).unwrap()
    }

    fn engine(config: &GatewayConfig, store: FakeStore) -> QueryEngine {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        QueryEngine::new(config, Arc::new(store), breakers)
    }

    fn vec2() -> Arc<Vec<f64>> {
        Arc::new(vec![1.0, 0.0])
    }

    fn ids(names: &[&str]) -> Vec<SourceId> {
        names.iter().map(|n| SourceId::from(*n)).collect()
    }

    #[tokio::test]
    async fn merges_and_ranks_across_sources() {
        let config = test_config(&["JIRA", "CONFLUENCE"]);
        let store = FakeStore::default()
            .with_points("jira", vec![point("T-1", 0.9), point("T-2", 0.5)])
            .with_points("confluence", vec![point("C-1", 0.7)]);
        let engine = engine(&config, store);

        let outcome = engine
            .retrieve(vec2(), &ids(&["JIRA", "CONFLUENCE"]), None)
            .await;
        assert!(!outcome.partial);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.hits.len(), 3);
        assert_eq!(outcome.hits[0].hit.doc_id, "T-1");
        assert_eq!(outcome.hits[1].hit.doc_id, "C-1");
    }

    #[tokio::test]
    async fn timed_out_source_yields_partial_with_surviving_hits() {
        let config = test_config(&["JIRA", "ZENDESK", "CONFLUENCE"]);
        let store = FakeStore::default()
            .with_points("jira", vec![point("T-1", 0.9)])
            .with_hang("zendesk", Duration::from_millis(500))
            .with_points("confluence", vec![point("C-1", 0.7)]);
        let engine = engine(&config, store);

        let outcome = engine
            .retrieve(vec2(), &ids(&["JIRA", "ZENDESK", "CONFLUENCE"]), None)
            .await;
        assert!(outcome.partial);
        assert_eq!(outcome.hits.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].source.as_str(), "ZENDESK");
    }

    #[tokio::test]
    async fn per_source_timeout_records_a_breaker_failure() {
        let config = test_config(&["ZENDESK"]);
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let store =
            FakeStore::default().with_hang("zendesk", Duration::from_millis(500));
        let engine = QueryEngine::new(&config, Arc::new(store), breakers.clone());

        engine.retrieve(vec2(), &ids(&["ZENDESK"]), None).await;

        // The breaker saw exactly one recorded failure; four more trip it.
        let breaker = breakers.get("ZENDESK");
        for _ in 0..3 {
            breaker.record(CallOutcome::Failure);
        }
        assert_eq!(breaker.state(), crate::breaker::BreakerState::Closed);
        breaker.record(CallOutcome::Failure);
        assert_eq!(breaker.state(), crate::breaker::BreakerState::Open);
    }

    #[tokio::test]
    async fn open_breaker_skips_source_without_calling_it() {
        let config = test_config(&["JIRA", "SAP"]);
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        for _ in 0..5 {
            breakers.get("SAP").record(CallOutcome::Failure);
        }
        let store =
            Arc::new(FakeStore::default().with_points("jira", vec![point("T-1", 0.9)]));
        let engine = QueryEngine::new(&config, store.clone(), breakers);

        let outcome = engine.retrieve(vec2(), &ids(&["JIRA", "SAP"]), None).await;
        assert!(outcome.partial);
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.errors[0].reason, "skipped: circuit open");
        // The skipped source was never searched.
        assert_eq!(*store.calls.lock(), vec!["jira".to_string()]);
    }

    #[tokio::test]
    async fn all_sources_failing_yields_empty_with_errors() {
        let config = test_config(&["JIRA", "CONFLUENCE"]);
        let store = FakeStore::default()
            .with_error(
                "jira",
                VectorStoreError::Unavailable("connection refused".to_string()),
            )
            .with_error(
                "confluence",
                VectorStoreError::Status {
                    status: 500,
                    body: "boom".to_string(),
                },
            );
        let engine = engine(&config, store);

        let outcome = engine
            .retrieve(vec2(), &ids(&["JIRA", "CONFLUENCE"]), None)
            .await;
        assert!(outcome.hits.is_empty());
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.partial);
    }

    #[tokio::test]
    async fn global_truncation_applies_after_merge() {
        let config = test_config(&["JIRA", "CONFLUENCE"]);
        let jira_points: Vec<ScoredPoint> =
            (0..10).map(|i| point(&format!("T-{i}"), 0.9)).collect();
        let confluence_points: Vec<ScoredPoint> =
            (0..10).map(|i| point(&format!("C-{i}"), 0.8)).collect();
        let store = FakeStore::default()
            .with_points("jira", jira_points)
            .with_points("confluence", confluence_points);
        let engine = engine(&config, store);

        let outcome = engine
            .retrieve(vec2(), &ids(&["JIRA", "CONFLUENCE"]), None)
            .await;
        assert_eq!(outcome.hits.len(), 8);
    }
}
