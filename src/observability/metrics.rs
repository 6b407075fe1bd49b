//! Prometheus metrics for the gateway.
//!
//! All recording goes through typed helpers so label names stay consistent.
//! Without the `prometheus` feature every helper compiles to a no-op.

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::api_types::CacheResult;

/// Global Prometheus handle for the `/metrics` endpoint.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Errors from metrics initialization.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install metrics recorder: {0}")]
    Install(String),
}

/// Install the Prometheus recorder. Call once at startup.
#[cfg(feature = "prometheus")]
pub fn init_metrics(enabled: bool) -> Result<(), MetricsError> {
    if !enabled {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Install("metrics already initialized".to_string()))?;
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_enabled: bool) -> Result<(), MetricsError> {
    Ok(())
}

/// Render the current metrics in Prometheus exposition format.
#[cfg(feature = "prometheus")]
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

#[cfg(not(feature = "prometheus"))]
pub fn render() -> Option<String> {
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording helpers
// ─────────────────────────────────────────────────────────────────────────────

/// One finished query, by cache participation.
pub fn record_query(cache_result: CacheResult, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("gateway_queries_total", "cache_result" => cache_result.as_str()).increment(1);
        histogram!("gateway_query_duration_seconds", "cache_result" => cache_result.as_str())
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (cache_result, duration_secs);
    }
}

/// One failed query, by error code.
pub fn record_query_error(code: &str, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("gateway_query_errors_total", "code" => code.to_string()).increment(1);
        histogram!("gateway_query_duration_seconds", "cache_result" => "error")
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (code, duration_secs);
    }
}

/// A cache lookup, by kind ("exact" / "semantic") and result.
pub fn record_cache_lookup(kind: &'static str, result: &'static str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("cache_lookups_total", "kind" => kind, "result" => result).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (kind, result);
    }
}

/// One cache write.
pub fn record_cache_store() {
    #[cfg(feature = "prometheus")]
    {
        counter!("cache_stores_total").increment(1);
    }
}

/// One embedding request, including LRU hits with zero duration.
pub fn record_embedding_request(status: &'static str, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("embedding_requests_total", "status" => status).increment(1);
        histogram!("embedding_request_duration_seconds", "status" => status)
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (status, duration_secs);
    }
}

/// One vector store search against a collection.
pub fn record_vector_search(collection: &str, status: &'static str, duration_secs: f64, hits: usize) {
    #[cfg(feature = "prometheus")]
    {
        counter!("vector_search_total", "collection" => collection.to_string(), "status" => status)
            .increment(1);
        histogram!("vector_search_duration_seconds", "collection" => collection.to_string())
            .record(duration_secs);
        histogram!("vector_search_hits", "collection" => collection.to_string())
            .record(hits as f64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (collection, status, duration_secs, hits);
    }
}

/// Terminal outcome of one source within a fan-out.
pub fn record_source_outcome(source: &str, outcome: &'static str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("source_outcomes_total", "source" => source.to_string(), "outcome" => outcome)
            .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (source, outcome);
    }
}

/// One completion request, with provider-reported token counts on success.
pub fn record_llm_request(
    provider: &'static str,
    status: &'static str,
    duration_secs: f64,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
) {
    #[cfg(feature = "prometheus")]
    {
        counter!("llm_requests_total", "provider" => provider, "status" => status).increment(1);
        histogram!("llm_request_duration_seconds", "provider" => provider).record(duration_secs);
        if let Some(tokens) = prompt_tokens {
            counter!("llm_prompt_tokens_total", "provider" => provider).increment(tokens);
        }
        if let Some(tokens) = completion_tokens {
            counter!("llm_completion_tokens_total", "provider" => provider).increment(tokens);
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (provider, status, duration_secs, prompt_tokens, completion_tokens);
    }
}

/// Answer assembly, by cache participation of the producing execution.
pub fn record_answer_built(cache_result: CacheResult, prompt_tokens: u64, completion_tokens: u64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("answers_built_total", "cache_result" => cache_result.as_str()).increment(1);
        histogram!("answer_prompt_tokens").record(prompt_tokens as f64);
        histogram!("answer_completion_tokens").record(completion_tokens as f64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (cache_result, prompt_tokens, completion_tokens);
    }
}

/// Circuit breaker state transition.
pub fn record_breaker_state(dependency: &str, state: &'static str) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "breaker_transitions_total",
            "dependency" => dependency.to_string(),
            "state" => state
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (dependency, state);
    }
}
