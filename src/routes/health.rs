//! Liveness and readiness endpoints.

use std::time::Duration;

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::state::AppState;

/// How long the liveness probe waits for a cache stats read.
const CACHE_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub cache: ComponentStatus,
}

#[derive(Debug, Serialize)]
pub struct ReadyStatus {
    pub ready: bool,
    pub adapters: AdapterStatus,
}

#[derive(Debug, Serialize)]
pub struct AdapterStatus {
    pub embedding: ComponentStatus,
    pub vector_store: ComponentStatus,
    pub llm: ComponentStatus,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
}

/// Liveness: the process is up and the cache answers.
///
/// The stats read takes the index lock, so a wedged cache shows up here as
/// a probe timeout instead of a silently stuck endpoint.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let cache = state.cache.clone();
    let cache_status = probe(async move {
        let read = tokio::task::spawn_blocking(move || cache.stats());
        match tokio::time::timeout(CACHE_PROBE_TIMEOUT, read).await {
            Ok(Ok(_stats)) => Ok(()),
            Ok(Err(e)) => Err(format!("cache probe failed: {e}")),
            Err(_) => Err("cache probe timed out".to_string()),
        }
    })
    .await;

    let healthy = cache_status.healthy;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthStatus {
            status: if healthy { "ok" } else { "unavailable" },
            version: env!("CARGO_PKG_VERSION"),
            cache: cache_status,
        }),
    )
}

/// Readiness: all required adapters answer a ping.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let (embedding, vector_store, llm) = tokio::join!(
        probe(async { state.embedding.ping().await.map_err(|e| e.to_string()) }),
        probe(async { state.vector_store.health_check().await.map_err(|e| e.to_string()) }),
        probe(async { state.llm.ping().await.map_err(|e| e.to_string()) }),
    );

    let ready = embedding.healthy && vector_store.healthy && llm.healthy;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyStatus {
            ready,
            adapters: AdapterStatus {
                embedding,
                vector_store,
                llm,
            },
        }),
    )
}

async fn probe(check: impl Future<Output = Result<(), String>>) -> ComponentStatus {
    let start = std::time::Instant::now();
    let result = check.await;
    ComponentStatus {
        healthy: result.is_ok(),
        message: result.err(),
        latency_ms: start.elapsed().as_millis() as u64,
    }
}
