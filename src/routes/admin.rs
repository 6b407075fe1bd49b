//! Stats, invalidation, and metrics endpoints.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::{
    api_types::{InvalidateRequest, InvalidateResponse},
    breaker::BreakerState,
    cache::StatsSnapshot,
    error::GatewayError,
    observability::metrics as metrics_export,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub cache: StatsSnapshot,
    pub breakers: Vec<BreakerStatus>,
}

#[derive(Debug, Serialize)]
pub struct BreakerStatus {
    pub dependency: String,
    pub state: BreakerState,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let breakers = state
        .breakers
        .states()
        .into_iter()
        .map(|(dependency, state)| BreakerStatus { dependency, state })
        .collect();
    Json(StatsResponse {
        cache: state.cache.stats(),
        breakers,
    })
}

pub async fn invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, GatewayError> {
    let removed = match (&request.key, &request.prefix) {
        (Some(key), None) => state.cache.invalidate_key(key),
        (None, Some(prefix)) => state.cache.invalidate_prefix(prefix),
        _ => {
            return Err(GatewayError::BadRequest(
                "provide exactly one of 'key' or 'prefix'".into(),
            ));
        }
    };
    tracing::info!(removed, "cache invalidation");
    Ok(Json(InvalidateResponse { removed }))
}

pub async fn metrics() -> impl IntoResponse {
    match metrics_export::render() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
