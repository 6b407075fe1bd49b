//! The query endpoint.

use axum::{Json, extract::State};

use crate::{
    api_types::{Answer, QueryRequest},
    error::GatewayError,
    state::AppState,
};

#[tracing::instrument(name = "routes.query", skip_all, fields(mode = request.mode.as_str()))]
pub async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Answer>, GatewayError> {
    let answer = state.orchestrator.handle(request).await?;
    Ok(Json(answer))
}
