mod admin;
mod health;
mod query;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

/// Build the full route tree.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(query::query))
        .route("/stats", get(admin::stats))
        .route("/invalidate", post(admin::invalidate))
        .route("/metrics", get(admin::metrics))
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .with_state(state)
}
