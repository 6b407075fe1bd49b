//! Shared application state, injected into every route handler.
//!
//! One registry of collaborators built at startup; no module-level
//! singletons anywhere.

use std::sync::Arc;

use crate::{
    breaker::BreakerRegistry, cache::SemanticCache, embedding::EmbeddingClient, llm::LlmClient,
    pipeline::Orchestrator, vector::VectorBackend,
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub cache: Arc<SemanticCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub embedding: Arc<EmbeddingClient>,
    pub vector_store: Arc<dyn VectorBackend>,
    pub llm: Arc<LlmClient>,
}
