//! deskgate: retrieval-augmented answer gateway for IT-helpdesk assistants.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

mod api_types;
mod breaker;
mod cache;
mod config;
mod embedding;
mod error;
mod llm;
mod observability;
mod pipeline;
mod query;
mod response;
mod routes;
mod sources;
mod state;
mod vector;

use breaker::BreakerRegistry;
use cache::SemanticCache;
use config::GatewayConfig;
use embedding::EmbeddingClient;
use llm::LlmClient;
use pipeline::Orchestrator;
use query::QueryEngine;
use response::ResponseBuilder;
use state::AppState;
use vector::{QdrantStore, VectorBackend};

const EXIT_BAD_CONFIG: i32 = 2;
const EXIT_ADAPTER_UNREACHABLE: i32 = 3;
const EXIT_PORT_IN_USE: i32 = 4;

/// Connections kept per upstream target (embedding, vector store, LLM).
const POOL_MAX_IDLE_PER_HOST: usize = 32;

#[derive(Parser)]
#[command(
    name = "deskgate",
    version,
    about = "Retrieval-augmented answer gateway for IT-helpdesk assistants"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "deskgate.toml")]
    config: PathBuf,

    /// Skip startup reachability checks against the external adapters.
    #[arg(long)]
    skip_startup_checks: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match GatewayConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    observability::init_tracing(&config.observability);
    if let Err(e) = observability::metrics::init_metrics(config.observability.metrics_enabled) {
        warn!(error = %e, "metrics disabled");
    }

    let http = match reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };

    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let cache = Arc::new(SemanticCache::new(config.cache.clone()));
    let embedding = Arc::new(EmbeddingClient::new(config.embedding.clone(), http.clone()));
    let vector_store: Arc<dyn VectorBackend> = Arc::new(QdrantStore::new(
        &config.vector_store,
        config.embedding.dim,
        http.clone(),
    ));
    let llm = Arc::new(LlmClient::new(
        config.llm.clone(),
        http,
        breakers.get("llm"),
    ));
    let engine = Arc::new(QueryEngine::new(
        &config,
        vector_store.clone(),
        breakers.clone(),
    ));
    let builder = Arc::new(ResponseBuilder::new(
        llm.clone(),
        config.pipeline.context_token_budget,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        cache.clone(),
        embedding.clone(),
        engine,
        builder,
        Duration::from_millis(config.pipeline.deadline_ms),
        config.cache.semantic.enabled,
    ));

    if !args.skip_startup_checks {
        let (embedding_ok, store_ok, llm_ok) = tokio::join!(
            embedding.ping(),
            vector_store.health_check(),
            llm.ping(),
        );
        let mut unreachable = Vec::new();
        if let Err(e) = embedding_ok {
            error!(error = %e, "embedding provider unreachable");
            unreachable.push("embedding");
        }
        if let Err(e) = store_ok {
            error!(error = %e, "vector store unreachable");
            unreachable.push("vector_store");
        }
        if let Err(e) = llm_ok {
            error!(error = %e, "LLM provider unreachable");
            unreachable.push("llm");
        }
        if !unreachable.is_empty() {
            eprintln!("adapters unreachable at startup: {}", unreachable.join(", "));
            std::process::exit(EXIT_ADAPTER_UNREACHABLE);
        }
    }

    spawn_purge_job(cache.clone(), config.cache.purge_interval_secs);

    let app_state = AppState {
        orchestrator,
        cache,
        breakers,
        embedding,
        vector_store,
        llm,
    };
    // The chat front-end is browser-based and served from another origin;
    // the gateway itself carries no credentials or cookies.
    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(
            config.server.request_body_limit_bytes,
        ));

    let address = (config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            eprintln!("port {} already in use", config.server.port);
            std::process::exit(EXIT_PORT_IN_USE);
        }
        Err(e) => {
            eprintln!("failed to bind {}:{}: {e}", config.server.host, config.server.port);
            std::process::exit(1);
        }
    };

    info!(
        host = %config.server.host,
        port = config.server.port,
        sources = config.enabled_sources().len(),
        "deskgate listening"
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

/// Periodically drop expired cache entries.
fn spawn_purge_job(cache: Arc<SemanticCache>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = cache.purge_expired();
            if purged > 0 {
                info!(purged, "expired cache entries purged");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
