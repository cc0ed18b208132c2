mod agents;
mod config;
mod dispatcher;
mod errors;
mod handlers;
mod llm;
mod memory;
mod metrics;
mod models;
mod orchestrator;
mod pricing;
mod routing;
mod semantic_cache;
mod tool_cache;
mod tools;
mod vector;
mod workflows;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    // ============================================================
    // Initialize Services
    // ============================================================

    let config = match config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration rejected: {:#}", e);
            std::process::exit(1);
        }
    };
    let listen_addr = config.listen_addr.clone();

    let services = match dispatcher::CoreServices::init(config).await {
        Ok(services) => services,
        Err(e) => {
            tracing::error!("service init failed: {:#}", e);
            std::process::exit(1);
        }
    };

    // ============================================================
    // Build Axum Router
    // ============================================================

    let app = Router::new()
        // Query endpoints
        .route("/query", post(handlers::handle_query))
        .route("/query/enhanced", post(handlers::handle_query_enhanced))
        // User memory
        .route("/memory/:user_id", get(handlers::get_memory))
        .route(
            "/memory/:user_id/preferences",
            put(handlers::update_preferences),
        )
        .route(
            "/memory/:user_id/portfolio",
            post(handlers::update_portfolio),
        )
        // Read-only metrics
        .route("/metrics/pricing", get(handlers::metrics_pricing))
        .route("/metrics/cache", get(handlers::metrics_cache))
        .route("/metrics/performance", get(handlers::metrics_performance))
        .route("/metrics/summary", get(handlers::metrics_summary))
        // Health check
        .route("/health", get(handlers::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(services.clone());

    tracing::info!("🚪 front door ready");
    tracing::info!("🎧 listening on {}", listen_addr);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {}", listen_addr, e));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            services.close().await;
        })
        .await
        .expect("server error");
}
