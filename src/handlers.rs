use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::agents::KNOWN_AGENTS;
use crate::dispatcher::{CoreServices, DispatchFailure};
use crate::errors::{CoreError, ErrorBody};
use crate::models::{
    EnhancedResponse, LegacyResponse, PortfolioDelta, QueryRequest, UserContext,
};
use crate::pricing;

// ============================================================
// HTTP Handlers
// ============================================================

type ApiError = (StatusCode, Json<ErrorBody>);

fn status_for(error: &CoreError) -> StatusCode {
    match error {
        CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CoreError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
        CoreError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn into_api_error(failure: DispatchFailure) -> ApiError {
    let status = status_for(&failure.error);
    let mut body = ErrorBody::new(&failure.error, failure.query_id);
    if let Some(metrics) = failure.partial_metrics {
        body = body.with_partial_metrics(metrics);
    }
    (status, Json(body))
}

/// POST /query/enhanced - full execution metrics.
pub async fn handle_query_enhanced(
    State(services): State<Arc<CoreServices>>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<EnhancedResponse>, ApiError> {
    services
        .handle(payload)
        .await
        .map(Json)
        .map_err(into_api_error)
}

/// POST /query - legacy trimmed response; behavior is identical.
pub async fn handle_query(
    State(services): State<Arc<CoreServices>>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<LegacyResponse>, ApiError> {
    services
        .handle(payload)
        .await
        .map(|full| Json(LegacyResponse::from_enhanced(&full)))
        .map_err(into_api_error)
}

/// GET /metrics/pricing
pub async fn metrics_pricing(
    State(services): State<Arc<CoreServices>>,
) -> Json<serde_json::Value> {
    let workflows: Vec<serde_json::Value> = services
        .registry
        .names()
        .iter()
        .filter_map(|name| services.registry.get(name).ok())
        .map(|wf| {
            serde_json::json!({
                "name": wf.name,
                "pattern": wf.pattern.to_string(),
                "baseline_cost_usd": wf.baseline_cost_usd,
            })
        })
        .collect();

    Json(serde_json::json!({
        "chat_model": services.config.llm.chat_model,
        "embedding_model": services.config.llm.embedding_model,
        "agents": KNOWN_AGENTS,
        "baselines": workflows,
        "targets": {
            "latency_ms": services.config.targets.latency_ms,
            "cost_usd": services.config.targets.cost_usd,
        },
        "baseline_table": pricing::BASELINE_COSTS
            .iter()
            .map(|(name, cost)| serde_json::json!({ "workflow": name, "cost_usd": cost }))
            .collect::<Vec<_>>(),
    }))
}

/// GET /metrics/cache
pub async fn metrics_cache(State(services): State<Arc<CoreServices>>) -> Json<serde_json::Value> {
    Json(services.process_metrics.cache_snapshot())
}

/// GET /metrics/performance
pub async fn metrics_performance(
    State(services): State<Arc<CoreServices>>,
) -> Json<serde_json::Value> {
    Json(services.process_metrics.performance_snapshot())
}

/// GET /metrics/summary
pub async fn metrics_summary(
    State(services): State<Arc<CoreServices>>,
) -> Json<serde_json::Value> {
    Json(services.process_metrics.summary_snapshot())
}

fn into_memory_error(error: CoreError) -> ApiError {
    (status_for(&error), Json(ErrorBody::new(&error, None)))
}

/// GET /memory/:user_id - profile + conversation tail.
pub async fn get_memory(
    State(services): State<Arc<CoreServices>>,
    Path(user_id): Path<String>,
) -> Json<UserContext> {
    Json(services.memory.load(&user_id).await)
}

/// PUT /memory/:user_id/preferences - top-level merge.
pub async fn update_preferences(
    State(services): State<Arc<CoreServices>>,
    Path(user_id): Path<String>,
    Json(patch): Json<HashMap<String, serde_json::Value>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services
        .memory
        .update_preferences(&user_id, patch)
        .await
        .map_err(into_memory_error)?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// POST /memory/:user_id/portfolio - apply buy/sell deltas.
pub async fn update_portfolio(
    State(services): State<Arc<CoreServices>>,
    Path(user_id): Path<String>,
    Json(diffs): Json<Vec<PortfolioDelta>>,
) -> Result<Json<UserContext>, ApiError> {
    services
        .memory
        .update_portfolio(&user_id, diffs)
        .await
        .map_err(into_memory_error)?;
    Ok(Json(services.memory.load(&user_id).await))
}

/// GET /health
pub async fn health_check(State(services): State<Arc<CoreServices>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "store_backend": services.config.store_backend,
        "uptime_seconds": services.process_metrics.uptime_seconds(),
    }))
}
