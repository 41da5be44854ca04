use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::api::requests::{RecordQuery, StatsQuery};
use crate::api::responses::{
    ApiResponse, HealthResponse, RecordResponse, ServiceHealth, StatsResponse, SweepResponse,
};
use crate::error::AppError;
use crate::idempotency::KeyValueStore;
use crate::observability::AggregatedHealth;

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let store_healthy = state.handler.store().ping().await.is_ok();
    let kafka_healthy = state.kafka_connected();

    let response = HealthResponse {
        status: if store_healthy { "healthy".to_string() } else { "degraded".to_string() },
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        services: ServiceHealth {
            store: store_healthy,
            kafka: kafka_healthy,
        },
    };

    Json(ApiResponse::success(response))
}

/// Per-dependency health with latencies.
pub async fn detailed_health_check(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ApiResponse<AggregatedHealth>>), AppError> {
    let checker = state
        .health_checker
        .as_ref()
        .ok_or_else(|| AppError::NotFound("health checker not configured".to_string()))?;

    let health = checker.check_all().await;
    let status = if health.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    Ok((status, Json(ApiResponse::success(health))))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    let ready = match &state.health_checker {
        Some(checker) => checker.is_ready().await,
        None => state.handler.store().ping().await.is_ok(),
    };

    if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

/// Ledger counts by status plus process-local counters.
pub async fn idempotency_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ApiResponse<StatsResponse>>, AppError> {
    let reporter = state.handler.stats_reporter();
    // Unfiltered snapshots also refresh the ledger gauges.
    let ledger = match query.provider.as_deref() {
        Some(provider) => reporter.snapshot(Some(provider)).await?,
        None => reporter.publish().await?,
    };
    let process = state.handler.metrics().snapshot();

    Ok(Json(ApiResponse::success(StatsResponse::new(ledger, process))))
}

/// Looks up the ledger record for one logical operation.
pub async fn get_record(
    State(state): State<AppState>,
    Path((provider, transaction_id)): Path<(String, String)>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<ApiResponse<RecordResponse>>, AppError> {
    let key = state.handler.key(&provider, &transaction_id, query.context());

    match state.handler.ledger().get_record(&key).await? {
        Some(record) => Ok(Json(ApiResponse::success(RecordResponse::new(&key, record)))),
        None => Err(AppError::NotFound(format!("no idempotency record for {}", key))),
    }
}

/// Runs one cleanup sweep immediately.
pub async fn run_sweep(State(state): State<AppState>) -> Result<Json<ApiResponse<SweepResponse>>, AppError> {
    let report = state.handler.sweeper().run_once().await?;
    tracing::info!(scanned = report.scanned, repaired = report.repaired, "Manual sweep finished");

    Ok(Json(ApiResponse::success(SweepResponse::from(report))))
}
