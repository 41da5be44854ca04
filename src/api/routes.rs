use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rskafka::client::Client as KafkaClient;
use std::sync::Arc;

use super::handlers;
use crate::idempotency::IdempotencyHandler;
use crate::observability::HealthChecker;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<IdempotencyHandler>,
    pub kafka_client: Option<Arc<KafkaClient>>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub health_checker: Option<Arc<HealthChecker>>,
}

impl AppState {
    pub fn new(handler: Arc<IdempotencyHandler>, kafka_client: Option<Arc<KafkaClient>>) -> Self {
        Self {
            handler,
            kafka_client,
            metrics_handle: None,
            health_checker: None,
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Adds health checker to the state.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health_checker = Some(checker);
        self
    }

    /// Returns true if Kafka is connected.
    pub fn kafka_connected(&self) -> bool {
        self.kafka_client.is_some()
    }
}

/// Creates the operator API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/health/detailed", get(handlers::detailed_health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        // Ledger inspection
        .route("/idempotency/stats", get(handlers::idempotency_stats))
        .route("/idempotency/records/:provider/:id", get(handlers::get_record))
        .route("/idempotency/sweep", post(handlers::run_sweep))
        .with_state(state)
}
