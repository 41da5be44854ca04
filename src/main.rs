use idempotency_layer::api::{create_router, AppState};
use idempotency_layer::config::Settings;
use idempotency_layer::events::{FailureNotifier, KafkaFailureNotifier, LoggingNotifier, ProducerBuilder};
use idempotency_layer::idempotency::{IdempotencyHandler, KeyValueStore, RedisStore, SharedStore};
use idempotency_layer::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    init_logging(&LogConfig::from(&settings.application));
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    // Connect to Redis
    info!("Connecting to Redis at {}...", settings.redis.url);
    let client = redis::Client::open(settings.redis.url.as_str())?;
    let store = RedisStore::connect(
        &client,
        Duration::from_millis(settings.redis.operation_timeout_ms),
    )
    .await?;
    let store: SharedStore = Arc::new(store);
    store.ping().await?;
    info!("Redis connection established");

    // Failure alerts go to Kafka when enabled, otherwise to the log
    let mut kafka_client = None;
    let notifier: Arc<dyn FailureNotifier> = if settings.kafka.enabled {
        let mut producer = ProducerBuilder::new()
            .brokers(settings.kafka.broker_list())
            .default_topic(settings.kafka.alert_topic.clone())
            .build();
        match producer.connect().await {
            Ok(()) => {
                kafka_client = producer.client();
                Arc::new(KafkaFailureNotifier::new(
                    Arc::new(producer),
                    settings.kafka.alert_topic.clone(),
                ))
            }
            Err(e) => {
                warn!("Kafka unavailable, failure alerts will only be logged: {}", e);
                Arc::new(LoggingNotifier)
            }
        }
    } else {
        Arc::new(LoggingNotifier)
    };

    let handler = Arc::new(
        IdempotencyHandler::new(store.clone(), settings.idempotency.clone())?.with_notifier(notifier),
    );

    let _sweeper = handler.sweeper().start(settings.idempotency.sweep_interval());

    let health_checker = Arc::new(HealthChecker::new(store, kafka_client.clone()));
    let state = AppState::new(handler, kafka_client)
        .with_metrics(metrics_handle)
        .with_health_checker(health_checker);

    let app = create_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let addr: SocketAddr = format!("{}:{}", settings.application.host, settings.application.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}
