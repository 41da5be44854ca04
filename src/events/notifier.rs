use crate::error::Result;
use crate::events::producer::EventProducer;
use crate::events::types::FailureEvent;
use async_trait::async_trait;
use std::sync::Arc;

/// Alerting collaborator that receives failure events.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, event: &FailureEvent) -> Result<()>;
}

/// Publishes failure events to a Kafka topic, keyed by idempotency key.
pub struct KafkaFailureNotifier {
    producer: Arc<EventProducer>,
    topic: String,
}

impl KafkaFailureNotifier {
    pub fn new(producer: Arc<EventProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl FailureNotifier for KafkaFailureNotifier {
    async fn notify(&self, event: &FailureEvent) -> Result<()> {
        let envelope = event.clone().into_envelope();
        self.producer
            .send(&self.topic, Some(&event.key), &envelope)
            .await?;
        Ok(())
    }
}

/// Writes failure events to the log only. Used when Kafka is disabled.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl FailureNotifier for LoggingNotifier {
    async fn notify(&self, event: &FailureEvent) -> Result<()> {
        tracing::warn!(
            kind = ?event.kind,
            key = %event.key,
            provider = %event.provider,
            attempts = event.attempts,
            error = %event.error,
            "Idempotency failure alert"
        );
        Ok(())
    }
}
