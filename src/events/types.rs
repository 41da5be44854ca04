use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::idempotency::{IdempotencyKey, IdempotentRequest};

/// Topics for idempotency events.
pub mod topics {
    pub const FAILURES: &str = "idempotency.failures";
}

/// Type of idempotency event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    OperationFailed,
}

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The wrapped business operation returned an error.
    OperationFailed,
    /// The operation finished but its terminal state could not be written.
    LedgerWriteFailed,
    /// The key stayed PROCESSING for every retry.
    RetryExhausted,
}

/// Envelope wrapping all events with common metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub correlation_id: Option<String>,
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(event_type: EventType, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            source: "idempotency-layer".to_string(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Failure forwarded to the alerting collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub kind: FailureKind,
    pub key: String,
    pub provider: String,
    pub transaction_id: String,
    pub context: Option<String>,
    pub error: String,
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

impl FailureEvent {
    pub fn new(
        kind: FailureKind,
        key: &IdempotencyKey,
        request: &IdempotentRequest,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            kind,
            key: key.to_string(),
            provider: request.provider.clone(),
            transaction_id: request.transaction_id.clone(),
            context: request.context.clone(),
            error: error.into(),
            attempts,
            occurred_at: Utc::now(),
        }
    }

    pub fn into_envelope(self) -> EventEnvelope<FailureEvent> {
        let correlation_id = self.key.clone();
        EventEnvelope::new(EventType::OperationFailed, self).with_correlation_id(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::IdempotencyKeyGenerator;

    #[test]
    fn test_failure_event_envelope() {
        let request = IdempotentRequest::new("venmo", "txn_1").with_context("payment");
        let key = IdempotencyKeyGenerator::new().key("venmo", "txn_1", Some("payment"));
        let event = FailureEvent::new(FailureKind::OperationFailed, &key, &request, "insufficient funds", 1);

        let envelope = event.clone().into_envelope();
        assert_eq!(envelope.event_type, EventType::OperationFailed);
        assert_eq!(envelope.correlation_id, Some(key.to_string()));
        assert_eq!(envelope.payload, event);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["payload"]["kind"], "OPERATION_FAILED");
        assert_eq!(json["payload"]["provider"], "venmo");
        assert_eq!(json["payload"]["context"], "payment");
    }
}
