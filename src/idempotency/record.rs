use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an idempotency key.
///
/// `Pending` is never stored: it is the state of a key with no ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IdempotencyStatus::Completed | IdempotencyStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "PENDING",
            IdempotencyStatus::Processing => "PROCESSING",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger record stored under `<prefix>:<key>`.
///
/// The result payload is kept as opaque JSON; callers type it at the call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub provider: String,
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl OperationRecord {
    pub fn processing(
        provider: impl Into<String>,
        transaction_id: impl Into<String>,
        context: Option<String>,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: IdempotencyStatus::Processing,
            result: None,
            error: None,
            provider: provider.into(),
            transaction_id: transaction_id.into(),
            context,
            created_at: now,
            updated_at: now,
            completed_at: None,
            attempts,
        }
    }

    pub fn complete(mut self, result: serde_json::Value, now: DateTime<Utc>) -> Self {
        self.status = IdempotencyStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.updated_at = now;
        self.completed_at = Some(now);
        self
    }

    pub fn fail(mut self, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        self.status = IdempotencyStatus::Failed;
        self.result = None;
        self.error = Some(error.into());
        self.updated_at = now;
        self.completed_at = Some(now);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == IdempotencyStatus::Failed
    }

    /// Time since the current attempt started.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&IdempotencyStatus::Processing).unwrap(),
            "\"PROCESSING\""
        );
        let status: IdempotencyStatus = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(status, IdempotencyStatus::Completed);
        assert!(status.is_terminal());
        assert!(!IdempotencyStatus::Processing.is_terminal());
    }

    #[test]
    fn test_record_lifecycle() {
        let now = Utc::now();
        let record = OperationRecord::processing("venmo", "txn_1", Some("payment".to_string()), 1, now);
        assert_eq!(record.status, IdempotencyStatus::Processing);
        assert!(!record.is_completed());

        let later = now + Duration::seconds(3);
        let completed = record.clone().complete(serde_json::json!({"charged": true}), later);
        assert!(completed.is_completed());
        assert_eq!(completed.completed_at, Some(later));
        assert_eq!(completed.created_at, now);

        let failed = record.fail("insufficient funds", later);
        assert!(failed.is_failed());
        assert_eq!(failed.error.as_deref(), Some("insufficient funds"));
        assert_eq!(failed.age(later), Duration::seconds(3));
    }

    #[test]
    fn test_record_json_layout() {
        let now = Utc::now();
        let record = OperationRecord::processing("sms", "m1", None, 1, now);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "PROCESSING");
        assert_eq!(json["transactionId"], "m1");
        assert!(json.get("result").is_none());
        assert!(json.get("createdAt").is_some());
    }
}
