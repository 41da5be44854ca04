use crate::error::StoreResult;
use crate::idempotency::clock::Clock;
use crate::idempotency::key_generator::{IdempotencyKey, KeyNamespace};
use crate::idempotency::record::{IdempotencyStatus, OperationRecord};
use crate::idempotency::storage::SharedStore;
use crate::observability::get_metrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// What the ledger knows about a key at the time of the check.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateCheck {
    pub status: IdempotencyStatus,
    pub is_duplicate: bool,
    pub record: Option<OperationRecord>,
    /// The store could not be read and the check fell open to PENDING.
    pub fail_open: bool,
}

impl DuplicateCheck {
    fn pending(fail_open: bool) -> Self {
        Self {
            status: IdempotencyStatus::Pending,
            is_duplicate: false,
            record: None,
            fail_open,
        }
    }

    fn existing(record: OperationRecord) -> Self {
        Self {
            status: record.status,
            is_duplicate: true,
            record: Some(record),
            fail_open: false,
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.record.as_ref().and_then(|r| r.result.as_ref())
    }

    pub fn error(&self) -> Option<&str> {
        self.record.as_ref().and_then(|r| r.error.as_deref())
    }
}

/// Persists the lifecycle record of each key.
///
/// Writes are made only by the worker holding the key's lock. Reads fail open:
/// an unreachable store or an undecodable record reads as PENDING.
#[derive(Clone)]
pub struct StatusLedger {
    store: SharedStore,
    namespace: KeyNamespace,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl StatusLedger {
    pub fn new(store: SharedStore, namespace: KeyNamespace, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            namespace,
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Reads the current state of `key`.
    ///
    /// An unreachable store reads as PENDING; duplicates are possible for the
    /// length of the outage.
    pub async fn check_duplicate(&self, key: &IdempotencyKey) -> DuplicateCheck {
        let record_key = self.namespace.record_key(key);

        match self.store.get(&record_key).await {
            Ok(None) => DuplicateCheck::pending(false),
            Ok(Some(raw)) => match self.decode(&record_key, &raw) {
                Some(record) => DuplicateCheck::existing(record),
                None => DuplicateCheck::pending(false),
            },
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Duplicate check failed, proceeding fail-open as PENDING"
                );
                get_metrics().record_fail_open("check_duplicate");
                DuplicateCheck::pending(true)
            }
        }
    }

    /// Reads the record without the fail-open conversion.
    pub async fn get_record(&self, key: &IdempotencyKey) -> StoreResult<Option<OperationRecord>> {
        let record_key = self.namespace.record_key(key);
        let raw = self.store.get(&record_key).await?;
        Ok(raw.and_then(|raw| self.decode(&record_key, &raw)))
    }

    pub async fn mark_processing(
        &self,
        key: &IdempotencyKey,
        provider: &str,
        transaction_id: &str,
        context: Option<&str>,
        attempts: u32,
    ) -> StoreResult<OperationRecord> {
        let record = OperationRecord::processing(
            provider,
            transaction_id,
            context.map(str::to_string),
            attempts,
            self.clock.now(),
        );
        self.write(key, &record).await?;
        Ok(record)
    }

    /// Stores the terminal COMPLETED record and refreshes the full retention TTL.
    pub async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        record: OperationRecord,
        result: serde_json::Value,
    ) -> StoreResult<OperationRecord> {
        let record = record.complete(result, self.clock.now());
        self.write(key, &record).await?;
        Ok(record)
    }

    pub async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        record: OperationRecord,
        error: &str,
    ) -> StoreResult<OperationRecord> {
        let record = record.fail(error, self.clock.now());
        self.write(key, &record).await?;
        Ok(record)
    }

    async fn write(&self, key: &IdempotencyKey, record: &OperationRecord) -> StoreResult<()> {
        let record_key = self.namespace.record_key(key);
        let raw = serde_json::to_string(record)?;
        self.store.set(&record_key, &raw, self.ttl).await
    }

    fn decode(&self, record_key: &str, raw: &str) -> Option<OperationRecord> {
        match serde_json::from_str::<OperationRecord>(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    record_key = %record_key,
                    error = %e,
                    "Malformed ledger record, treating key as reclaimable"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::clock::ManualClock;
    use crate::idempotency::key_generator::IdempotencyKeyGenerator;
    use crate::idempotency::storage::{KeyTtl, KeyValueStore, MemoryStore};

    fn ledger_with_clock() -> (StatusLedger, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let ledger = StatusLedger::new(
            store.clone(),
            KeyNamespace::default(),
            Duration::from_secs(3600),
            clock.clone(),
        );
        (ledger, store, clock)
    }

    #[tokio::test]
    async fn test_absent_key_is_pending() {
        let (ledger, _, _) = ledger_with_clock();
        let key = IdempotencyKeyGenerator::new().key("sms", "m1", None);

        let check = ledger.check_duplicate(&key).await;
        assert_eq!(check.status, IdempotencyStatus::Pending);
        assert!(!check.is_duplicate);
        assert!(!check.fail_open);
    }

    #[tokio::test]
    async fn test_completed_record_round_trip() {
        let (ledger, store, _) = ledger_with_clock();
        let key = IdempotencyKeyGenerator::new().key("sms", "m1", None);

        let record = ledger.mark_processing(&key, "sms", "m1", None, 1).await.unwrap();
        let check = ledger.check_duplicate(&key).await;
        assert_eq!(check.status, IdempotencyStatus::Processing);

        ledger
            .mark_completed(&key, record, serde_json::json!({"response": "ok"}))
            .await
            .unwrap();

        let check = ledger.check_duplicate(&key).await;
        assert_eq!(check.status, IdempotencyStatus::Completed);
        assert!(check.is_duplicate);
        assert_eq!(check.result(), Some(&serde_json::json!({"response": "ok"})));

        let record_key = KeyNamespace::default().record_key(&key);
        assert!(matches!(store.ttl(&record_key).await.unwrap(), KeyTtl::Expires(_)));
    }

    #[tokio::test]
    async fn test_record_expires_after_ttl() {
        let (ledger, _, clock) = ledger_with_clock();
        let key = IdempotencyKeyGenerator::new().key("venmo", "txn_9", None);

        let record = ledger.mark_processing(&key, "venmo", "txn_9", None, 1).await.unwrap();
        ledger.mark_failed(&key, record, "card declined").await.unwrap();
        assert_eq!(ledger.check_duplicate(&key).await.status, IdempotencyStatus::Failed);

        clock.advance(chrono::Duration::seconds(3601));
        assert_eq!(ledger.check_duplicate(&key).await.status, IdempotencyStatus::Pending);
    }

    #[tokio::test]
    async fn test_malformed_record_reads_as_pending() {
        let (ledger, store, _) = ledger_with_clock();
        let key = IdempotencyKeyGenerator::new().key("sms", "bad", None);
        let record_key = KeyNamespace::default().record_key(&key);

        store.set(&record_key, "{not json", Duration::from_secs(60)).await.unwrap();

        let check = ledger.check_duplicate(&key).await;
        assert_eq!(check.status, IdempotencyStatus::Pending);
        assert!(!check.fail_open);
        assert_eq!(ledger.get_record(&key).await.unwrap(), None);
    }
}
