use crate::error::Result;
use crate::idempotency::key_generator::KeyNamespace;
use crate::idempotency::record::{IdempotencyStatus, OperationRecord};
use crate::idempotency::storage::SharedStore;
use crate::observability::get_metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-state counts over a bounded sample of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub provider: Option<String>,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub malformed: u64,
    pub locks_held: u64,
    /// Store keys examined, ledger and lock keys together.
    pub sampled: usize,
    /// The scan hit the sample cap, so counts are a lower bound.
    pub truncated: bool,
    pub taken_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    pub fn total_records(&self) -> u64 {
        self.processing + self.completed + self.failed
    }
}

/// Tallies ledger records per lifecycle state without unbounded scans.
#[derive(Clone)]
pub struct LedgerStatsReporter {
    store: SharedStore,
    namespace: KeyNamespace,
    sample_size: usize,
}

impl LedgerStatsReporter {
    pub fn new(store: SharedStore, namespace: KeyNamespace, sample_size: usize) -> Self {
        Self {
            store,
            namespace,
            sample_size,
        }
    }

    pub async fn snapshot(&self, provider: Option<&str>) -> Result<LedgerSnapshot> {
        let pattern = self.namespace.scan_pattern(provider);
        let keys = self.store.scan(&pattern, self.sample_size).await?;

        let mut snapshot = LedgerSnapshot {
            provider: provider.map(str::to_string),
            sampled: keys.len(),
            truncated: keys.len() >= self.sample_size,
            taken_at: Utc::now(),
            ..LedgerSnapshot::default()
        };

        for key in &keys {
            if self.namespace.is_lock_key(key) {
                snapshot.locks_held += 1;
                continue;
            }

            // Keys can expire between SCAN and GET.
            let Some(raw) = self.store.get(key).await? else {
                continue;
            };

            match serde_json::from_str::<OperationRecord>(&raw) {
                Ok(record) => match record.status {
                    IdempotencyStatus::Processing => snapshot.processing += 1,
                    IdempotencyStatus::Completed => snapshot.completed += 1,
                    IdempotencyStatus::Failed => snapshot.failed += 1,
                    IdempotencyStatus::Pending => {}
                },
                Err(_) => snapshot.malformed += 1,
            }
        }

        Ok(snapshot)
    }

    /// Takes a snapshot across all providers and publishes it as gauges.
    pub async fn publish(&self) -> Result<LedgerSnapshot> {
        let snapshot = self.snapshot(None).await?;
        get_metrics().set_ledger_records(IdempotencyStatus::Processing.as_str(), snapshot.processing);
        get_metrics().set_ledger_records(IdempotencyStatus::Completed.as_str(), snapshot.completed);
        get_metrics().set_ledger_records(IdempotencyStatus::Failed.as_str(), snapshot.failed);
        Ok(snapshot)
    }
}
