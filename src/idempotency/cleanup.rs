use crate::error::Result;
use crate::idempotency::key_generator::KeyNamespace;
use crate::idempotency::stats::{LedgerSnapshot, LedgerStatsReporter};
use crate::idempotency::storage::{KeyTtl, SharedStore};
use crate::observability::get_metrics;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub repaired: usize,
    /// This run reached the end of the keyspace; the next one starts over.
    pub cycle_complete: bool,
}

/// Applies the retention TTL to ledger records that were written without one.
///
/// Each run visits about `batch_size` store keys and resumes where the
/// previous run stopped, so successive runs cover the whole ledger. Clones
/// share the scan position.
#[derive(Clone)]
pub struct CleanupSweeper {
    store: SharedStore,
    namespace: KeyNamespace,
    retention: Duration,
    batch_size: usize,
    cursor: Arc<AtomicU64>,
    stats: Option<LedgerStatsReporter>,
}

impl CleanupSweeper {
    pub fn new(store: SharedStore, namespace: KeyNamespace, retention: Duration, batch_size: usize) -> Self {
        Self {
            store,
            namespace,
            retention,
            batch_size: batch_size.max(1),
            cursor: Arc::new(AtomicU64::new(0)),
            stats: None,
        }
    }

    /// Publishes ledger gauges from `reporter` on every background tick.
    pub fn with_stats(mut self, reporter: LedgerStatsReporter) -> Self {
        self.stats = Some(reporter);
        self
    }

    /// Sweeps the next batch of keys.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let pattern = self.namespace.scan_pattern(None);
        let mut cursor = self.cursor.load(Ordering::Acquire);
        let mut visited = 0usize;
        let mut report = SweepReport::default();

        loop {
            let (next, keys) = self
                .store
                .scan_page(&pattern, cursor, self.batch_size - visited)
                .await?;
            visited += keys.len();

            for key in keys {
                if self.namespace.is_lock_key(&key) {
                    continue;
                }
                report.scanned += 1;

                if self.store.ttl(&key).await? == KeyTtl::Persistent
                    && self.store.expire(&key, self.retention).await?
                {
                    tracing::debug!(record_key = %key, "Applied retention TTL to ledger record");
                    report.repaired += 1;
                }
            }

            cursor = next;
            // Keep the position after each page so a failed page is the only one retried.
            self.cursor.store(cursor, Ordering::Release);
            if cursor == 0 || visited >= self.batch_size {
                break;
            }
        }

        report.cycle_complete = cursor == 0;
        if report.repaired > 0 {
            get_metrics().record_sweep_repaired(report.repaired as u64);
        }
        Ok(report)
    }

    /// One background pass: sweep a batch, then refresh the ledger gauges.
    pub async fn tick(&self) -> (Result<SweepReport>, Option<LedgerSnapshot>) {
        let sweep = self.run_once().await;

        let snapshot = match &self.stats {
            Some(reporter) => match reporter.publish().await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    tracing::warn!("Failed to publish ledger gauges: {}", e);
                    None
                }
            },
            None => None,
        };

        (sweep, snapshot)
    }

    /// Starts the sweeper in a background task. Abort the handle to stop it.
    pub fn start(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;

                match self.tick().await.0 {
                    Ok(report) => {
                        if report.repaired > 0 {
                            tracing::info!(
                                scanned = report.scanned,
                                repaired = report.repaired,
                                "Repaired idempotency records missing an expiry"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to sweep idempotency records: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::storage::{KeyValueStore, MemoryStore};

    #[tokio::test]
    async fn test_sweep_repairs_only_persistent_records() {
        let store = Arc::new(MemoryStore::new());
        store.insert_without_expiry("idempotency:sms:aaa", "{}");
        store.insert_without_expiry("idempotency:sms:aaa:lock", "token");
        store.set("idempotency:sms:bbb", "{}", Duration::from_secs(60)).await.unwrap();
        store.insert_without_expiry("unrelated:key", "x");

        let sweeper = CleanupSweeper::new(store.clone(), KeyNamespace::default(), Duration::from_secs(3600), 100);
        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.repaired, 1);
        assert!(report.cycle_complete);
        assert!(matches!(store.ttl("idempotency:sms:aaa").await.unwrap(), KeyTtl::Expires(_)));
        assert_eq!(store.ttl("unrelated:key").await.unwrap(), KeyTtl::Persistent);

        let again = sweeper.run_once().await.unwrap();
        assert_eq!(again.repaired, 0);
    }

    #[tokio::test]
    async fn test_sweep_resumes_past_first_batch() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store
                .set(&format!("idempotency:a:{}", i), "{}", Duration::from_secs(600))
                .await
                .unwrap();
        }
        store.insert_without_expiry("idempotency:z:orphan", "{}");

        let sweeper = CleanupSweeper::new(store.clone(), KeyNamespace::default(), Duration::from_secs(3600), 3);

        let first = sweeper.run_once().await.unwrap();
        assert_eq!(first.scanned, 3);
        assert_eq!(first.repaired, 0);
        assert!(!first.cycle_complete);

        let second = sweeper.run_once().await.unwrap();
        assert_eq!(second.scanned, 3);
        assert_eq!(second.repaired, 1);
        assert!(second.cycle_complete);
        assert!(matches!(store.ttl("idempotency:z:orphan").await.unwrap(), KeyTtl::Expires(_)));

        // The next run starts over from the beginning.
        let third = sweeper.run_once().await.unwrap();
        assert_eq!(third.scanned, 3);
        assert!(!third.cycle_complete);
    }

    #[tokio::test]
    async fn test_tick_publishes_ledger_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.insert_without_expiry("idempotency:sms:aaa", "{not json");

        let reporter = LedgerStatsReporter::new(store.clone(), KeyNamespace::default(), 100);
        let sweeper = CleanupSweeper::new(store.clone(), KeyNamespace::default(), Duration::from_secs(3600), 100)
            .with_stats(reporter);

        let (sweep, snapshot) = sweeper.tick().await;
        assert_eq!(sweep.unwrap().repaired, 1);
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.malformed, 1);
        assert_eq!(snapshot.sampled, 1);

        let bare = CleanupSweeper::new(store, KeyNamespace::default(), Duration::from_secs(3600), 100);
        assert!(bare.tick().await.1.is_none());
    }
}
