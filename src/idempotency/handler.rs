use crate::config::IdempotencySettings;
use crate::error::{AppError, Result, StoreError};
use crate::events::{FailureEvent, FailureKind, FailureNotifier};
use crate::idempotency::cleanup::CleanupSweeper;
use crate::idempotency::clock::{Clock, SystemClock};
use crate::idempotency::key_generator::{IdempotencyKey, IdempotencyKeyGenerator, KeyNamespace};
use crate::idempotency::ledger::{DuplicateCheck, StatusLedger};
use crate::idempotency::lock::{LockGuard, LockManager};
use crate::idempotency::record::{IdempotencyStatus, OperationRecord};
use crate::idempotency::retry::{ClaimAttempt, Contention, NextStep, RetryController, RetryPolicy};
use crate::idempotency::stats::LedgerStatsReporter;
use crate::idempotency::storage::SharedStore;
use crate::observability::{get_metrics, mask_sensitive, LatencyTimer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use validator::Validate;

pub const LOCK_NOT_ACQUIRED: &str = "could not acquire processing lock";

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub duplicate_requests: AtomicU64,
    pub new_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub contended_requests: AtomicU64,
    pub fail_open_checks: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contended(&self) {
        self.contended_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail_open(&self) {
        self.fail_open_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            duplicate_requests: self.duplicate_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            contended_requests: self.contended_requests.load(Ordering::Relaxed),
            fail_open_checks: self.fail_open_checks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub duplicate_requests: u64,
    pub new_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub contended_requests: u64,
    pub fail_open_checks: u64,
}

impl MetricsSnapshot {
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.duplicate_requests as f64 / self.total_requests as f64
        }
    }
}

/// One inbound event to execute at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentRequest {
    pub provider: String,
    pub transaction_id: String,
    pub context: Option<String>,
    /// Upper bound on how long this caller waits behind another worker.
    pub deadline: Option<Duration>,
}

impl IdempotentRequest {
    pub fn new(provider: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            transaction_id: transaction_id.into(),
            context: None,
            deadline: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Result handed back to the caller for every execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyOutcome<T> {
    pub key: String,
    pub status: IdempotencyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_duplicate: bool,
    /// The caller should retry later (e.g. answer with a retriable HTTP status).
    pub retriable: bool,
}

impl<T> IdempotencyOutcome<T> {
    fn completed(key: &IdempotencyKey, result: T, is_duplicate: bool) -> Self {
        Self {
            key: key.to_string(),
            status: IdempotencyStatus::Completed,
            result: Some(result),
            error: None,
            is_duplicate,
            retriable: false,
        }
    }

    fn failed(key: &IdempotencyKey, error: impl Into<String>, is_duplicate: bool, retriable: bool) -> Self {
        Self {
            key: key.to_string(),
            status: IdempotencyStatus::Failed,
            result: None,
            error: Some(error.into()),
            is_duplicate,
            retriable,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == IdempotencyStatus::Failed
    }
}

/// Executes externally triggered operations with exactly-once effect per key.
///
/// All coordination goes through the shared store; nothing here relies on
/// in-process locking, so any number of processes may share one store.
pub struct IdempotencyHandler {
    store: SharedStore,
    namespace: KeyNamespace,
    key_generator: IdempotencyKeyGenerator,
    ledger: StatusLedger,
    locks: LockManager,
    retry: RetryController,
    sweeper: CleanupSweeper,
    notifier: Option<Arc<dyn FailureNotifier>>,
    metrics: Arc<IdempotencyMetrics>,
    settings: IdempotencySettings,
}

impl IdempotencyHandler {
    pub fn new(store: SharedStore, settings: IdempotencySettings) -> Result<Self> {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    /// Builds the handler. Invalid settings are rejected here, never at call time.
    pub fn with_clock(store: SharedStore, settings: IdempotencySettings, clock: Arc<dyn Clock>) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| AppError::Validation(format!("invalid idempotency settings: {}", e)))?;

        let namespace = KeyNamespace::new(settings.key_prefix.clone());
        let ledger = StatusLedger::new(store.clone(), namespace.clone(), settings.ledger_ttl(), clock);
        let locks = LockManager::new(store.clone(), namespace.clone(), settings.lock_ttl());
        let policy = RetryPolicy {
            base_delay: settings.base_delay(),
            max_retries: settings.max_retries,
            max_delay: settings.max_delay(),
        };
        let retry = RetryController::new(policy, ledger.clone(), locks.clone(), settings.retry_failed);
        let sweeper = CleanupSweeper::new(
            store.clone(),
            namespace.clone(),
            settings.ledger_ttl(),
            settings.sweep_batch_size,
        )
        .with_stats(LedgerStatsReporter::new(
            store.clone(),
            namespace.clone(),
            settings.stats_sample_size,
        ));

        Ok(Self {
            store,
            namespace,
            key_generator: IdempotencyKeyGenerator::new(),
            ledger,
            locks,
            retry,
            sweeper,
            notifier: None,
            metrics: Arc::new(IdempotencyMetrics::new()),
            settings,
        })
    }

    /// Forwards failures to an alerting collaborator.
    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn settings(&self) -> &IdempotencySettings {
        &self.settings
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn key(&self, provider: &str, transaction_id: &str, context: Option<&str>) -> IdempotencyKey {
        self.key_generator.key(provider, transaction_id, context)
    }

    /// The ledger sweeper. Every clone shares one scan position.
    pub fn sweeper(&self) -> CleanupSweeper {
        self.sweeper.clone()
    }

    pub fn stats_reporter(&self) -> LedgerStatsReporter {
        LedgerStatsReporter::new(
            self.store.clone(),
            self.namespace.clone(),
            self.settings.stats_sample_size,
        )
    }

    /// Runs `operation` at most once for (provider, transaction_id, context).
    pub async fn execute_with_idempotency<T, E, F, Fut>(
        &self,
        provider: &str,
        transaction_id: &str,
        operation: F,
        context: Option<&str>,
    ) -> IdempotencyOutcome<T>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut request = IdempotentRequest::new(provider, transaction_id);
        request.context = context.map(str::to_string);
        self.execute(&request, operation).await
    }

    /// Check, claim, run, record, release.
    ///
    /// Never returns an error: store failures and operation failures are both
    /// folded into the outcome.
    pub async fn execute<T, E, F, Fut>(&self, request: &IdempotentRequest, operation: F) -> IdempotencyOutcome<T>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.metrics.record_request();
        let key = self.key_generator.key(
            &request.provider,
            &request.transaction_id,
            request.context.as_deref(),
        );
        let deadline = request.deadline.map(|d| Instant::now() + d);

        let check = self.ledger.check_duplicate(&key).await;
        if check.fail_open {
            self.metrics.record_fail_open();
        }

        let (guard, previous) = match self.retry.next_step(&check) {
            NextStep::Return => return self.duplicate_outcome(&key, check),
            NextStep::Claim => match self.retry.try_claim(&key).await {
                ClaimAttempt::Claimed { guard, previous } => (guard, previous),
                ClaimAttempt::Settled(check) => return self.duplicate_outcome(&key, check),
                ClaimAttempt::Unavailable(e) => return self.lock_unavailable(&key, request, e),
                ClaimAttempt::Busy => match self.contend(&key, request, deadline).await {
                    Ok(claim) => claim,
                    Err(outcome) => return outcome,
                },
            },
            NextStep::Wait => match self.contend(&key, request, deadline).await {
                Ok(claim) => claim,
                Err(outcome) => return outcome,
            },
        };

        self.run_claimed(&key, request, guard, previous, operation).await
    }

    async fn contend<T>(
        &self,
        key: &IdempotencyKey,
        request: &IdempotentRequest,
        deadline: Option<Instant>,
    ) -> std::result::Result<(LockGuard, Option<OperationRecord>), IdempotencyOutcome<T>>
    where
        T: DeserializeOwned,
    {
        self.metrics.record_contended();
        get_metrics().record_lock_contention(key.provider());
        tracing::debug!(key = %key, "Key is being processed by another worker, waiting");

        match self.retry.await_settlement(key, deadline).await {
            Contention::Claimed { guard, previous } => Ok((guard, previous)),
            Contention::Settled(check) => Err(self.duplicate_outcome(key, check)),
            Contention::LockUnavailable(e) => Err(self.lock_unavailable(key, request, e)),
            Contention::Exhausted { attempts } => {
                tracing::warn!(
                    key = %key,
                    provider = %request.provider,
                    transaction_id = %mask_sensitive(&request.transaction_id, 3),
                    attempts,
                    "Key still PROCESSING after retries"
                );
                get_metrics().record_retry_exhausted(key.provider());
                get_metrics().record_request_outcome(key.provider(), "retry_exhausted");
                self.metrics.record_failed();
                self.notify(FailureEvent::new(
                    FailureKind::RetryExhausted,
                    key,
                    request,
                    LOCK_NOT_ACQUIRED,
                    attempts,
                ))
                .await;
                Err(IdempotencyOutcome::failed(key, LOCK_NOT_ACQUIRED, true, true))
            }
            Contention::DeadlineExceeded { attempts } => {
                tracing::warn!(key = %key, attempts, "Caller deadline passed while waiting for processing lock");
                get_metrics().record_request_outcome(key.provider(), "deadline_exceeded");
                self.metrics.record_failed();
                Err(IdempotencyOutcome::failed(
                    key,
                    format!("{} before caller deadline", LOCK_NOT_ACQUIRED),
                    true,
                    true,
                ))
            }
        }
    }

    async fn run_claimed<T, E, F, Fut>(
        &self,
        key: &IdempotencyKey,
        request: &IdempotentRequest,
        guard: LockGuard,
        previous: Option<OperationRecord>,
        operation: F,
    ) -> IdempotencyOutcome<T>
    where
        T: Serialize,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let attempts = previous.as_ref().map_or(1, |r| r.attempts + 1);
        if previous.as_ref().map_or(false, |r| r.status == IdempotencyStatus::Processing) {
            get_metrics().record_reclaimed(key.provider());
        }

        let record = match self
            .ledger
            .mark_processing(
                key,
                &request.provider,
                &request.transaction_id,
                request.context.as_deref(),
                attempts,
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                let _ = guard.release().await;
                return self.lock_unavailable(key, request, e);
            }
        };

        self.metrics.record_new();
        tracing::info!(
            key = %key,
            provider = %request.provider,
            transaction_id = %mask_sensitive(&request.transaction_id, 3),
            attempts,
            "Executing idempotent operation"
        );

        let timer = LatencyTimer::new();
        let result = operation().await;
        let elapsed_ms = timer.elapsed_ms();

        let (outcome, alert) = match result {
            Ok(value) => match serde_json::to_value(&value) {
                Ok(json) => {
                    let alert = match self.ledger.mark_completed(key, record, json).await {
                        Ok(_) => None,
                        Err(e) => {
                            tracing::error!(key = %key, error = %e, "Failed to mark idempotency key as completed");
                            Some(FailureEvent::new(
                                FailureKind::LedgerWriteFailed,
                                key,
                                request,
                                e.to_string(),
                                attempts,
                            ))
                        }
                    };
                    self.metrics.record_completed();
                    get_metrics().record_operation_duration(key.provider(), "completed", elapsed_ms);
                    get_metrics().record_request_outcome(key.provider(), "completed");
                    (IdempotencyOutcome::completed(key, value, false), alert)
                }
                Err(e) => {
                    let message = format!("operation result could not be serialized: {}", e);
                    let alert = self
                        .record_failure(key, request, record, &message, attempts, elapsed_ms)
                        .await;
                    (IdempotencyOutcome::failed(key, message, false, false), Some(alert))
                }
            },
            Err(e) => {
                let message = e.to_string();
                let alert = self
                    .record_failure(key, request, record, &message, attempts, elapsed_ms)
                    .await;
                (IdempotencyOutcome::failed(key, message, false, false), Some(alert))
            }
        };

        // Alert delivery retries on its own schedule and must not extend the lock.
        let _ = guard.release().await;
        if let Some(alert) = alert {
            self.notify(alert).await;
        }
        outcome
    }

    /// Stores the FAILED record and returns the alert to send once the lock is released.
    async fn record_failure(
        &self,
        key: &IdempotencyKey,
        request: &IdempotentRequest,
        record: OperationRecord,
        message: &str,
        attempts: u32,
        elapsed_ms: f64,
    ) -> FailureEvent {
        tracing::warn!(
            key = %key,
            provider = %request.provider,
            transaction_id = %mask_sensitive(&request.transaction_id, 3),
            error = %message,
            "Idempotent operation failed"
        );

        if let Err(e) = self.ledger.mark_failed(key, record, message).await {
            tracing::error!(key = %key, error = %e, "Failed to mark idempotency key as failed");
        }
        self.metrics.record_failed();
        get_metrics().record_operation_duration(key.provider(), "failed", elapsed_ms);
        get_metrics().record_request_outcome(key.provider(), "failed");

        FailureEvent::new(FailureKind::OperationFailed, key, request, message, attempts)
    }

    fn duplicate_outcome<T: DeserializeOwned>(&self, key: &IdempotencyKey, check: DuplicateCheck) -> IdempotencyOutcome<T> {
        self.metrics.record_duplicate();
        get_metrics().record_duplicate(key.provider(), check.status.as_str());
        get_metrics().record_request_outcome(key.provider(), "duplicate");

        match check.status {
            IdempotencyStatus::Completed => {
                let decoded = check
                    .result()
                    .cloned()
                    .map(serde_json::from_value::<T>)
                    .unwrap_or_else(|| serde_json::from_value::<T>(serde_json::Value::Null));
                match decoded {
                    Ok(result) => IdempotencyOutcome::completed(key, result, true),
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "Stored result does not match the requested type");
                        IdempotencyOutcome::failed(
                            key,
                            format!("stored result could not be decoded: {}", e),
                            true,
                            false,
                        )
                    }
                }
            }
            _ => IdempotencyOutcome::failed(
                key,
                check.error().unwrap_or("operation previously failed").to_string(),
                true,
                false,
            ),
        }
    }

    fn lock_unavailable<T>(&self, key: &IdempotencyKey, request: &IdempotentRequest, error: StoreError) -> IdempotencyOutcome<T> {
        tracing::error!(
            key = %key,
            provider = %request.provider,
            error = %error,
            "Store unavailable while claiming key, refusing to execute"
        );
        self.metrics.record_failed();
        get_metrics().record_request_outcome(key.provider(), "lock_unavailable");
        IdempotencyOutcome::failed(key, format!("{}: {}", LOCK_NOT_ACQUIRED, error), false, true)
    }

    async fn notify(&self, event: FailureEvent) {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&event).await {
                tracing::warn!(key = %event.key, error = %e, "Failed to forward failure alert");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::storage::MemoryStore;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = IdempotencyMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_duplicate();
        metrics.record_new();
        metrics.record_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.duplicate_requests, 1);
        assert_eq!(snapshot.new_requests, 1);
        assert_eq!(snapshot.completed_requests, 1);
        assert_eq!(snapshot.duplicate_rate(), 0.5);
    }

    #[test]
    fn test_invalid_settings_rejected_at_construction() {
        let settings = IdempotencySettings {
            lock_ttl_secs: 120,
            ledger_ttl_secs: 60,
            ..IdempotencySettings::default()
        };
        let result = IdempotencyHandler::new(Arc::new(MemoryStore::new()), settings);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_backoff_cap_below_schedule_rejected_at_construction() {
        let settings = IdempotencySettings {
            max_retries: 7,
            ..IdempotencySettings::default()
        };
        let result = IdempotencyHandler::new(Arc::new(MemoryStore::new()), settings);
        assert!(matches!(result, Err(AppError::Validation(_))));

        let settings = IdempotencySettings {
            max_retries: 7,
            max_delay_ms: 64_000,
            ..IdempotencySettings::default()
        };
        let policy = RetryPolicy {
            base_delay: settings.base_delay(),
            max_retries: settings.max_retries,
            max_delay: settings.max_delay(),
        };
        assert!(IdempotencyHandler::new(Arc::new(MemoryStore::new()), settings).is_ok());
        for k in 1..=7u32 {
            assert_eq!(policy.delay_for_attempt(k), Duration::from_millis(1000 * 2u64.pow(k - 1)));
        }
    }

    #[test]
    fn test_outcome_json_shape() {
        let key = IdempotencyKeyGenerator::new().key("sms", "m1", None);
        let outcome = IdempotencyOutcome::completed(&key, serde_json::json!({"response": "ok"}), true);
        let json = serde_json::to_value(&outcome).unwrap();

        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["isDuplicate"], true);
        assert_eq!(json["result"]["response"], "ok");
        assert!(json.get("error").is_none());
    }
}
