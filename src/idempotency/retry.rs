use crate::error::StoreError;
use crate::idempotency::key_generator::IdempotencyKey;
use crate::idempotency::ledger::{DuplicateCheck, StatusLedger};
use crate::idempotency::lock::{LockAcquisition, LockGuard, LockManager};
use crate::idempotency::record::{IdempotencyStatus, OperationRecord};
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff schedule used while another worker holds a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_retries: 5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (1-based): `base_delay * 2^(attempt-1)`,
    /// capped at `max_delay`. Validated settings keep the cap at or above the
    /// last step, so the cap only bounds hand-built policies.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries).map(|k| self.delay_for_attempt(k)).collect()
    }
}

/// Result of trying to take ownership of a key.
pub enum ClaimAttempt {
    /// The lock is ours and no terminal record exists. `previous` is the
    /// record being reclaimed, if any.
    Claimed {
        guard: LockGuard,
        previous: Option<OperationRecord>,
    },
    /// A terminal record was found once the lock was held.
    Settled(DuplicateCheck),
    /// Another worker holds the key.
    Busy,
    /// The lock could not be written; proceeding would break exclusivity.
    Unavailable(StoreError),
}

/// How a contended call ended.
pub enum Contention {
    Settled(DuplicateCheck),
    Claimed {
        guard: LockGuard,
        previous: Option<OperationRecord>,
    },
    Exhausted { attempts: u32 },
    DeadlineExceeded { attempts: u32 },
    LockUnavailable(StoreError),
}

pub(crate) enum NextStep {
    Return,
    Claim,
    Wait,
}

/// Decides what to do with a ledger observation and polls with backoff while
/// another worker is processing the key.
#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    ledger: StatusLedger,
    locks: LockManager,
    retry_failed: bool,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, ledger: StatusLedger, locks: LockManager, retry_failed: bool) -> Self {
        Self {
            policy,
            ledger,
            locks,
            retry_failed,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// A PROCESSING record whose attempt is older than the lock TTL can only
    /// belong to a holder whose lock is gone.
    fn is_stale(&self, record: &OperationRecord) -> bool {
        let lock_ttl = chrono::Duration::from_std(self.locks.ttl()).unwrap_or(chrono::Duration::days(36500));
        record.age(self.ledger.now()) >= lock_ttl
    }

    pub(crate) fn next_step(&self, check: &DuplicateCheck) -> NextStep {
        match check.status {
            IdempotencyStatus::Pending => NextStep::Claim,
            IdempotencyStatus::Completed => NextStep::Return,
            IdempotencyStatus::Failed if self.retry_failed => NextStep::Claim,
            IdempotencyStatus::Failed => NextStep::Return,
            IdempotencyStatus::Processing => match &check.record {
                Some(record) if self.is_stale(record) => NextStep::Claim,
                _ => NextStep::Wait,
            },
        }
    }

    /// Acquires the lock and re-reads the ledger under it, so a caller that
    /// checked before a concurrent winner finished cannot run the operation again.
    pub async fn try_claim(&self, key: &IdempotencyKey) -> ClaimAttempt {
        let guard = match self.locks.acquire(key).await {
            Ok(LockAcquisition::Acquired(guard)) => guard,
            Ok(LockAcquisition::Contended) => return ClaimAttempt::Busy,
            Err(e) => return ClaimAttempt::Unavailable(e),
        };

        let check = self.ledger.check_duplicate(key).await;
        match self.next_step(&check) {
            NextStep::Claim => {
                if let Some(previous) = check.record.as_ref().filter(|r| r.status == IdempotencyStatus::Processing) {
                    tracing::warn!(
                        key = %key,
                        attempts = previous.attempts,
                        "Reclaiming orphaned PROCESSING record"
                    );
                }
                ClaimAttempt::Claimed {
                    guard,
                    previous: check.record,
                }
            }
            NextStep::Return => {
                let _ = guard.release().await;
                ClaimAttempt::Settled(check)
            }
            NextStep::Wait => {
                let _ = guard.release().await;
                ClaimAttempt::Busy
            }
        }
    }

    /// Polls the ledger with exponential backoff until the key settles, the
    /// key becomes claimable, retries run out, or `deadline` passes.
    pub async fn await_settlement(&self, key: &IdempotencyKey, deadline: Option<Instant>) -> Contention {
        for attempt in 1..=self.policy.max_retries {
            let delay = self.policy.delay_for_attempt(attempt);
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Contention::DeadlineExceeded { attempts: attempt - 1 };
                    }
                    tokio::time::sleep(delay.min(deadline - now)).await;
                }
                None => tokio::time::sleep(delay).await,
            }

            let check = self.ledger.check_duplicate(key).await;
            tracing::debug!(key = %key, attempt, status = %check.status, "Polled contended key");

            match self.next_step(&check) {
                NextStep::Return => return Contention::Settled(check),
                NextStep::Claim => match self.try_claim(key).await {
                    ClaimAttempt::Claimed { guard, previous } => {
                        return Contention::Claimed { guard, previous }
                    }
                    ClaimAttempt::Settled(check) => return Contention::Settled(check),
                    ClaimAttempt::Unavailable(e) => return Contention::LockUnavailable(e),
                    ClaimAttempt::Busy => {}
                },
                NextStep::Wait => {}
            }

            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Contention::DeadlineExceeded { attempts: attempt };
            }
        }

        Contention::Exhausted {
            attempts: self.policy.max_retries,
        }
    }
}
