pub mod cleanup;
pub mod clock;
pub mod handler;
pub mod key_generator;
pub mod ledger;
pub mod lock;
pub mod record;
pub mod retry;
pub mod stats;
pub mod storage;

pub use cleanup::{CleanupSweeper, SweepReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use handler::{
    IdempotencyHandler, IdempotencyMetrics, IdempotencyOutcome, IdempotentRequest, MetricsSnapshot,
    LOCK_NOT_ACQUIRED,
};
pub use key_generator::{IdempotencyAttributes, IdempotencyKey, IdempotencyKeyGenerator, KeyNamespace};
pub use ledger::{DuplicateCheck, StatusLedger};
pub use lock::{LockAcquisition, LockGuard, LockManager};
pub use record::{IdempotencyStatus, OperationRecord};
pub use retry::{ClaimAttempt, Contention, RetryController, RetryPolicy};
pub use stats::{LedgerSnapshot, LedgerStatsReporter};
pub use storage::{KeyTtl, KeyValueStore, MemoryStore, RedisStore, SharedStore};
