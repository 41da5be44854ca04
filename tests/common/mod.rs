#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use idempotency_layer::config::IdempotencySettings;
use idempotency_layer::error::Result;
use idempotency_layer::events::{FailureEvent, FailureNotifier};
use idempotency_layer::idempotency::{IdempotencyHandler, ManualClock, MemoryStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Settings with millisecond backoff so contended paths finish quickly.
pub fn fast_settings() -> IdempotencySettings {
    IdempotencySettings {
        base_delay_ms: 10,
        max_delay_ms: 1000,
        max_retries: 5,
        ..IdempotencySettings::default()
    }
}

pub fn memory_handler(settings: IdempotencySettings) -> (Arc<MemoryStore>, IdempotencyHandler) {
    let store = Arc::new(MemoryStore::new());
    let handler = IdempotencyHandler::new(store.clone(), settings).expect("valid settings");
    (store, handler)
}

/// Handler whose ledger timestamps and store TTLs follow a shared manual clock.
pub fn manual_handler(
    settings: IdempotencySettings,
) -> (Arc<ManualClock>, Arc<MemoryStore>, IdempotencyHandler) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let handler =
        IdempotencyHandler::with_clock(store.clone(), settings, clock.clone()).expect("valid settings");
    (clock, store, handler)
}

/// Counts how many times the wrapped side effect really ran.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captures failure alerts for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<FailureEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<FailureEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureNotifier for RecordingNotifier {
    async fn notify(&self, event: &FailureEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
