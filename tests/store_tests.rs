mod common;

use idempotency_layer::config::IdempotencySettings;
use idempotency_layer::idempotency::{
    CleanupSweeper, IdempotencyKeyGenerator, IdempotencyStatus, KeyNamespace, KeyTtl, KeyValueStore,
    LedgerStatsReporter, LockAcquisition, LockManager, MemoryStore, RedisStore, SharedStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

/// Exercises the store contract the idempotency layer relies on.
async fn assert_store_contract(store: &dyn KeyValueStore, prefix: &str) {
    let key = format!("{}:contract:a", prefix);

    assert!(store.set_if_absent(&key, "owner-1", Duration::from_secs(30)).await.unwrap());
    assert!(!store.set_if_absent(&key, "owner-2", Duration::from_secs(30)).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("owner-1"));

    assert!(!store.delete_if_equals(&key, "owner-2").await.unwrap());
    assert!(store.delete_if_equals(&key, "owner-1").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), None);
    assert_eq!(store.ttl(&key).await.unwrap(), KeyTtl::Missing);

    store.set(&key, "v", Duration::from_secs(60)).await.unwrap();
    match store.ttl(&key).await.unwrap() {
        KeyTtl::Expires(remaining) => assert!(remaining <= Duration::from_secs(60)),
        other => panic!("expected an expiry, got {:?}", other),
    }
    assert!(store.expire(&key, Duration::from_secs(120)).await.unwrap());
    assert!(!store.expire(&format!("{}:contract:missing", prefix), Duration::from_secs(1)).await.unwrap());

    assert!(store.delete(&key).await.unwrap());
    assert!(!store.delete(&key).await.unwrap());
    assert_ok!(store.ping().await);
}

#[tokio::test]
async fn test_memory_store_contract() {
    let store = MemoryStore::new();
    assert_store_contract(&store, "idempotency-test").await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_memory_store_lock_expires_with_manual_clock() {
    let (clock, store, _handler) = common::manual_handler(common::fast_settings());
    let locks = LockManager::new(store.clone(), KeyNamespace::default(), Duration::from_secs(30));
    let key = IdempotencyKeyGenerator::new().key("venmo", "txn_crash", None);

    let abandoned = match locks.acquire(&key).await.unwrap() {
        LockAcquisition::Acquired(guard) => guard,
        LockAcquisition::Contended => panic!("lock should be free"),
    };
    assert!(!locks.acquire(&key).await.unwrap().is_acquired());

    clock.advance(chrono::Duration::seconds(30));
    let successor = locks.acquire(&key).await.unwrap();
    assert!(successor.is_acquired());

    // The expired holder must not delete the successor's lock.
    assert!(!abandoned.release().await.unwrap());
    assert!(locks.is_held(&key).await.unwrap());
}

#[tokio::test]
async fn test_unreachable_redis_fails_to_connect() {
    let unreachable = redis::Client::open("redis://127.0.0.1:1/").expect("valid redis url");
    let result = RedisStore::connect(&unreachable, Duration::from_millis(200)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_scan_filters_by_provider() {
    let store = Arc::new(MemoryStore::new());
    let namespace = KeyNamespace::default();
    let generator = IdempotencyKeyGenerator::new();

    for (provider, id) in [("sms", "m1"), ("sms", "m2"), ("venmo", "t1")] {
        let key = generator.key(provider, id, None);
        store
            .set(&namespace.record_key(&key), "{}", Duration::from_secs(60))
            .await
            .unwrap();
    }

    let sms = store.scan(&namespace.scan_pattern(Some("sms")), 100).await.unwrap();
    assert_eq!(sms.len(), 2);
    let all = store.scan(&namespace.scan_pattern(None), 100).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_sweeper_and_stats_over_handler_ledger() {
    let (store, handler) = common::memory_handler(common::fast_settings());

    handler
        .execute_with_idempotency("sms", "m1", || async { Ok::<_, String>(json!("ok")) }, None)
        .await;
    handler
        .execute_with_idempotency("sms", "m2", || async { Err::<String, _>("carrier rejected") }, None)
        .await;

    // A record written by hand without an expiry.
    let orphan = handler.key("sms", "m3", None);
    let record = json!({
        "status": "COMPLETED",
        "provider": "sms",
        "transactionId": "m3",
        "createdAt": "2024-01-15T12:00:00Z",
        "updatedAt": "2024-01-15T12:00:00Z",
        "attempts": 1
    });
    store.insert_without_expiry(&handler.namespace().record_key(&orphan), &record.to_string());

    let report = handler.sweeper().run_once().await.unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.repaired, 1);

    let snapshot = handler.stats_reporter().snapshot(Some("sms")).await.unwrap();
    assert_eq!(snapshot.completed, 2);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.locks_held, 0);

    let record = handler.ledger().get_record(&orphan).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
}

#[tokio::test]
async fn test_sweeper_respects_batch_size() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..10 {
        store.insert_without_expiry(&format!("idempotency:sms:{:02}", i), "{}");
    }

    let sweeper = CleanupSweeper::new(store.clone(), KeyNamespace::default(), Duration::from_secs(60), 4);
    assert_eq!(sweeper.run_once().await.unwrap().repaired, 4);

    let reporter = LedgerStatsReporter::new(store, KeyNamespace::default(), 4);
    assert!(reporter.snapshot(None).await.unwrap().truncated);
}

#[tokio::test]
async fn test_handler_sweeps_reach_records_past_first_batch() {
    let settings = IdempotencySettings {
        sweep_batch_size: 3,
        ..common::fast_settings()
    };
    let (store, handler) = common::memory_handler(settings);

    for i in 0..5 {
        store
            .set(&format!("idempotency:a:{}", i), "{}", Duration::from_secs(600))
            .await
            .unwrap();
    }
    store.insert_without_expiry("idempotency:z:orphan", "{}");

    // Each call hands out a fresh clone; the scan position is shared.
    let mut repaired = 0;
    for _ in 0..2 {
        repaired += handler.sweeper().run_once().await.unwrap().repaired;
    }

    assert_eq!(repaired, 1);
    assert!(matches!(store.ttl("idempotency:z:orphan").await.unwrap(), KeyTtl::Expires(_)));
}

/// Runs against a live Redis when `REDIS_URL` is set.
#[tokio::test]
async fn test_redis_store_contract() {
    dotenvy::dotenv().ok();
    let Ok(url) = std::env::var("REDIS_URL") else {
        return;
    };

    let client = redis::Client::open(url).expect("valid redis url");
    let store: SharedStore = Arc::new(
        RedisStore::connect(&client, Duration::from_secs(2))
            .await
            .expect("Failed to connect to redis"),
    );

    let prefix = format!("idempotency-test-{}", uuid::Uuid::new_v4());
    assert_store_contract(store.as_ref(), &prefix).await;
}
