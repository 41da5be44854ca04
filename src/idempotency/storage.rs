use crate::error::{AppError, Result, StoreError, StoreResult};
use crate::idempotency::clock::{Clock, SystemClock};
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Remaining lifetime of a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or has already expired).
    Missing,
    /// The key exists without an expiry.
    Persistent,
    Expires(Duration),
}

/// Atomic key-value operations the idempotency layer depends on.
///
/// `set_if_absent` and `delete_if_equals` must be atomic with respect to
/// concurrent callers in every process sharing the store; mutual exclusion
/// rests entirely on them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes `value` only if `key` is absent. Returns true if the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Deletes `key` only if its current value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// Sets an expiry on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Returns at most `limit` keys matching a glob `pattern`.
    async fn scan(&self, pattern: &str, limit: usize) -> StoreResult<Vec<String>>;

    /// One page of a resumable scan, roughly `count` keys long. Start from
    /// cursor 0; a returned cursor of 0 means the keyspace has been walked.
    async fn scan_page(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<(u64, Vec<String>)>;

    async fn ping(&self) -> StoreResult<()>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

const RELEASE_IF_OWNER_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const SCAN_PAGE_SIZE: usize = 100;

/// Redis-backed store over a multiplexed connection.
pub struct RedisStore {
    conn: MultiplexedConnection,
    operation_timeout: Duration,
    release_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(client: &redis::Client, operation_timeout: Duration) -> Result<Self> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;

        Ok(Self::from_connection(conn, operation_timeout))
    }

    pub fn from_connection(conn: MultiplexedConnection, operation_timeout: Duration) -> Self {
        Self {
            conn,
            operation_timeout,
            release_script: redis::Script::new(RELEASE_IF_OWNER_SCRIPT),
        }
    }

    /// Bounds a round-trip by the operation timeout and records it.
    async fn run<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let timer = LatencyTimer::new();
        let result = match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::from(e)),
            Err(_) => Err(StoreError::Timeout(self.operation_timeout)),
        };
        get_metrics().record_store_operation(operation, timer.elapsed_ms(), result.is_ok());
        result
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.run("get", async { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let options = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl_secs(ttl) as usize));

        let result: Option<String> = self
            .run("set_nx", async {
                conn.set_options::<_, _, Option<String>>(key, value, options)
                    .await
            })
            .await?;

        Ok(result.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run("set_ex", async {
            conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .run("del", async { conn.del::<_, i64>(key).await })
            .await?;
        Ok(deleted > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .run("del_if_eq", async {
                self.release_script
                    .key(key)
                    .arg(expected)
                    .invoke_async::<_, i64>(&mut conn)
                    .await
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut conn = self.conn.clone();
        let secs: i64 = self
            .run("ttl", async {
                redis::cmd("TTL").arg(key).query_async::<_, i64>(&mut conn).await
            })
            .await?;

        Ok(match secs {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            n => KeyTtl::Expires(Duration::from_secs(n.max(0) as u64)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .run("expire", async {
                redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl_secs(ttl))
                    .query_async::<_, i64>(&mut conn)
                    .await
            })
            .await?;
        Ok(updated == 1)
    }

    async fn scan(&self, pattern: &str, limit: usize) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (new_cursor, page) = self.scan_page(pattern, cursor, SCAN_PAGE_SIZE).await?;

            for key in page {
                if keys.len() >= limit {
                    return Ok(keys);
                }
                keys.push(key);
            }

            cursor = new_cursor;
            if cursor == 0 || keys.len() >= limit {
                break;
            }
        }

        Ok(keys)
    }

    async fn scan_page(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<(u64, Vec<String>)> {
        let mut conn = self.conn.clone();
        self.run("scan", async {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count.max(1))
                .query_async::<_, (u64, Vec<String>)>(&mut conn)
                .await
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.run("ping", async {
            redis::cmd("PING").query_async::<_, ()>(&mut conn).await
        })
        .await
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Single-process store with lazily enforced TTLs.
///
/// Atomicity holds within one process only. Intended for tests and local
/// development; production deployments share a `RedisStore`.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Writes a key with no expiry, as a buggy or manual writer would.
    pub fn insert_without_expiry(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(36500));
        self.clock.now() + ttl
    }

    fn matching_keys(&self, pattern: &str) -> Vec<String> {
        self.with_entries(|entries, _| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect();
            keys.sort();
            keys
        })
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, MemoryEntry>, DateTime<Utc>) -> T) -> T {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries, now)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone())))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let expires_at = self.expiry(ttl);
        Ok(self.with_entries(|entries, _| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    expires_at: Some(expires_at),
                },
            );
            true
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let expires_at = self.expiry(ttl);
        self.with_entries(|entries, _| {
            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    expires_at: Some(expires_at),
                },
            );
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.with_entries(|entries, _| entries.remove(key).is_some()))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        Ok(self.with_entries(|entries, _| {
            let owned = entries.get(key).map_or(false, |e| e.value == expected);
            if owned {
                entries.remove(key);
            }
            owned
        }))
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        Ok(self.with_entries(|entries, now| match entries.get(key) {
            None => KeyTtl::Missing,
            Some(MemoryEntry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(MemoryEntry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires((*at - now).to_std().unwrap_or(Duration::ZERO)),
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let expires_at = self.expiry(ttl);
        Ok(self.with_entries(|entries, _| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(expires_at);
                true
            }
            None => false,
        }))
    }

    async fn scan(&self, pattern: &str, limit: usize) -> StoreResult<Vec<String>> {
        let mut keys = self.matching_keys(pattern);
        keys.truncate(limit);
        Ok(keys)
    }

    /// The cursor is an offset into the sorted matching keys.
    async fn scan_page(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<(u64, Vec<String>)> {
        let keys = self.matching_keys(pattern);
        let start = (cursor as usize).min(keys.len());
        let end = start.saturating_add(count.max(1)).min(keys.len());
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, keys[start..end].to_vec()))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Matches `candidate` against a pattern where `*` matches any run of characters.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !candidate.starts_with(first) || candidate.len() < first.len() + last.len() {
        return false;
    }
    if !candidate.ends_with(last) {
        return false;
    }

    let mut rest = &candidate[first.len()..candidate.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}
