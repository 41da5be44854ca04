use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic identifier for one logical external event.
///
/// Rendered as `<provider>:<sha256 hex>`; the provider stays readable so the
/// ledger can be scanned per provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    provider: String,
    digest: String,
}

impl IdempotencyKey {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn as_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.digest)
    }
}

/// Attributes identifying an inbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyAttributes {
    pub provider: String,
    pub transaction_id: String,
    pub context: Option<String>,
}

impl IdempotencyAttributes {
    pub fn new(provider: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            transaction_id: transaction_id.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Generator for idempotency keys using SHA-256 hashing. Pure, no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyKeyGenerator;

impl IdempotencyKeyGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generates the key for (provider, id, context).
    ///
    /// The digest covers the provider as given (trimmed, lowercased); the
    /// sanitized provider is only the readable prefix, so providers that
    /// sanitize alike still get distinct keys.
    pub fn key(&self, provider: &str, transaction_id: &str, context: Option<&str>) -> IdempotencyKey {
        let raw_provider = provider.trim().to_lowercase();
        let context = context.map(|c| c.trim().to_lowercase());

        let mut hasher = Sha256::new();
        update_field(&mut hasher, "provider", &raw_provider);
        update_field(&mut hasher, "id", transaction_id);
        if let Some(ref ctx) = context {
            update_field(&mut hasher, "ctx", ctx);
        }

        IdempotencyKey {
            provider: normalize_provider(provider),
            digest: hex::encode(hasher.finalize()),
        }
    }

    /// Generates an idempotency key from the given attributes.
    pub fn generate(&self, attributes: &IdempotencyAttributes) -> IdempotencyKey {
        self.key(
            &attributes.provider,
            &attributes.transaction_id,
            attributes.context.as_deref(),
        )
    }
}

const LOCK_SUFFIX: &str = ":lock";

/// Store layout for the two key families of each idempotency key:
/// `<prefix>:<key>` holds the ledger record and `<prefix>:<key>:lock` the lock token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn record_key(&self, key: &IdempotencyKey) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub fn lock_key(&self, key: &IdempotencyKey) -> String {
        format!("{}:{}{}", self.prefix, key, LOCK_SUFFIX)
    }

    /// Scan pattern covering ledger and lock keys, optionally for one provider.
    pub fn scan_pattern(&self, provider: Option<&str>) -> String {
        match provider {
            Some(p) => format!("{}:{}:*", self.prefix, normalize_provider(p)),
            None => format!("{}:*", self.prefix),
        }
    }

    pub fn is_lock_key(&self, store_key: &str) -> bool {
        store_key.starts_with(&self.prefix) && store_key.ends_with(LOCK_SUFFIX)
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new("idempotency")
    }
}

// Length-prefixed so that no combination of field values can alias another.
fn update_field(hasher: &mut Sha256, tag: &str, value: &str) {
    hasher.update(tag.as_bytes());
    hasher.update(b"|");
    hasher.update(value.len().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(value.as_bytes());
    hasher.update(b";");
}

/// Lowercases the provider and replaces characters that would clash with the
/// store's key separators or scan patterns.
pub fn normalize_provider(provider: &str) -> String {
    let normalized: String = provider
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}
