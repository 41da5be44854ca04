use serde::Deserialize;
use std::time::Duration;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub redis: RedisSettings,
    pub kafka: KafkaSettings,
    pub idempotency: IdempotencySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

fn default_operation_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaSettings {
    pub enabled: bool,
    pub brokers: String,
    pub alert_topic: String,
}

impl KafkaSettings {
    pub fn broker_list(&self) -> Vec<String> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Tunables for the idempotency layer.
///
/// The lock TTL must not exceed the ledger TTL, otherwise a ledger record could
/// expire while its lock is still held. `max_delay_ms` must cover the last
/// backoff step so the cap never shortens the `base * 2^(k-1)` schedule.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_idempotency_settings", skip_on_field_errors = false))]
pub struct IdempotencySettings {
    #[validate(length(min = 1))]
    pub key_prefix: String,
    #[validate(range(min = 1))]
    pub ledger_ttl_secs: u64,
    #[validate(range(min = 1))]
    pub lock_ttl_secs: u64,
    pub max_retries: u32,
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,
    /// Lets a new caller claim a key whose record is FAILED before the ledger TTL runs out.
    #[serde(default)]
    pub retry_failed: bool,
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
    #[validate(range(min = 1))]
    pub sweep_batch_size: usize,
    #[validate(range(min = 1))]
    pub stats_sample_size: usize,
}

fn validate_idempotency_settings(settings: &IdempotencySettings) -> Result<(), ValidationError> {
    validate_ttl_ordering(settings)?;
    validate_backoff_cap(settings)
}

fn validate_ttl_ordering(settings: &IdempotencySettings) -> Result<(), ValidationError> {
    if settings.lock_ttl_secs > settings.ledger_ttl_secs {
        let mut err = ValidationError::new("lock_ttl_exceeds_ledger_ttl");
        err.message = Some("lock_ttl_secs must be <= ledger_ttl_secs".into());
        return Err(err);
    }
    Ok(())
}

fn validate_backoff_cap(settings: &IdempotencySettings) -> Result<(), ValidationError> {
    if settings.max_retries == 0 {
        return Ok(());
    }

    let last_delay_ms = 2u64
        .checked_pow(settings.max_retries - 1)
        .and_then(|factor| settings.base_delay_ms.checked_mul(factor));

    match last_delay_ms {
        Some(last) if last <= settings.max_delay_ms => Ok(()),
        _ => {
            let mut err = ValidationError::new("max_delay_below_backoff_schedule");
            err.message = Some("max_delay_ms must be >= base_delay_ms * 2^(max_retries - 1)".into());
            Err(err)
        }
    }
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            key_prefix: "idempotency".to_string(),
            ledger_ttl_secs: 86400, // 24 hours
            lock_ttl_secs: 30,
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            retry_failed: false,
            sweep_interval_secs: 3600,
            sweep_batch_size: 1000,
            stats_sample_size: 1000,
        }
    }
}

impl IdempotencySettings {
    pub fn ledger_ttl(&self) -> Duration {
        Duration::from_secs(self.ledger_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_idempotency_settings_are_valid() {
        let settings = IdempotencySettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.ledger_ttl(), Duration::from_secs(86400));
        assert_eq!(settings.lock_ttl(), Duration::from_secs(30));
        assert!(!settings.retry_failed);
    }

    #[test]
    fn test_lock_ttl_longer_than_ledger_ttl_is_rejected() {
        let settings = IdempotencySettings {
            ledger_ttl_secs: 10,
            lock_ttl_secs: 60,
            ..IdempotencySettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_retry_delay_is_rejected() {
        let settings = IdempotencySettings {
            base_delay_ms: 0,
            ..IdempotencySettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_max_delay_must_cover_backoff_schedule() {
        // 1000ms * 2^6 = 64s exceeds the 30s default cap.
        let too_many = IdempotencySettings {
            max_retries: 7,
            ..IdempotencySettings::default()
        };
        assert!(too_many.validate().is_err());

        let covered = IdempotencySettings {
            max_retries: 7,
            max_delay_ms: 64_000,
            ..IdempotencySettings::default()
        };
        assert!(covered.validate().is_ok());

        let no_retries = IdempotencySettings {
            max_retries: 0,
            ..IdempotencySettings::default()
        };
        assert!(no_retries.validate().is_ok());
    }

    #[test]
    fn test_broker_list() {
        let kafka = KafkaSettings {
            enabled: true,
            brokers: "kafka-1:9092, kafka-2:9092,".to_string(),
            alert_topic: "idempotency.failures".to_string(),
        };
        assert_eq!(kafka.broker_list(), vec!["kafka-1:9092", "kafka-2:9092"]);
    }
}
