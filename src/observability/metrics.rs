use metrics::{counter, gauge, histogram, describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency layer.
///
/// Recording is a no-op until a recorder is installed with [`init_metrics`].
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_request_outcome(&self, provider: &str, outcome: &str) {
        counter!("idempotency_requests_total", "provider" => provider.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_duplicate(&self, provider: &str, status: &str) {
        counter!("idempotency_duplicates_total", "provider" => provider.to_string(), "status" => status.to_string()).increment(1);
    }

    pub fn record_lock_contention(&self, provider: &str) {
        counter!("idempotency_lock_contention_total", "provider" => provider.to_string()).increment(1);
    }

    pub fn record_retry_exhausted(&self, provider: &str) {
        counter!("idempotency_retry_exhausted_total", "provider" => provider.to_string()).increment(1);
    }

    pub fn record_fail_open(&self, operation: &str) {
        counter!("idempotency_fail_open_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_reclaimed(&self, provider: &str) {
        counter!("idempotency_reclaimed_total", "provider" => provider.to_string()).increment(1);
    }

    pub fn record_sweep_repaired(&self, count: u64) {
        counter!("idempotency_sweep_repaired_total").increment(count);
    }

    pub fn record_operation_duration(&self, provider: &str, status: &str, duration_ms: f64) {
        histogram!("idempotency_operation_duration_ms", "provider" => provider.to_string(), "status" => status.to_string()).record(duration_ms);
    }

    pub fn set_ledger_records(&self, status: &str, count: u64) {
        gauge!("idempotency_ledger_records", "status" => status.to_string()).set(count as f64);
    }

    pub fn record_store_operation(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("store_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("store_operation_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Idempotent executions by provider and outcome");
    describe_counter!("idempotency_duplicates_total", Unit::Count, "Calls answered from an existing terminal record");
    describe_counter!("idempotency_lock_contention_total", Unit::Count, "Calls that found the key locked by another worker");
    describe_counter!("idempotency_retry_exhausted_total", Unit::Count, "Calls that gave up waiting for a PROCESSING key");
    describe_counter!("idempotency_fail_open_total", Unit::Count, "Ledger reads that fell open during store unavailability");
    describe_counter!("idempotency_reclaimed_total", Unit::Count, "Orphaned PROCESSING records re-claimed by a new worker");
    describe_counter!("idempotency_sweep_repaired_total", Unit::Count, "Ledger records given a TTL by the cleanup sweeper");
    describe_histogram!("idempotency_operation_duration_ms", Unit::Milliseconds, "Wrapped operation latency in milliseconds");
    describe_gauge!("idempotency_ledger_records", Unit::Count, "Sampled ledger records by status");

    describe_counter!("store_operations_total", Unit::Count, "Total store round-trips");
    describe_histogram!("store_operation_duration_ms", Unit::Milliseconds, "Store round-trip latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
