use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::idempotency::{
    IdempotencyKey, IdempotencyStatus, LedgerSnapshot, MetricsSnapshot, OperationRecord, SweepReport,
};

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub services: ServiceHealth,
}

/// Service health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub store: bool,
    pub kafka: bool,
}

/// Ledger record as exposed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResponse {
    pub key: String,
    pub status: IdempotencyStatus,
    pub provider: String,
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecordResponse {
    pub fn new(key: &IdempotencyKey, record: OperationRecord) -> Self {
        Self {
            key: key.to_string(),
            status: record.status,
            provider: record.provider,
            transaction_id: record.transaction_id,
            context: record.context,
            result: record.result,
            error: record.error,
            attempts: record.attempts,
            created_at: record.created_at,
            updated_at: record.updated_at,
            completed_at: record.completed_at,
        }
    }
}

/// Ledger sample plus in-process counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub ledger: LedgerSnapshot,
    pub process: MetricsSnapshot,
    pub duplicate_rate: f64,
}

impl StatsResponse {
    pub fn new(ledger: LedgerSnapshot, process: MetricsSnapshot) -> Self {
        let duplicate_rate = process.duplicate_rate();
        Self {
            ledger,
            process,
            duplicate_rate,
        }
    }
}

/// Result of an on-demand cleanup sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResponse {
    pub scanned: usize,
    pub repaired: usize,
    pub cycle_complete: bool,
    pub finished_at: DateTime<Utc>,
}

impl From<SweepReport> for SweepResponse {
    fn from(report: SweepReport) -> Self {
        Self {
            scanned: report.scanned,
            repaired: report.repaired,
            cycle_complete: report.cycle_complete,
            finished_at: Utc::now(),
        }
    }
}
