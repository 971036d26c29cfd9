//! Error types for the ledger engine.

use crate::models::InvoiceStatus;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger errors.
///
/// Variants fall into three groups: business-rule violations (never retried),
/// store contention (retried by [`crate::services::retry`]) and infrastructure
/// failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invoice {0} not found")]
    InvoiceNotFound(Uuid),

    #[error("Invoice {invoice_id} is {actual}, expected {expected}")]
    InvalidInvoiceStatus {
        invoice_id: Uuid,
        expected: InvoiceStatus,
        actual: InvoiceStatus,
    },

    #[error(
        "Refund of {requested} on invoice {invoice_id} would raise refunded total from {refunded_total} above cap {cap}"
    )]
    RefundExceedsCap {
        invoice_id: Uuid,
        refunded_total: i64,
        requested: i64,
        cap: i64,
    },

    #[error("Payment {payment_id} not found for invoice {invoice_id}")]
    PaymentNotFound { invoice_id: Uuid, payment_id: Uuid },

    #[error("Invalid amount for {field}: {amount}")]
    InvalidAmount { field: &'static str, amount: i64 },

    #[error("Amount overflow while computing {0}")]
    AmountOverflow(&'static str),

    #[error("Validation error: {0}")]
    Validation(String),

    /// A concurrent unit of work invalidated this one; nothing was written.
    #[error("Transaction aborted due to contention: {0}")]
    Contention(String),

    #[error("Payment with idempotency key '{key}' already exists for invoice {invoice_id}")]
    DuplicateIdempotencyKey { invoice_id: Uuid, key: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Store-level abort that is safe to retry.
    pub fn is_contention(&self) -> bool {
        matches!(self, LedgerError::Contention(_))
    }

    /// Business-rule violation; retrying cannot succeed.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            LedgerError::InvoiceNotFound(_)
                | LedgerError::InvalidInvoiceStatus { .. }
                | LedgerError::RefundExceedsCap { .. }
                | LedgerError::PaymentNotFound { .. }
                | LedgerError::InvalidAmount { .. }
                | LedgerError::AmountOverflow(_)
                | LedgerError::Validation(_)
        )
    }

    /// Low-cardinality label for metrics and logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            LedgerError::InvoiceNotFound(_) | LedgerError::PaymentNotFound { .. } => "not_found",
            LedgerError::InvalidInvoiceStatus { .. } => "invalid_status",
            LedgerError::RefundExceedsCap { .. } => "refund_cap",
            LedgerError::InvalidAmount { .. }
            | LedgerError::AmountOverflow(_)
            | LedgerError::Validation(_) => "validation_error",
            LedgerError::Contention(_) => "contention",
            LedgerError::DuplicateIdempotencyKey { .. } => "duplicate_idempotency_key",
            LedgerError::Database(_) => "db_error",
            LedgerError::Serialization(_) => "serialization_error",
            LedgerError::Storage(_) => "storage_error",
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvoiceNotFound(_) | LedgerError::PaymentNotFound { .. } => {
                AppError::NotFound(anyhow::Error::new(err))
            }
            LedgerError::Contention(_) | LedgerError::DuplicateIdempotencyKey { .. } => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            LedgerError::Database(_) | LedgerError::Storage(_) => {
                AppError::DatabaseError(anyhow::Error::new(err))
            }
            LedgerError::Serialization(_) => AppError::InternalError(anyhow::Error::new(err)),
            _ => AppError::BadRequest(anyhow::Error::new(err)),
        }
    }
}
