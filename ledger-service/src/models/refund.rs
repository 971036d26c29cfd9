//! Refund model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::money::MinorUnits;

/// Immutable refund record issued against a payment on a paid invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Refund {
    pub refund_id: Uuid,
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub payment_id: Uuid,
    pub amount: MinorUnits,
    pub reason: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a refund.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub payment_id: Uuid,
    pub amount: MinorUnits,
    pub reason: String,
    pub created_by: String,
}
