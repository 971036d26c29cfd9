//! Payment model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::money::MinorUnits;

/// How the patient paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    PromptPay,
    EWallet,
    Insurance,
}

impl PaymentMethod {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Card => "card",
            Self::BankTransfer => "bank_transfer",
            Self::PromptPay => "prompt_pay",
            Self::EWallet => "e_wallet",
            Self::Insurance => "insurance",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable payment record.
///
/// `amount == applied_amount + overpayment_amount` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub idempotency_key: String,
    pub amount: MinorUnits,
    pub applied_amount: MinorUnits,
    pub overpayment_amount: MinorUnits,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub created_by: String,
    pub confirmed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn is_split_consistent(&self) -> bool {
        self.applied_amount.checked_add(self.overpayment_amount) == Some(self.amount)
    }
}

/// Caller's request to confirm a payment against an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub idempotency_key: String,
    pub amount: MinorUnits,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub created_by: String,
}

/// Outcome of a payment confirmation. `existing` is set when the idempotency
/// key had already been used and no write happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub payment_id: Uuid,
    pub existing: bool,
}
