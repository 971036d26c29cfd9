//! Invoice model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::money::MinorUnits;

/// Invoice status.
///
/// An invoice leaves `Pending` exactly once, on its first confirmed payment,
/// and never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Paid,
}

impl InvoiceStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            other => Err(format!("unknown invoice status '{}'", other)),
        }
    }
}

/// Billable line on an invoice. All amounts in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub treatment_id: Option<Uuid>,
    pub name: String,
    pub quantity: u32,
    pub unit_price: MinorUnits,
    pub discount: MinorUnits,
    pub line_total: MinorUnits,
}

/// Invoice document.
///
/// `paid_total`, `overpayment_total` and `refunded_total` are the
/// authoritative summary of the payment and refund rows for this invoice.
/// `version` is bumped by the store on every committed update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub org_id: Uuid,
    pub branch_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub currency: String,
    #[sqlx(json)]
    pub line_items: Vec<LineItem>,
    pub subtotal: MinorUnits,
    pub discount_total: MinorUnits,
    pub tax_total: MinorUnits,
    pub grand_total: MinorUnits,
    pub paid_total: MinorUnits,
    pub overpayment_total: MinorUnits,
    pub refunded_total: MinorUnits,
    pub status: InvoiceStatus,
    pub version: i64,
    pub created_by: String,
    pub confirmed_by: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Outstanding balance, clamped at zero.
    pub fn remaining_balance(&self) -> MinorUnits {
        super::money::clamp_non_negative(self.grand_total - self.paid_total)
    }

    /// Net revenue carried by this invoice.
    pub fn net_paid(&self) -> MinorUnits {
        self.paid_total - self.refunded_total
    }

    pub fn is_paid(&self) -> bool {
        self.status == InvoiceStatus::Paid
    }
}

/// Input for creating an invoice. Totals are computed by the caller and
/// trusted as given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub org_id: Uuid,
    pub branch_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub subtotal: MinorUnits,
    pub discount_total: MinorUnits,
    pub tax_total: MinorUnits,
    pub grand_total: MinorUnits,
    pub created_by: String,
}
