//! Domain models for the clinic ledger.

mod audit;
mod invoice;
pub mod money;
mod payment;
mod refund;

pub use audit::{AuditAction, AuditEntityType, AuditEntry};
pub use invoice::{Invoice, InvoiceStatus, LineItem, NewInvoice};
pub use money::MinorUnits;
pub use payment::{Payment, PaymentConfirmation, PaymentMethod, PaymentRequest};
pub use refund::{Refund, RefundRequest};
