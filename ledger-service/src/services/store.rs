//! Ledger store abstraction.
//!
//! A unit of work is a [`LedgerTransaction`]: the invoice it touches is read
//! with [`LedgerTransaction::lock_invoice`], writes are staged on the
//! transaction and become visible together on [`LedgerTransaction::commit`].
//! Dropping a transaction without committing discards everything it staged.
//! When a concurrent unit of work wins the invoice, the loser fails with
//! [`LedgerError::Contention`](crate::error::LedgerError::Contention) and has
//! written nothing.

use crate::error::Result;
use crate::models::{AuditEntityType, AuditEntry, Invoice, Payment, Refund};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default page size for listing queries.
pub const DEFAULT_PAGE_SIZE: i32 = 100;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: i32 = 1000;

/// Which records a listing or reconciliation run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "org_id")]
pub enum Scope {
    Organization(Uuid),
    Global,
}

impl Scope {
    pub fn org_id(&self) -> Option<Uuid> {
        match self {
            Scope::Organization(org_id) => Some(*org_id),
            Scope::Global => None,
        }
    }

    pub fn contains(&self, org_id: Uuid) -> bool {
        match self {
            Scope::Organization(scoped) => *scoped == org_id,
            Scope::Global => true,
        }
    }
}

/// Keyset pagination: records are ordered by id and `page_token` is the last
/// id of the previous page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

impl PageRequest {
    pub fn first(page_size: i32) -> Self {
        Self {
            page_size,
            page_token: None,
        }
    }

    pub fn after(self, page_token: Uuid) -> Self {
        Self {
            page_token: Some(page_token),
            ..self
        }
    }

    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn limit(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_SIZE) as usize
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(DEFAULT_PAGE_SIZE)
    }
}

/// Invoices, payments and refunds in one scope, read at a single point in
/// time. Each list is ordered by id.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub invoices: Vec<Invoice>,
    pub payments: Vec<Payment>,
    pub refunds: Vec<Refund>,
}

/// Persistence for invoices, payments, refunds and the audit log.
///
/// Reads on the store itself see committed state only and never take part
/// in a unit of work.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Tx: LedgerTransaction;

    /// Start a unit of work.
    async fn begin(&self) -> Result<Self::Tx>;

    async fn get_invoice(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Option<Invoice>>;

    async fn find_payment_by_idempotency_key(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Payment>>;

    /// Payments for one invoice, oldest first.
    async fn list_payments_for_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>>;

    /// Refunds for one invoice, oldest first.
    async fn list_refunds_for_invoice(&self, org_id: Uuid, invoice_id: Uuid)
        -> Result<Vec<Refund>>;

    async fn list_invoices(&self, scope: Scope, page: PageRequest) -> Result<Vec<Invoice>>;

    async fn list_payments(&self, scope: Scope, page: PageRequest) -> Result<Vec<Payment>>;

    async fn list_refunds(&self, scope: Scope, page: PageRequest) -> Result<Vec<Refund>>;

    /// Every invoice, payment and refund in `scope` as one consistent read:
    /// a unit of work that commits meanwhile is either fully visible or not
    /// at all. Backends that page internally fetch `page_size` rows at a time.
    async fn snapshot(&self, scope: Scope, page_size: i32) -> Result<LedgerSnapshot>;

    /// Audit entries for an organization, oldest first, optionally narrowed
    /// to one entity.
    async fn list_audit_entries(
        &self,
        org_id: Uuid,
        entity: Option<(AuditEntityType, Uuid)>,
    ) -> Result<Vec<AuditEntry>>;
}

/// A single atomic unit of work against the store.
#[async_trait]
pub trait LedgerTransaction: Send + Sized {
    /// Read an invoice for update. Waits while another unit of work holds it
    /// and aborts with `Contention` if the wait exceeds the store's lock
    /// timeout.
    async fn lock_invoice(&mut self, org_id: Uuid, invoice_id: Uuid) -> Result<Option<Invoice>>;

    async fn find_payment_by_idempotency_key(
        &mut self,
        org_id: Uuid,
        invoice_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Payment>>;

    async fn get_payment(&mut self, org_id: Uuid, payment_id: Uuid) -> Result<Option<Payment>>;

    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<()>;

    /// Stage a new payment. `(invoice_id, idempotency_key)` is unique; a
    /// clash surfaces as `DuplicateIdempotencyKey` no later than commit.
    async fn insert_payment(&mut self, payment: &Payment) -> Result<()>;

    async fn insert_refund(&mut self, refund: &Refund) -> Result<()>;

    /// Stage an invoice update. The write only lands if the stored version
    /// still equals `invoice.version`; the store then bumps it.
    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<()>;

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<()>;

    async fn commit(self) -> Result<()>;
}
