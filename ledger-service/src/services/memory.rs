//! In-process ledger store.
//!
//! Used by tests and by embedders that do not need durability. Invoice locks
//! live in a `DashMap` of async mutexes that only holds entries for invoices
//! some unit of work is using; committed data sits behind a single `RwLock`
//! so a commit becomes visible to readers all at once.

use crate::error::{LedgerError, Result};
use crate::models::{AuditEntityType, AuditEntry, Invoice, Payment, Refund};
use crate::services::store::{LedgerSnapshot, LedgerStore, LedgerTransaction, PageRequest, Scope};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// How long a unit of work waits for an invoice held by another one.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    invoices: HashMap<Uuid, Invoice>,
    payments: HashMap<Uuid, Payment>,
    payment_keys: HashMap<(Uuid, String), Uuid>,
    refunds: HashMap<Uuid, Refund>,
    audit: Vec<AuditEntry>,
}

struct Shared {
    state: RwLock<State>,
    invoice_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    lock_timeout: Duration,
}

/// Ledger store kept entirely in memory.
#[derive(Clone)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
                invoice_locks: DashMap::new(),
                lock_timeout,
            }),
        }
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

fn page<T, F>(mut rows: Vec<T>, page: PageRequest, id: F) -> Vec<T>
where
    F: Fn(&T) -> Uuid,
{
    rows.sort_by_key(|row| id(row));
    rows.into_iter()
        .filter(|row| page.page_token.map_or(true, |token| id(row) > token))
        .take(page.limit())
        .collect()
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            guards: InvoiceGuards::new(Arc::clone(&self.shared)),
            new_invoices: Vec::new(),
            invoice_updates: HashMap::new(),
            payments: Vec::new(),
            refunds: Vec::new(),
            audit: Vec::new(),
        })
    }

    async fn get_invoice(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Option<Invoice>> {
        let state = self.shared.state.read().await;
        Ok(state
            .invoices
            .get(&invoice_id)
            .filter(|invoice| invoice.org_id == org_id)
            .cloned())
    }

    async fn find_payment_by_idempotency_key(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Payment>> {
        let state = self.shared.state.read().await;
        Ok(state
            .payment_keys
            .get(&(invoice_id, idempotency_key.to_string()))
            .and_then(|payment_id| state.payments.get(payment_id))
            .filter(|payment| payment.org_id == org_id)
            .cloned())
    }

    async fn list_payments_for_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>> {
        let state = self.shared.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.org_id == org_id && p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| (p.created_at, p.payment_id));
        Ok(payments)
    }

    async fn list_refunds_for_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Refund>> {
        let state = self.shared.state.read().await;
        let mut refunds: Vec<Refund> = state
            .refunds
            .values()
            .filter(|r| r.org_id == org_id && r.invoice_id == invoice_id)
            .cloned()
            .collect();
        refunds.sort_by_key(|r| (r.created_at, r.refund_id));
        Ok(refunds)
    }

    async fn list_invoices(&self, scope: Scope, request: PageRequest) -> Result<Vec<Invoice>> {
        let state = self.shared.state.read().await;
        let rows: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| scope.contains(i.org_id))
            .cloned()
            .collect();
        Ok(page(rows, request, |i: &Invoice| i.invoice_id))
    }

    async fn list_payments(&self, scope: Scope, request: PageRequest) -> Result<Vec<Payment>> {
        let state = self.shared.state.read().await;
        let rows: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| scope.contains(p.org_id))
            .cloned()
            .collect();
        Ok(page(rows, request, |p: &Payment| p.payment_id))
    }

    async fn list_refunds(&self, scope: Scope, request: PageRequest) -> Result<Vec<Refund>> {
        let state = self.shared.state.read().await;
        let rows: Vec<Refund> = state
            .refunds
            .values()
            .filter(|r| scope.contains(r.org_id))
            .cloned()
            .collect();
        Ok(page(rows, request, |r: &Refund| r.refund_id))
    }

    #[instrument(skip(self))]
    async fn snapshot(&self, scope: Scope, _page_size: i32) -> Result<LedgerSnapshot> {
        let state = self.shared.state.read().await;

        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| scope.contains(i.org_id))
            .cloned()
            .collect();
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| scope.contains(p.org_id))
            .cloned()
            .collect();
        let mut refunds: Vec<Refund> = state
            .refunds
            .values()
            .filter(|r| scope.contains(r.org_id))
            .cloned()
            .collect();
        drop(state);

        invoices.sort_by_key(|i| i.invoice_id);
        payments.sort_by_key(|p| p.payment_id);
        refunds.sort_by_key(|r| r.refund_id);

        debug!(
            invoices = invoices.len(),
            payments = payments.len(),
            refunds = refunds.len(),
            "Snapshot taken"
        );
        Ok(LedgerSnapshot {
            invoices,
            payments,
            refunds,
        })
    }

    async fn list_audit_entries(
        &self,
        org_id: Uuid,
        entity: Option<(AuditEntityType, Uuid)>,
    ) -> Result<Vec<AuditEntry>> {
        let state = self.shared.state.read().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.org_id == org_id)
            .filter(|e| {
                entity.map_or(true, |(entity_type, entity_id)| {
                    e.entity_type == entity_type && e.entity_id == entity_id
                })
            })
            .cloned()
            .collect())
    }
}

/// Invoice locks held by one unit of work. Releasing a lock nobody else is
/// waiting on also removes its entry from the lock table.
struct InvoiceGuards {
    shared: Arc<Shared>,
    held: HashMap<Uuid, OwnedMutexGuard<()>>,
}

impl InvoiceGuards {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            held: HashMap::new(),
        }
    }

    fn holds(&self, invoice_id: &Uuid) -> bool {
        self.held.contains_key(invoice_id)
    }

    fn insert(&mut self, invoice_id: Uuid, guard: OwnedMutexGuard<()>) {
        self.held.insert(invoice_id, guard);
    }

    fn release(&mut self, invoice_id: Uuid) {
        if let Some(guard) = self.held.remove(&invoice_id) {
            drop(guard);
            self.prune(invoice_id);
        }
    }

    /// Drop the table entry when the table itself is the only owner left.
    fn prune(&self, invoice_id: Uuid) {
        self.shared
            .invoice_locks
            .remove_if(&invoice_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl Drop for InvoiceGuards {
    fn drop(&mut self) {
        let released: Vec<Uuid> = self.held.keys().copied().collect();
        self.held.clear();
        for invoice_id in released {
            self.prune(invoice_id);
        }
    }
}

/// Unit of work against [`InMemoryLedgerStore`]. Holds its invoice locks
/// until commit or drop.
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    guards: InvoiceGuards,
    new_invoices: Vec<Invoice>,
    invoice_updates: HashMap<Uuid, Invoice>,
    payments: Vec<Payment>,
    refunds: Vec<Refund>,
    audit: Vec<AuditEntry>,
}

impl InMemoryTransaction {
    fn staged_payment(&self, org_id: Uuid, predicate: impl Fn(&Payment) -> bool) -> Option<Payment> {
        self.payments
            .iter()
            .find(|p| p.org_id == org_id && predicate(p))
            .cloned()
    }
}

#[async_trait]
impl LedgerTransaction for InMemoryTransaction {
    #[instrument(skip(self), fields(org_id = %org_id, invoice_id = %invoice_id))]
    async fn lock_invoice(&mut self, org_id: Uuid, invoice_id: Uuid) -> Result<Option<Invoice>> {
        if !self.guards.holds(&invoice_id) {
            let lock = self
                .shared
                .invoice_locks
                .entry(invoice_id)
                .or_default()
                .clone();

            let guard = match tokio::time::timeout(self.shared.lock_timeout, lock.lock_owned())
                .await
            {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(
                        timeout_ms = self.shared.lock_timeout.as_millis() as u64,
                        "Timed out waiting for invoice lock"
                    );
                    self.guards.prune(invoice_id);
                    return Err(LedgerError::Contention(format!(
                        "invoice {} is locked",
                        invoice_id
                    )));
                }
            };
            self.guards.insert(invoice_id, guard);
        }

        if let Some(staged) = self.invoice_updates.get(&invoice_id) {
            return Ok(Some(staged.clone()).filter(|i| i.org_id == org_id));
        }

        let state = self.shared.state.read().await;
        let invoice = state
            .invoices
            .get(&invoice_id)
            .filter(|invoice| invoice.org_id == org_id)
            .cloned();
        drop(state);

        if invoice.is_none() {
            self.guards.release(invoice_id);
        }
        Ok(invoice)
    }

    async fn find_payment_by_idempotency_key(
        &mut self,
        org_id: Uuid,
        invoice_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Payment>> {
        if let Some(staged) = self.staged_payment(org_id, |p| {
            p.invoice_id == invoice_id && p.idempotency_key == idempotency_key
        }) {
            return Ok(Some(staged));
        }

        let state = self.shared.state.read().await;
        Ok(state
            .payment_keys
            .get(&(invoice_id, idempotency_key.to_string()))
            .and_then(|payment_id| state.payments.get(payment_id))
            .filter(|payment| payment.org_id == org_id)
            .cloned())
    }

    async fn get_payment(&mut self, org_id: Uuid, payment_id: Uuid) -> Result<Option<Payment>> {
        if let Some(staged) = self.staged_payment(org_id, |p| p.payment_id == payment_id) {
            return Ok(Some(staged));
        }

        let state = self.shared.state.read().await;
        Ok(state
            .payments
            .get(&payment_id)
            .filter(|payment| payment.org_id == org_id)
            .cloned())
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<()> {
        self.new_invoices.push(invoice.clone());
        Ok(())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<()> {
        let clash = self.payments.iter().any(|p| {
            p.invoice_id == payment.invoice_id && p.idempotency_key == payment.idempotency_key
        });
        if clash {
            return Err(LedgerError::DuplicateIdempotencyKey {
                invoice_id: payment.invoice_id,
                key: payment.idempotency_key.clone(),
            });
        }
        self.payments.push(payment.clone());
        Ok(())
    }

    async fn insert_refund(&mut self, refund: &Refund) -> Result<()> {
        self.refunds.push(refund.clone());
        Ok(())
    }

    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<()> {
        // Keep the version of the first staged read so the CAS checks what
        // this unit of work actually saw.
        let expected_version = self
            .invoice_updates
            .get(&invoice.invoice_id)
            .map_or(invoice.version, |staged| staged.version);
        let mut staged = invoice.clone();
        staged.version = expected_version;
        self.invoice_updates.insert(invoice.invoice_id, staged);
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        self.audit.push(entry.clone());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn commit(self) -> Result<()> {
        let mut state = self.shared.state.write().await;

        // Validate everything before touching state so a failed commit
        // leaves no partial writes.
        for invoice in &self.new_invoices {
            if state.invoices.contains_key(&invoice.invoice_id) {
                return Err(LedgerError::Storage(format!(
                    "invoice {} already exists",
                    invoice.invoice_id
                )));
            }
        }

        for update in self.invoice_updates.values() {
            match state.invoices.get(&update.invoice_id) {
                Some(current) if current.version == update.version => {}
                Some(current) => {
                    warn!(
                        invoice_id = %update.invoice_id,
                        expected_version = update.version,
                        actual_version = current.version,
                        "Invoice changed since it was read"
                    );
                    return Err(LedgerError::Contention(format!(
                        "invoice {} was modified concurrently",
                        update.invoice_id
                    )));
                }
                None => return Err(LedgerError::InvoiceNotFound(update.invoice_id)),
            }
        }

        for payment in &self.payments {
            let key = (payment.invoice_id, payment.idempotency_key.clone());
            if state.payment_keys.contains_key(&key) {
                return Err(LedgerError::DuplicateIdempotencyKey {
                    invoice_id: payment.invoice_id,
                    key: payment.idempotency_key.clone(),
                });
            }
        }

        let now = Utc::now();
        for invoice in self.new_invoices {
            state.invoices.insert(invoice.invoice_id, invoice);
        }
        for (invoice_id, mut invoice) in self.invoice_updates {
            invoice.version += 1;
            invoice.updated_at = now;
            state.invoices.insert(invoice_id, invoice);
        }
        for payment in self.payments {
            state.payment_keys.insert(
                (payment.invoice_id, payment.idempotency_key.clone()),
                payment.payment_id,
            );
            state.payments.insert(payment.payment_id, payment);
        }
        for refund in self.refunds {
            state.refunds.insert(refund.refund_id, refund);
        }
        state.audit.extend(self.audit);
        drop(state);

        debug!("In-memory transaction committed");
        Ok(())
    }
}
