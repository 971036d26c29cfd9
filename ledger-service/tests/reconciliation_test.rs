//! Reconciliation integration tests.

mod common;

use async_trait::async_trait;
use clinic_ledger::config::{EngineConfig, ReconciliationJobConfig};
use clinic_ledger::models::{AuditEntityType, AuditEntry, Invoice, Payment, Refund};
use clinic_ledger::services::{
    AggregateField, Discrepancy, FieldMismatch, InMemoryLedgerStore, LedgerSnapshot, LedgerStore,
    LedgerTransaction, NoopMetrics, PageRequest, PaymentService, Reconciler, RetryConfig, Scope,
};
use clinic_ledger::Result;
use common::{payment_request, refund_request, spawn_ledger, spawn_ledger_with, TestLedger};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Mixed payments, overpayments and refunds across several invoices.
async fn seed_activity(ledger: &TestLedger) {
    for (i, grand_total) in [10000_i64, 2550, 99999, 1].into_iter().enumerate() {
        let invoice = ledger.create_invoice(grand_total).await;
        let paid = grand_total + (i as i64) * 333;
        let confirmation = ledger
            .engine
            .payments
            .confirm_payment(
                ledger.org_id,
                invoice.invoice_id,
                &payment_request(&format!("seed-{}", i), paid),
                "cashier",
            )
            .await
            .unwrap();

        if grand_total > 1 {
            for amount in [grand_total / 3, grand_total / 5] {
                ledger
                    .engine
                    .refunds
                    .create_refund(&refund_request(&invoice, confirmation.payment_id, amount))
                    .await
                    .unwrap();
            }
        }
    }
    // Left unpaid.
    ledger.create_invoice(4200).await;
}

/// Aggregates built by the services always match their detail rows.
#[tokio::test]
async fn service_activity_reconciles_cleanly() {
    let ledger = spawn_ledger();
    seed_activity(&ledger).await;

    let report = ledger
        .engine
        .reconciler
        .run(Scope::Organization(ledger.org_id))
        .await
        .unwrap();

    assert!(report.passed(), "{:?}", report.discrepancies);
    assert_eq!(report.invoices_checked, 5);
    assert_eq!(report.payments_checked, 4);
    assert_eq!(report.refunds_checked, 6);
    assert_eq!(ledger.metrics.snapshot().latency["reconciliation"].samples, 1);
}

/// Revenue from invoice aggregates equals revenue from payment and refund rows.
#[tokio::test]
async fn revenue_identity_holds() {
    let ledger = spawn_ledger();
    seed_activity(&ledger).await;

    let invoices = ledger
        .engine
        .store()
        .list_invoices(Scope::Organization(ledger.org_id), Default::default())
        .await
        .unwrap();
    let expected: i64 = invoices
        .iter()
        .filter(|i| i.is_paid())
        .map(|i| i.paid_total - i.refunded_total)
        .sum();

    let report = ledger
        .engine
        .reconciler
        .run(Scope::Organization(ledger.org_id))
        .await
        .unwrap();
    assert_eq!(report.revenue_from_invoices, expected);
    assert_eq!(report.revenue_from_records, expected);
}

/// An aggregate written behind the services' back is reported with both
/// values and the field that drifted.
#[tokio::test]
async fn detects_tampered_aggregate() {
    let ledger = spawn_ledger();
    let (invoice, _) = ledger.create_paid_invoice(10000).await;

    let mut tx = ledger.engine.store().begin().await.unwrap();
    let mut tampered = tx
        .lock_invoice(invoice.org_id, invoice.invoice_id)
        .await
        .unwrap()
        .unwrap();
    tampered.paid_total += 1;
    tx.update_invoice(&tampered).await.unwrap();
    tx.commit().await.unwrap();

    let report = ledger
        .engine
        .reconciler
        .run(Scope::Organization(ledger.org_id))
        .await
        .unwrap();

    assert!(!report.passed());
    assert!(report.discrepancies.contains(&Discrepancy::InvoiceAggregate {
        invoice_id: invoice.invoice_id,
        org_id: invoice.org_id,
        mismatches: vec![FieldMismatch {
            field: AggregateField::PaidTotal,
            stored: 10001,
            recomputed: 10000,
        }],
    }));
    assert!(report.discrepancies.contains(&Discrepancy::Revenue {
        from_invoices: 10001,
        from_records: 10000,
        drift: 1,
    }));
}

/// Small pages still cover every record.
#[tokio::test]
async fn paginated_run_covers_everything() {
    let ledger = spawn_ledger_with(
        EngineConfig::default(),
        ReconciliationJobConfig {
            page_size: 2,
            org_id: None,
        },
    );
    for _ in 0..5 {
        ledger.create_paid_invoice(1234).await;
    }

    let report = ledger
        .engine
        .reconciler
        .run(Scope::Organization(ledger.org_id))
        .await
        .unwrap();
    assert!(report.passed());
    assert_eq!(report.invoices_checked, 5);
    assert_eq!(report.payments_checked, 5);
    assert_eq!(report.revenue_from_invoices, 5 * 1234);
}

/// An organization scope only sees its own records; the global scope sees all.
#[tokio::test]
async fn scope_limits_records() {
    let ledger = spawn_ledger();
    ledger.create_paid_invoice(5000).await;

    let other_org = Uuid::new_v4();
    let other = ledger
        .engine
        .invoices
        .create_invoice(common::new_invoice(other_org, 7000))
        .await
        .unwrap();
    ledger
        .engine
        .payments
        .confirm_payment(other_org, other.invoice_id, &payment_request("o", 7000), "cashier")
        .await
        .unwrap();

    let mine = ledger
        .engine
        .reconciler
        .run(Scope::Organization(ledger.org_id))
        .await
        .unwrap();
    assert_eq!(mine.invoices_checked, 1);
    assert_eq!(mine.revenue_from_invoices, 5000);

    let global = ledger.engine.reconciler.run(Scope::Global).await.unwrap();
    assert!(global.passed());
    assert_eq!(global.invoices_checked, 2);
    assert_eq!(global.revenue_from_records, 12000);
}

/// Reconciliation never writes.
#[tokio::test]
async fn run_is_read_only() {
    let ledger = spawn_ledger();
    let (invoice, _) = ledger.create_paid_invoice(10000).await;

    ledger.engine.reconciler.run(Scope::Global).await.unwrap();
    ledger.engine.reconciler.run(Scope::Global).await.unwrap();

    assert_eq!(ledger.reload(&invoice).await, invoice);
    assert_eq!(ledger.engine.audit.list(ledger.org_id).await.unwrap().len(), 2);
}

/// In-memory store that starts confirming a payment on `invoice` at the
/// moment a reconciliation run begins reading.
struct PaymentDuringRead {
    inner: Arc<InMemoryLedgerStore>,
    invoice: Mutex<Option<Invoice>>,
}

#[async_trait]
impl LedgerStore for PaymentDuringRead {
    type Tx = <InMemoryLedgerStore as LedgerStore>::Tx;

    async fn begin(&self) -> Result<Self::Tx> {
        self.inner.begin().await
    }

    async fn get_invoice(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Option<Invoice>> {
        self.inner.get_invoice(org_id, invoice_id).await
    }

    async fn find_payment_by_idempotency_key(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Payment>> {
        self.inner
            .find_payment_by_idempotency_key(org_id, invoice_id, idempotency_key)
            .await
    }

    async fn list_payments_for_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>> {
        self.inner.list_payments_for_invoice(org_id, invoice_id).await
    }

    async fn list_refunds_for_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Refund>> {
        self.inner.list_refunds_for_invoice(org_id, invoice_id).await
    }

    async fn list_invoices(&self, scope: Scope, page: PageRequest) -> Result<Vec<Invoice>> {
        self.inner.list_invoices(scope, page).await
    }

    async fn list_payments(&self, scope: Scope, page: PageRequest) -> Result<Vec<Payment>> {
        self.inner.list_payments(scope, page).await
    }

    async fn list_refunds(&self, scope: Scope, page: PageRequest) -> Result<Vec<Refund>> {
        self.inner.list_refunds(scope, page).await
    }

    async fn snapshot(&self, scope: Scope, page_size: i32) -> Result<LedgerSnapshot> {
        let pending = self.invoice.lock().unwrap().take();
        let writer = pending.map(|invoice| {
            let payments = PaymentService::new(
                Arc::clone(&self.inner),
                Arc::new(NoopMetrics),
                RetryConfig::default(),
            );
            tokio::spawn(async move {
                payments
                    .confirm_payment(
                        invoice.org_id,
                        invoice.invoice_id,
                        &payment_request("during-read", invoice.grand_total),
                        "cashier",
                    )
                    .await
            })
        });

        let snapshot = self.inner.snapshot(scope, page_size).await;
        if let Some(writer) = writer {
            writer.await.unwrap().unwrap();
        }
        snapshot
    }

    async fn list_audit_entries(
        &self,
        org_id: Uuid,
        entity: Option<(AuditEntityType, Uuid)>,
    ) -> Result<Vec<AuditEntry>> {
        self.inner.list_audit_entries(org_id, entity).await
    }
}

/// A payment committing while the run reads sees either all of its rows or
/// none, so the ledger still reconciles.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn payment_committed_during_read_does_not_report_drift() {
    let ledger = spawn_ledger();
    ledger.create_paid_invoice(2500).await;
    let pending = ledger.create_invoice(10000).await;

    let store = Arc::new(PaymentDuringRead {
        inner: Arc::clone(ledger.engine.store()),
        invoice: Mutex::new(Some(pending.clone())),
    });
    let reconciler = Reconciler::new(Arc::clone(&store), ledger.metrics.clone(), 1);

    let report = reconciler.run(Scope::Global).await.unwrap();
    assert!(report.passed(), "{:?}", report.discrepancies);
    assert_eq!(report.invoices_checked, 2);
    assert!(matches!(report.payments_checked, 1 | 2));

    let rerun = reconciler.run(Scope::Global).await.unwrap();
    assert!(rerun.passed(), "{:?}", rerun.discrepancies);
    assert_eq!(rerun.payments_checked, 2);
    assert_eq!(rerun.revenue_from_records, 12500);
    assert!(ledger.reload(&pending).await.is_paid());
}

/// Runs interleaved with many concurrent payments and refunds never report
/// drift.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_alongside_concurrent_writers_pass() {
    let ledger = spawn_ledger_with(
        EngineConfig::default(),
        ReconciliationJobConfig {
            page_size: 1,
            org_id: None,
        },
    );

    let mut invoices = Vec::new();
    for i in 0..20 {
        invoices.push(ledger.create_invoice(1000 + i).await);
    }

    let mut writers = Vec::new();
    for invoice in invoices {
        let engine = ledger.engine.clone();
        writers.push(tokio::spawn(async move {
            let confirmation = engine
                .payments
                .confirm_payment(
                    invoice.org_id,
                    invoice.invoice_id,
                    &payment_request("concurrent", invoice.grand_total + 50),
                    "cashier",
                )
                .await
                .unwrap();
            tokio::task::yield_now().await;
            engine
                .refunds
                .create_refund(&refund_request(&invoice, confirmation.payment_id, 300))
                .await
                .unwrap();
        }));
    }
    let writers = tokio::spawn(futures::future::join_all(writers));

    while !writers.is_finished() {
        let report = ledger
            .engine
            .reconciler
            .run(Scope::Organization(ledger.org_id))
            .await
            .unwrap();
        assert!(report.passed(), "{:?}", report.discrepancies);
        tokio::task::yield_now().await;
    }
    for result in writers.await.unwrap() {
        result.unwrap();
    }

    let report = ledger
        .engine
        .reconciler
        .run(Scope::Organization(ledger.org_id))
        .await
        .unwrap();
    assert!(report.passed(), "{:?}", report.discrepancies);
    assert_eq!(report.payments_checked, 20);
    assert_eq!(report.refunds_checked, 20);
}
