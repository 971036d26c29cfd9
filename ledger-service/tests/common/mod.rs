//! Common test utilities for clinic-ledger integration tests.
#![allow(dead_code)]

use clinic_ledger::config::{EngineConfig, ReconciliationJobConfig};
use clinic_ledger::models::{
    Invoice, LineItem, NewInvoice, PaymentMethod, PaymentRequest, RefundRequest,
};
use clinic_ledger::services::{CounterMetrics, Database, InMemoryLedgerStore, MetricsSink};
use clinic_ledger::LedgerEngine;
use std::sync::{Arc, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,clinic_ledger=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// An engine over a fresh in-memory store, with counters to inspect and a
/// unique organization to work in.
pub struct TestLedger {
    pub engine: Arc<LedgerEngine<InMemoryLedgerStore>>,
    pub metrics: Arc<CounterMetrics>,
    pub org_id: Uuid,
}

pub fn spawn_ledger() -> TestLedger {
    spawn_ledger_with(EngineConfig::default(), ReconciliationJobConfig::default())
}

pub fn spawn_ledger_with(
    engine: EngineConfig,
    reconciliation: ReconciliationJobConfig,
) -> TestLedger {
    init_tracing();

    let metrics = Arc::new(CounterMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let store = Arc::new(InMemoryLedgerStore::with_lock_timeout(engine.lock_timeout));

    TestLedger {
        engine: Arc::new(LedgerEngine::new(store, sink, &engine, &reconciliation)),
        metrics,
        org_id: Uuid::new_v4(),
    }
}

/// Ledger whose units of work give up on a held invoice after `lock_timeout`.
pub fn spawn_ledger_with_lock_timeout(lock_timeout: Duration) -> TestLedger {
    spawn_ledger_with(
        EngineConfig {
            lock_timeout,
            ..EngineConfig::default()
        },
        ReconciliationJobConfig::default(),
    )
}

/// Spawn a PostgreSQL-backed engine. Needs `TEST_DATABASE_URL`.
pub async fn spawn_pg_ledger() -> (Arc<LedgerEngine<Database>>, Arc<CounterMetrics>, Uuid) {
    init_tracing();

    let database_url =
        std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for postgres tests");

    let engine = EngineConfig::default();
    let db = Database::new(&database_url, 16, 1, engine.lock_timeout)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");

    let metrics = Arc::new(CounterMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let ledger = LedgerEngine::new(
        Arc::new(db),
        sink,
        &engine,
        &ReconciliationJobConfig::default(),
    );

    (Arc::new(ledger), metrics, Uuid::new_v4())
}

/// Single-line invoice content with the given grand total.
pub fn new_invoice(org_id: Uuid, grand_total: i64) -> NewInvoice {
    NewInvoice {
        org_id,
        branch_id: Some(Uuid::new_v4()),
        booking_id: Some(Uuid::new_v4()),
        customer_id: Some(Uuid::new_v4()),
        currency: "THB".to_string(),
        line_items: vec![LineItem {
            treatment_id: Some(Uuid::new_v4()),
            name: "Laser treatment".to_string(),
            quantity: 1,
            unit_price: grand_total,
            discount: 0,
            line_total: grand_total,
        }],
        subtotal: grand_total,
        discount_total: 0,
        tax_total: 0,
        grand_total,
        created_by: "front-desk".to_string(),
    }
}

pub fn payment_request(idempotency_key: &str, amount: i64) -> PaymentRequest {
    PaymentRequest {
        idempotency_key: idempotency_key.to_string(),
        amount,
        method: PaymentMethod::Card,
        reference: Some("terminal-7".to_string()),
        created_by: "front-desk".to_string(),
    }
}

pub fn refund_request(invoice: &Invoice, payment_id: Uuid, amount: i64) -> RefundRequest {
    RefundRequest {
        org_id: invoice.org_id,
        invoice_id: invoice.invoice_id,
        payment_id,
        amount,
        reason: "treatment cancelled".to_string(),
        created_by: "manager".to_string(),
    }
}

impl TestLedger {
    pub async fn create_invoice(&self, grand_total: i64) -> Invoice {
        self.engine
            .invoices
            .create_invoice(new_invoice(self.org_id, grand_total))
            .await
            .expect("Failed to create invoice")
    }

    /// Create an invoice and pay it in full. Returns the invoice as stored
    /// after payment and the payment id.
    pub async fn create_paid_invoice(&self, grand_total: i64) -> (Invoice, Uuid) {
        let invoice = self.create_invoice(grand_total).await;
        let confirmation = self
            .engine
            .payments
            .confirm_payment(
                self.org_id,
                invoice.invoice_id,
                &payment_request(&Uuid::new_v4().to_string(), grand_total),
                "cashier",
            )
            .await
            .expect("Failed to confirm payment");
        (self.reload(&invoice).await, confirmation.payment_id)
    }

    pub async fn reload(&self, invoice: &Invoice) -> Invoice {
        self.engine
            .invoices
            .get_invoice(invoice.org_id, invoice.invoice_id)
            .await
            .expect("Invoice should exist")
    }
}
