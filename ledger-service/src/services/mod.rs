//! Services module for the clinic ledger.

pub mod audit;
pub mod database;
pub mod invoices;
pub mod memory;
pub mod metrics;
pub mod payments;
pub mod reconciliation;
pub mod refunds;
pub mod retry;
pub mod store;

pub use audit::AuditLog;
pub use database::{Database, PgTransaction};
pub use invoices::InvoiceService;
pub use memory::{InMemoryLedgerStore, InMemoryTransaction};
pub use metrics::{
    get_metrics, init_metrics, CounterMetrics, MetricsSink, MetricsSnapshot, NoopMetrics,
    Outcome, PrometheusMetrics,
};
pub use payments::PaymentService;
pub use reconciliation::{
    AggregateField, Discrepancy, FieldMismatch, ReconciliationReport, Reconciler,
};
pub use refunds::RefundService;
pub use retry::{run_with_retry, RetryConfig};
pub use store::{LedgerSnapshot, LedgerStore, LedgerTransaction, PageRequest, Scope};
