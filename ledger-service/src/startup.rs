//! Application startup: wiring stores, metrics and services together.

use crate::config::{EngineConfig, LedgerConfig, ReconciliationJobConfig};
use crate::services::{
    AuditLog, Database, InMemoryLedgerStore, InvoiceService, LedgerStore, MetricsSink,
    PaymentService, PrometheusMetrics, ReconciliationReport, Reconciler, RefundService,
};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};

/// Every ledger service over one shared store and metrics sink.
pub struct LedgerEngine<S: LedgerStore> {
    store: Arc<S>,
    pub invoices: InvoiceService<S>,
    pub payments: PaymentService<S>,
    pub refunds: RefundService<S>,
    pub reconciler: Reconciler<S>,
    pub audit: AuditLog<S>,
}

impl<S: LedgerStore> LedgerEngine<S> {
    pub fn new(
        store: Arc<S>,
        metrics: Arc<dyn MetricsSink>,
        engine: &EngineConfig,
        reconciliation: &ReconciliationJobConfig,
    ) -> Self {
        let retry = engine.retry();
        Self {
            invoices: InvoiceService::new(store.clone(), metrics.clone(), retry.clone()),
            payments: PaymentService::new(store.clone(), metrics.clone(), retry.clone()),
            refunds: RefundService::new(store.clone(), metrics.clone(), retry),
            reconciler: Reconciler::new(store.clone(), metrics, reconciliation.page_size),
            audit: AuditLog::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl LedgerEngine<InMemoryLedgerStore> {
    /// Engine over a fresh in-memory store.
    pub fn in_memory(metrics: Arc<dyn MetricsSink>, engine: &EngineConfig) -> Self {
        let store = Arc::new(InMemoryLedgerStore::with_lock_timeout(engine.lock_timeout));
        Self::new(store, metrics, engine, &ReconciliationJobConfig::default())
    }
}

/// PostgreSQL-backed ledger used by the `ledger-reconcile` job.
pub struct Application {
    config: LedgerConfig,
    db: Arc<Database>,
    engine: LedgerEngine<Database>,
}

impl Application {
    /// Connect, migrate and wire the engine.
    #[instrument(skip(config), fields(service = %config.service_name))]
    pub async fn build(config: LedgerConfig) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
            config.engine.lock_timeout,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.health_check().await?;
        db.run_migrations().await?;

        let db = Arc::new(db);
        let metrics: Arc<dyn MetricsSink> = Arc::new(PrometheusMetrics::new());
        let engine = LedgerEngine::new(db.clone(), metrics, &config.engine, &config.reconciliation);

        info!(
            max_retries = config.engine.max_retries,
            lock_timeout_ms = config.engine.lock_timeout.as_millis() as u64,
            page_size = config.reconciliation.page_size,
            "Ledger engine ready"
        );

        Ok(Self { config, db, engine })
    }

    pub fn engine(&self) -> &LedgerEngine<Database> {
        &self.engine
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Reconcile the configured scope once.
    pub async fn run_reconciliation(&self) -> Result<ReconciliationReport, AppError> {
        let scope = self.config.reconciliation.scope();
        info!(scope = ?scope, "Starting reconciliation run");
        Ok(self.engine.reconciler.run(scope).await?)
    }
}
