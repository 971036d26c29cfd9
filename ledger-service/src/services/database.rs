//! PostgreSQL ledger store.
//!
//! A unit of work is a database transaction. The invoice row is taken with
//! `SELECT ... FOR UPDATE` under a transaction-local `lock_timeout`, and every
//! invoice update is additionally guarded by its `version` column. Lock
//! timeouts, deadlocks and serialization failures surface as
//! [`LedgerError::Contention`].

use crate::error::{LedgerError, Result};
use crate::models::{AuditEntityType, AuditEntry, Invoice, Payment, Refund};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{LedgerSnapshot, LedgerStore, LedgerTransaction, PageRequest, Scope};
use async_trait::async_trait;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

const IDEMPOTENCY_KEY_CONSTRAINT: &str = "payments_invoice_idempotency_key";

macro_rules! invoice_columns {
    () => {
        "invoice_id, org_id, branch_id, booking_id, customer_id, currency, line_items, \
         subtotal, discount_total, tax_total, grand_total, paid_total, overpayment_total, \
         refunded_total, status, version, created_by, confirmed_by, paid_at, created_at, updated_at"
    };
}

macro_rules! payment_columns {
    () => {
        "payment_id, org_id, invoice_id, idempotency_key, amount, applied_amount, \
         overpayment_amount, method, reference, created_by, confirmed_by, created_at, updated_at"
    };
}

macro_rules! refund_columns {
    () => {
        "refund_id, org_id, invoice_id, payment_id, amount, reason, created_by, created_at"
    };
}

const INVOICE_PAGE: &str = concat!(
    "SELECT ",
    invoice_columns!(),
    r#"
    FROM invoices
    WHERE ($1::uuid IS NULL OR org_id = $1)
      AND ($2::uuid IS NULL OR invoice_id > $2)
    ORDER BY invoice_id
    LIMIT $3
    "#
);

const PAYMENT_PAGE: &str = concat!(
    "SELECT ",
    payment_columns!(),
    r#"
    FROM payments
    WHERE ($1::uuid IS NULL OR org_id = $1)
      AND ($2::uuid IS NULL OR payment_id > $2)
    ORDER BY payment_id
    LIMIT $3
    "#
);

const REFUND_PAGE: &str = concat!(
    "SELECT ",
    refund_columns!(),
    r#"
    FROM refunds
    WHERE ($1::uuid IS NULL OR org_id = $1)
      AND ($2::uuid IS NULL OR refund_id > $2)
    ORDER BY refund_id
    LIMIT $3
    "#
);

/// Run one keyset page query. `sql` binds `$1` org filter, `$2` page token
/// and `$3` limit.
async fn fetch_page<'e, T, E>(
    executor: E,
    sql: &'static str,
    scope: Scope,
    page: PageRequest,
) -> Result<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, T>(sql)
        .bind(scope.org_id())
        .bind(page.page_token)
        .bind(page.limit() as i64)
        .fetch_all(executor)
        .await
        .map_err(classify)
}

/// Page through a whole listing on one connection.
async fn fetch_all_pages<T>(
    conn: &mut PgConnection,
    sql: &'static str,
    scope: Scope,
    page_size: i32,
    id: fn(&T) -> Uuid,
) -> Result<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let mut rows = Vec::new();
    let mut page = PageRequest::first(page_size);
    loop {
        let batch: Vec<T> = fetch_page(&mut *conn, sql, scope, page).await?;
        let full_page = batch.len() >= page.limit();
        match batch.last() {
            Some(last) => page = page.after(id(last)),
            None => break,
        }
        rows.extend(batch);
        if !full_page {
            break;
        }
    }
    Ok(rows)
}

/// Map a driver error onto the ledger taxonomy by SQLSTATE.
fn classify(err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(code) = db_err.code() {
            if matches!(
                code.as_ref(),
                SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE
            ) {
                return LedgerError::Contention(format!("{} (SQLSTATE {})", db_err.message(), code));
            }
        }
    }
    LedgerError::Database(err)
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    lock_timeout: Duration,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "clinic-ledger"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        lock_timeout: Duration,
    ) -> std::result::Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            lock_timeout_ms = lock_timeout.as_millis() as u64,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool, lock_timeout })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> std::result::Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> std::result::Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for Database {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        // Transaction-local; reset automatically at commit or rollback.
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        Ok(PgTransaction { tx })
    }

    #[instrument(skip(self), fields(org_id = %org_id, invoice_id = %invoice_id))]
    async fn get_invoice(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Option<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(concat!(
            "SELECT ",
            invoice_columns!(),
            " FROM invoices WHERE org_id = $1 AND invoice_id = $2"
        ))
        .bind(org_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(org_id = %org_id, invoice_id = %invoice_id))]
    async fn find_payment_by_idempotency_key(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Payment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_payment_by_idempotency_key"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payments WHERE org_id = $1 AND invoice_id = $2 AND idempotency_key = $3"
        ))
        .bind(org_id)
        .bind(invoice_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self), fields(org_id = %org_id, invoice_id = %invoice_id))]
    async fn list_payments_for_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments_for_invoice"])
            .start_timer();

        let payments = sqlx::query_as::<_, Payment>(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payments WHERE org_id = $1 AND invoice_id = $2 ORDER BY created_at, payment_id"
        ))
        .bind(org_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        timer.observe_duration();
        Ok(payments)
    }

    #[instrument(skip(self), fields(org_id = %org_id, invoice_id = %invoice_id))]
    async fn list_refunds_for_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Refund>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_refunds_for_invoice"])
            .start_timer();

        let refunds = sqlx::query_as::<_, Refund>(concat!(
            "SELECT ",
            refund_columns!(),
            " FROM refunds WHERE org_id = $1 AND invoice_id = $2 ORDER BY created_at, refund_id"
        ))
        .bind(org_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        timer.observe_duration();
        Ok(refunds)
    }

    #[instrument(skip(self))]
    async fn list_invoices(&self, scope: Scope, page: PageRequest) -> Result<Vec<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let invoices: Vec<Invoice> = fetch_page(&self.pool, INVOICE_PAGE, scope, page).await?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn list_payments(&self, scope: Scope, page: PageRequest) -> Result<Vec<Payment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let payments: Vec<Payment> = fetch_page(&self.pool, PAYMENT_PAGE, scope, page).await?;

        timer.observe_duration();
        Ok(payments)
    }

    #[instrument(skip(self))]
    async fn list_refunds(&self, scope: Scope, page: PageRequest) -> Result<Vec<Refund>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_refunds"])
            .start_timer();

        let refunds: Vec<Refund> = fetch_page(&self.pool, REFUND_PAGE, scope, page).await?;

        timer.observe_duration();
        Ok(refunds)
    }

    #[instrument(skip(self))]
    async fn snapshot(&self, scope: Scope, page_size: i32) -> Result<LedgerSnapshot> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["snapshot"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        let invoices =
            fetch_all_pages(&mut tx, INVOICE_PAGE, scope, page_size, |i: &Invoice| i.invoice_id)
                .await?;
        let payments =
            fetch_all_pages(&mut tx, PAYMENT_PAGE, scope, page_size, |p: &Payment| p.payment_id)
                .await?;
        let refunds =
            fetch_all_pages(&mut tx, REFUND_PAGE, scope, page_size, |r: &Refund| r.refund_id)
                .await?;
        tx.commit().await.map_err(classify)?;

        timer.observe_duration();
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

    #[instrument(skip(self), fields(org_id = %org_id))]
    async fn list_audit_entries(
        &self,
        org_id: Uuid,
        entity: Option<(AuditEntityType, Uuid)>,
    ) -> Result<Vec<AuditEntry>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_audit_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT audit_id, org_id, entity_type, entity_id, action, actor_id, created_at, payload
            FROM audit_log
            WHERE org_id = $1
              AND ($2::varchar IS NULL OR entity_type = $2)
              AND ($3::uuid IS NULL OR entity_id = $3)
            ORDER BY seq
            "#,
        )
        .bind(org_id)
        .bind(entity.map(|(entity_type, _)| entity_type.as_str()))
        .bind(entity.map(|(_, entity_id)| entity_id))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        timer.observe_duration();
        Ok(entries)
    }
}

/// Unit of work backed by a PostgreSQL transaction. Dropping it rolls back.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTransaction for PgTransaction {
    #[instrument(skip(self), fields(org_id = %org_id, invoice_id = %invoice_id))]
    async fn lock_invoice(&mut self, org_id: Uuid, invoice_id: Uuid) -> Result<Option<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(concat!(
            "SELECT ",
            invoice_columns!(),
            " FROM invoices WHERE org_id = $1 AND invoice_id = $2 FOR UPDATE"
        ))
        .bind(org_id)
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)?;

        timer.observe_duration();
        Ok(invoice)
    }

    async fn find_payment_by_idempotency_key(
        &mut self,
        org_id: Uuid,
        invoice_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payments WHERE org_id = $1 AND invoice_id = $2 AND idempotency_key = $3"
        ))
        .bind(org_id)
        .bind(invoice_id)
        .bind(idempotency_key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)
    }

    async fn get_payment(&mut self, org_id: Uuid, payment_id: Uuid) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payments WHERE org_id = $1 AND payment_id = $2"
        ))
        .bind(org_id)
        .bind(payment_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        sqlx::query(concat!(
            "INSERT INTO invoices (",
            invoice_columns!(),
            r#")
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#
        ))
        .bind(invoice.invoice_id)
        .bind(invoice.org_id)
        .bind(invoice.branch_id)
        .bind(invoice.booking_id)
        .bind(invoice.customer_id)
        .bind(&invoice.currency)
        .bind(Json(&invoice.line_items))
        .bind(invoice.subtotal)
        .bind(invoice.discount_total)
        .bind(invoice.tax_total)
        .bind(invoice.grand_total)
        .bind(invoice.paid_total)
        .bind(invoice.overpayment_total)
        .bind(invoice.refunded_total)
        .bind(invoice.status.as_str())
        .bind(invoice.version)
        .bind(&invoice.created_by)
        .bind(&invoice.confirmed_by)
        .bind(invoice.paid_at)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.payment_id))]
    async fn insert_payment(&mut self, payment: &Payment) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let result = sqlx::query(concat!(
            "INSERT INTO payments (",
            payment_columns!(),
            r#")
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#
        ))
        .bind(payment.payment_id)
        .bind(payment.org_id)
        .bind(payment.invoice_id)
        .bind(&payment.idempotency_key)
        .bind(payment.amount)
        .bind(payment.applied_amount)
        .bind(payment.overpayment_amount)
        .bind(payment.method.as_str())
        .bind(&payment.reference)
        .bind(&payment.created_by)
        .bind(&payment.confirmed_by)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *self.tx)
        .await;

        timer.observe_duration();

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(ref db_err))
                if db_err.is_unique_violation()
                    && db_err.constraint() == Some(IDEMPOTENCY_KEY_CONSTRAINT) =>
            {
                warn!(
                    invoice_id = %payment.invoice_id,
                    idempotency_key = %payment.idempotency_key,
                    "Idempotency key already used"
                );
                Err(LedgerError::DuplicateIdempotencyKey {
                    invoice_id: payment.invoice_id,
                    key: payment.idempotency_key.clone(),
                })
            }
            Err(e) => Err(classify(e)),
        }
    }

    #[instrument(skip(self, refund), fields(refund_id = %refund.refund_id))]
    async fn insert_refund(&mut self, refund: &Refund) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_refund"])
            .start_timer();

        sqlx::query(concat!(
            "INSERT INTO refunds (",
            refund_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(refund.refund_id)
        .bind(refund.org_id)
        .bind(refund.invoice_id)
        .bind(refund.payment_id)
        .bind(refund.amount)
        .bind(&refund.reason)
        .bind(&refund.created_by)
        .bind(refund.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id, version = invoice.version))]
    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET paid_total = $3,
                overpayment_total = $4,
                refunded_total = $5,
                status = $6,
                confirmed_by = $7,
                paid_at = $8,
                version = version + 1,
                updated_at = NOW()
            WHERE org_id = $1 AND invoice_id = $2 AND version = $9
            "#,
        )
        .bind(invoice.org_id)
        .bind(invoice.invoice_id)
        .bind(invoice.paid_total)
        .bind(invoice.overpayment_total)
        .bind(invoice.refunded_total)
        .bind(invoice.status.as_str())
        .bind(&invoice.confirmed_by)
        .bind(invoice.paid_at)
        .bind(invoice.version)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            warn!("Invoice version changed since it was read");
            return Err(LedgerError::Contention(format!(
                "invoice {} was modified concurrently",
                invoice.invoice_id
            )));
        }
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (audit_id, org_id, entity_type, entity_id, action, actor_id, created_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.audit_id)
        .bind(entry.org_id)
        .bind(entry.entity_type.as_str())
        .bind(entry.entity_id)
        .bind(entry.action.as_str())
        .bind(&entry.actor_id)
        .bind(entry.created_at)
        .bind(&entry.payload)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(classify)?;
        debug!("PostgreSQL transaction committed");
        Ok(())
    }
}
