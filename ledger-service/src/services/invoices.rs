//! Invoice creation and read helpers.

use crate::error::{LedgerError, Result};
use crate::models::money;
use crate::models::{
    AuditAction, AuditEntityType, AuditEntry, Invoice, InvoiceStatus, NewInvoice, Payment, Refund,
};
use crate::services::metrics::MetricsSink;
use crate::services::retry::{run_with_retry, RetryConfig};
use crate::services::store::{LedgerStore, LedgerTransaction};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct InvoiceService<S: LedgerStore> {
    store: Arc<S>,
    metrics: Arc<dyn MetricsSink>,
    retry: RetryConfig,
}

impl<S: LedgerStore> InvoiceService<S> {
    pub fn new(store: Arc<S>, metrics: Arc<dyn MetricsSink>, retry: RetryConfig) -> Self {
        Self {
            store,
            metrics,
            retry,
        }
    }

    /// Create a `PENDING` invoice from caller-computed content.
    ///
    /// Totals are trusted as given; only their sign is checked.
    #[instrument(skip(self, new_invoice), fields(org_id = %new_invoice.org_id))]
    pub async fn create_invoice(&self, new_invoice: NewInvoice) -> Result<Invoice> {
        validate_new_invoice(&new_invoice)?;

        let now = Utc::now();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            org_id: new_invoice.org_id,
            branch_id: new_invoice.branch_id,
            booking_id: new_invoice.booking_id,
            customer_id: new_invoice.customer_id,
            currency: new_invoice.currency.to_uppercase(),
            line_items: new_invoice.line_items,
            subtotal: new_invoice.subtotal,
            discount_total: new_invoice.discount_total,
            tax_total: new_invoice.tax_total,
            grand_total: new_invoice.grand_total,
            paid_total: 0,
            overpayment_total: 0,
            refunded_total: 0,
            status: InvoiceStatus::Pending,
            version: 0,
            created_by: new_invoice.created_by,
            confirmed_by: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };

        let started = Instant::now();
        let invoice_ref = &invoice;
        run_with_retry(&self.retry, "create_invoice", self.metrics.as_ref(), move || {
            self.try_create(invoice_ref)
        })
        .await?;
        self.metrics.record_latency("create_invoice", started.elapsed());

        info!(
            invoice_id = %invoice.invoice_id,
            grand_total = invoice.grand_total,
            currency = %invoice.currency,
            "Invoice created"
        );
        Ok(invoice)
    }

    async fn try_create(&self, invoice: &Invoice) -> Result<()> {
        let mut tx = self.store.begin().await?;
        tx.insert_invoice(invoice).await?;
        tx.append_audit(&AuditEntry::new(
            invoice.org_id,
            AuditEntityType::Invoice,
            invoice.invoice_id,
            AuditAction::Create,
            invoice.created_by.as_str(),
            json!({
                "invoice_id": invoice.invoice_id,
                "currency": invoice.currency,
                "line_item_count": invoice.line_items.len(),
                "subtotal": invoice.subtotal,
                "discount_total": invoice.discount_total,
                "tax_total": invoice.tax_total,
                "grand_total": invoice.grand_total,
            }),
        ))
        .await?;
        tx.commit().await
    }

    #[instrument(skip(self))]
    pub async fn get_invoice(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Invoice> {
        self.store
            .get_invoice(org_id, invoice_id)
            .await?
            .ok_or(LedgerError::InvoiceNotFound(invoice_id))
    }

    /// Payments for an invoice, oldest first.
    #[instrument(skip(self))]
    pub async fn list_payments(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Vec<Payment>> {
        self.store.list_payments_for_invoice(org_id, invoice_id).await
    }

    /// Refunds for an invoice, oldest first.
    #[instrument(skip(self))]
    pub async fn list_refunds(&self, org_id: Uuid, invoice_id: Uuid) -> Result<Vec<Refund>> {
        self.store.list_refunds_for_invoice(org_id, invoice_id).await
    }
}

fn validate_new_invoice(invoice: &NewInvoice) -> Result<()> {
    if invoice.org_id.is_nil() {
        return Err(LedgerError::Validation("org_id is required".to_string()));
    }
    if invoice.created_by.trim().is_empty() {
        return Err(LedgerError::Validation("created_by is required".to_string()));
    }
    if invoice.currency.len() != 3 || !invoice.currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(LedgerError::Validation(format!(
            "currency must be a 3-letter ISO 4217 code, got '{}'",
            invoice.currency
        )));
    }

    money::ensure_non_negative(invoice.subtotal, "subtotal")?;
    money::ensure_non_negative(invoice.discount_total, "discount_total")?;
    money::ensure_non_negative(invoice.tax_total, "tax_total")?;
    money::ensure_non_negative(invoice.grand_total, "grand_total")?;

    for item in &invoice.line_items {
        if item.name.trim().is_empty() {
            return Err(LedgerError::Validation("line item name is required".to_string()));
        }
        money::ensure_non_negative(item.unit_price, "unit_price")?;
        money::ensure_non_negative(item.discount, "discount")?;
        money::ensure_non_negative(item.line_total, "line_total")?;
    }
    Ok(())
}
