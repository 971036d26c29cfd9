//! Refunds against paid invoices.

use crate::error::{LedgerError, Result};
use crate::models::money;
use crate::models::{AuditAction, AuditEntityType, AuditEntry, InvoiceStatus, Refund, RefundRequest};
use crate::services::metrics::{MetricsSink, Outcome};
use crate::services::retry::{run_with_retry, RetryConfig};
use crate::services::store::{LedgerStore, LedgerTransaction};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct RefundService<S: LedgerStore> {
    store: Arc<S>,
    metrics: Arc<dyn MetricsSink>,
    retry: RetryConfig,
}

impl<S: LedgerStore> RefundService<S> {
    pub fn new(store: Arc<S>, metrics: Arc<dyn MetricsSink>, retry: RetryConfig) -> Self {
        Self {
            store,
            metrics,
            retry,
        }
    }

    /// Refund part of a payment on a `PAID` invoice.
    ///
    /// The invoice's refunded total may never exceed the smaller of its grand
    /// total and its applied paid total. Overpayments are not refundable here.
    #[instrument(
        skip(self, request),
        fields(
            org_id = %request.org_id,
            invoice_id = %request.invoice_id,
            payment_id = %request.payment_id,
            amount = request.amount
        )
    )]
    pub async fn create_refund(&self, request: &RefundRequest) -> Result<Uuid> {
        let started = Instant::now();
        let result = self.create_refund_inner(request).await;

        self.metrics.record_refund(Outcome::of(&result));
        self.metrics.record_latency("create_refund", started.elapsed());

        if let Err(e) = &result {
            warn!(error = %e, error_type = e.error_type(), "Refund failed");
        }
        result
    }

    async fn create_refund_inner(&self, request: &RefundRequest) -> Result<Uuid> {
        money::ensure_positive(request.amount, "amount")?;

        run_with_retry(&self.retry, "create_refund", self.metrics.as_ref(), move || {
            self.try_refund(request)
        })
        .await
    }

    async fn try_refund(&self, request: &RefundRequest) -> Result<Uuid> {
        let mut tx = self.store.begin().await?;

        let mut invoice = tx
            .lock_invoice(request.org_id, request.invoice_id)
            .await?
            .ok_or(LedgerError::InvoiceNotFound(request.invoice_id))?;

        if invoice.status != InvoiceStatus::Paid {
            return Err(LedgerError::InvalidInvoiceStatus {
                invoice_id: invoice.invoice_id,
                expected: InvoiceStatus::Paid,
                actual: invoice.status,
            });
        }

        let source = tx.get_payment(request.org_id, request.payment_id).await?;
        if !source.is_some_and(|p| p.invoice_id == request.invoice_id) {
            return Err(LedgerError::PaymentNotFound {
                invoice_id: request.invoice_id,
                payment_id: request.payment_id,
            });
        }

        let cap = invoice.grand_total.min(invoice.paid_total);
        let refunded_after = money::add(invoice.refunded_total, request.amount, "refunded_total")?;
        if refunded_after > cap {
            return Err(LedgerError::RefundExceedsCap {
                invoice_id: invoice.invoice_id,
                refunded_total: invoice.refunded_total,
                requested: request.amount,
                cap,
            });
        }

        let refund = Refund {
            refund_id: Uuid::new_v4(),
            org_id: request.org_id,
            invoice_id: request.invoice_id,
            payment_id: request.payment_id,
            amount: request.amount,
            reason: request.reason.clone(),
            created_by: request.created_by.clone(),
            created_at: Utc::now(),
        };
        invoice.refunded_total = refunded_after;

        tx.insert_refund(&refund).await?;
        tx.update_invoice(&invoice).await?;
        tx.append_audit(&AuditEntry::new(
            request.org_id,
            AuditEntityType::Refund,
            refund.refund_id,
            AuditAction::Create,
            request.created_by.as_str(),
            json!({
                "invoice_id": refund.invoice_id,
                "payment_id": refund.payment_id,
                "amount": refund.amount,
                "refunded_total": refunded_after,
                "reason": refund.reason,
            }),
        ))
        .await?;
        tx.commit().await?;

        info!(
            refund_id = %refund.refund_id,
            refunded_total = refunded_after,
            cap,
            "Refund created"
        );
        Ok(refund.refund_id)
    }
}
