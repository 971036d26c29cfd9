//! Payment confirmation.

use crate::error::{LedgerError, Result};
use crate::models::money;
use crate::models::{
    AuditAction, AuditEntityType, AuditEntry, InvoiceStatus, Payment, PaymentConfirmation,
    PaymentRequest,
};
use crate::services::metrics::{MetricsSink, Outcome};
use crate::services::retry::{run_with_retry, RetryConfig};
use crate::services::store::{LedgerStore, LedgerTransaction};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Confirms payments against invoices, at most once per idempotency key.
pub struct PaymentService<S: LedgerStore> {
    store: Arc<S>,
    metrics: Arc<dyn MetricsSink>,
    retry: RetryConfig,
}

impl<S: LedgerStore> PaymentService<S> {
    pub fn new(store: Arc<S>, metrics: Arc<dyn MetricsSink>, retry: RetryConfig) -> Self {
        Self {
            store,
            metrics,
            retry,
        }
    }

    /// Record a payment on a `PENDING` invoice and mark it `PAID`.
    ///
    /// The requested amount is split into the part applied to the remaining
    /// balance and the overpayment. Replaying an idempotency key returns the
    /// original payment with `existing = true` and writes nothing.
    #[instrument(
        skip(self, request, confirmer_id),
        fields(org_id = %org_id, invoice_id = %invoice_id, idempotency_key = %request.idempotency_key)
    )]
    pub async fn confirm_payment(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        request: &PaymentRequest,
        confirmer_id: &str,
    ) -> Result<PaymentConfirmation> {
        let started = Instant::now();
        let result = self
            .confirm_payment_inner(org_id, invoice_id, request, confirmer_id)
            .await;

        self.metrics.record_payment(Outcome::of(&result));
        self.metrics
            .record_latency("confirm_payment", started.elapsed());

        if let Err(e) = &result {
            warn!(error = %e, error_type = e.error_type(), "Payment confirmation failed");
        }
        result
    }

    async fn confirm_payment_inner(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        request: &PaymentRequest,
        confirmer_id: &str,
    ) -> Result<PaymentConfirmation> {
        validate_request(request)?;

        // Fast path for replays; the authoritative check runs again under the
        // invoice lock.
        if let Some(existing) = self
            .store
            .find_payment_by_idempotency_key(org_id, invoice_id, &request.idempotency_key)
            .await?
        {
            info!(payment_id = %existing.payment_id, "Idempotent replay of payment confirmation");
            return Ok(PaymentConfirmation {
                payment_id: existing.payment_id,
                existing: true,
            });
        }

        let result = run_with_retry(
            &self.retry,
            "confirm_payment",
            self.metrics.as_ref(),
            move || self.try_confirm(org_id, invoice_id, request, confirmer_id),
        )
        .await;

        match result {
            Err(LedgerError::DuplicateIdempotencyKey { .. }) => {
                // A concurrent request with the same key committed first.
                let winner = self
                    .store
                    .find_payment_by_idempotency_key(org_id, invoice_id, &request.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::Storage(format!(
                            "payment for idempotency key '{}' vanished after conflict",
                            request.idempotency_key
                        ))
                    })?;
                info!(payment_id = %winner.payment_id, "Lost idempotency race, returning winner");
                Ok(PaymentConfirmation {
                    payment_id: winner.payment_id,
                    existing: true,
                })
            }
            other => other,
        }
    }

    /// One attempt: a single unit of work.
    async fn try_confirm(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        request: &PaymentRequest,
        confirmer_id: &str,
    ) -> Result<PaymentConfirmation> {
        let mut tx = self.store.begin().await?;

        let mut invoice = tx
            .lock_invoice(org_id, invoice_id)
            .await?
            .ok_or(LedgerError::InvoiceNotFound(invoice_id))?;

        if let Some(existing) = tx
            .find_payment_by_idempotency_key(org_id, invoice_id, &request.idempotency_key)
            .await?
        {
            return Ok(PaymentConfirmation {
                payment_id: existing.payment_id,
                existing: true,
            });
        }

        if invoice.status != InvoiceStatus::Pending {
            return Err(LedgerError::InvalidInvoiceStatus {
                invoice_id,
                expected: InvoiceStatus::Pending,
                actual: invoice.status,
            });
        }

        let applied = request.amount.min(invoice.remaining_balance());
        let overpayment = request.amount - applied;
        let now = Utc::now();

        let payment = Payment {
            payment_id: Uuid::new_v4(),
            org_id,
            invoice_id,
            idempotency_key: request.idempotency_key.clone(),
            amount: request.amount,
            applied_amount: applied,
            overpayment_amount: overpayment,
            method: request.method,
            reference: request.reference.clone(),
            created_by: request.created_by.clone(),
            confirmed_by: Some(confirmer_id.to_string()),
            created_at: now,
            updated_at: now,
        };

        invoice.paid_total = money::add(invoice.paid_total, applied, "paid_total")?;
        invoice.overpayment_total =
            money::add(invoice.overpayment_total, overpayment, "overpayment_total")?;
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(now);
        invoice.confirmed_by = Some(confirmer_id.to_string());

        tx.insert_payment(&payment).await?;
        tx.update_invoice(&invoice).await?;
        tx.append_audit(&AuditEntry::new(
            org_id,
            AuditEntityType::Payment,
            payment.payment_id,
            AuditAction::ConfirmPayment,
            confirmer_id,
            json!({
                "invoice_id": invoice_id,
                "payment_id": payment.payment_id,
                "amount": payment.amount,
                "applied_amount": applied,
                "overpayment_amount": overpayment,
                "method": payment.method,
            }),
        ))
        .await?;
        tx.commit().await?;

        info!(
            payment_id = %payment.payment_id,
            amount = payment.amount,
            applied_amount = applied,
            overpayment_amount = overpayment,
            paid_total = invoice.paid_total,
            "Payment confirmed"
        );

        Ok(PaymentConfirmation {
            payment_id: payment.payment_id,
            existing: false,
        })
    }
}

fn validate_request(request: &PaymentRequest) -> Result<()> {
    money::ensure_positive(request.amount, "amount")?;

    let key = request.idempotency_key.trim();
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(LedgerError::Validation(format!(
            "idempotency_key must be between 1 and {} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    Ok(())
}
