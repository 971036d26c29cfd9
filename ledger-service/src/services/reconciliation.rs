//! Aggregate cross-check.
//!
//! Recomputes every invoice aggregate from its payment and refund rows and
//! compares two independent revenue figures. Read-only: a run never writes.

use crate::error::{LedgerError, Result};
use crate::models::money;
use crate::models::{Invoice, InvoiceStatus, MinorUnits, Payment, Refund};
use crate::services::metrics::MetricsSink;
use crate::services::store::{LedgerSnapshot, LedgerStore, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Invoice aggregate fields that are derivable from detail rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateField {
    PaidTotal,
    OverpaymentTotal,
    RefundedTotal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMismatch {
    pub field: AggregateField,
    pub stored: MinorUnits,
    pub recomputed: MinorUnits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// Stored invoice aggregates differ from the sums of its detail rows.
    InvoiceAggregate {
        invoice_id: Uuid,
        org_id: Uuid,
        mismatches: Vec<FieldMismatch>,
    },
    /// Revenue from invoice aggregates differs from revenue from detail rows.
    Revenue {
        from_invoices: MinorUnits,
        from_records: MinorUnits,
        drift: MinorUnits,
    },
    /// `amount != applied_amount + overpayment_amount`.
    PaymentSplit {
        payment_id: Uuid,
        invoice_id: Uuid,
        amount: MinorUnits,
        applied_amount: MinorUnits,
        overpayment_amount: MinorUnits,
    },
    RefundExceedsPaid {
        invoice_id: Uuid,
        paid_total: MinorUnits,
        refunded_total: MinorUnits,
    },
    /// A `PENDING` invoice that already carries payments.
    StatusMismatch {
        invoice_id: Uuid,
        status: InvoiceStatus,
        payment_count: usize,
    },
    OrphanPayment {
        payment_id: Uuid,
        invoice_id: Uuid,
    },
    OrphanRefund {
        refund_id: Uuid,
        invoice_id: Uuid,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub scope: Scope,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub invoices_checked: usize,
    pub payments_checked: usize,
    pub refunds_checked: usize,
    pub revenue_from_invoices: MinorUnits,
    pub revenue_from_records: MinorUnits,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    /// Pass iff no discrepancy was found.
    pub fn passed(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

#[derive(Debug, Default)]
struct Tally {
    applied: MinorUnits,
    overpayment: MinorUnits,
    refunded: MinorUnits,
    payment_count: usize,
}

pub struct Reconciler<S: LedgerStore> {
    store: Arc<S>,
    metrics: Arc<dyn MetricsSink>,
    page_size: i32,
}

impl<S: LedgerStore> Reconciler<S> {
    pub fn new(store: Arc<S>, metrics: Arc<dyn MetricsSink>, page_size: i32) -> Self {
        Self {
            store,
            metrics,
            page_size,
        }
    }

    #[instrument(skip(self), fields(scope = ?scope))]
    pub async fn run(&self, scope: Scope) -> Result<ReconciliationReport> {
        let started_at = Utc::now();
        let started = Instant::now();

        // One consistent read, so writes committing during the run cannot
        // split an invoice from its payment and refund rows.
        let LedgerSnapshot {
            invoices,
            payments,
            refunds,
        } = self.store.snapshot(scope, self.page_size).await?;

        let (revenue_from_invoices, revenue_from_records, discrepancies) =
            check(&invoices, &payments, &refunds)?;

        let elapsed = started.elapsed();
        self.metrics.record_latency("reconciliation", elapsed);

        let report = ReconciliationReport {
            scope,
            started_at,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            invoices_checked: invoices.len(),
            payments_checked: payments.len(),
            refunds_checked: refunds.len(),
            revenue_from_invoices,
            revenue_from_records,
            discrepancies,
        };

        if report.passed() {
            info!(
                invoices = report.invoices_checked,
                payments = report.payments_checked,
                refunds = report.refunds_checked,
                revenue = report.revenue_from_invoices,
                "Reconciliation passed"
            );
        } else {
            warn!(
                discrepancies = report.discrepancies.len(),
                revenue_from_invoices = report.revenue_from_invoices,
                revenue_from_records = report.revenue_from_records,
                "Reconciliation found discrepancies"
            );
        }
        Ok(report)
    }
}

/// Returns `(revenue_from_invoices, revenue_from_records, discrepancies)`.
fn check(
    invoices: &[Invoice],
    payments: &[Payment],
    refunds: &[Refund],
) -> Result<(MinorUnits, MinorUnits, Vec<Discrepancy>)> {
    let mut discrepancies = Vec::new();
    let mut tallies: BTreeMap<Uuid, Tally> = invoices
        .iter()
        .map(|i| (i.invoice_id, Tally::default()))
        .collect();

    for payment in payments {
        if !payment.is_split_consistent() {
            discrepancies.push(Discrepancy::PaymentSplit {
                payment_id: payment.payment_id,
                invoice_id: payment.invoice_id,
                amount: payment.amount,
                applied_amount: payment.applied_amount,
                overpayment_amount: payment.overpayment_amount,
            });
        }
        match tallies.get_mut(&payment.invoice_id) {
            Some(tally) => {
                tally.applied = money::add(tally.applied, payment.applied_amount, "paid_total")?;
                tally.overpayment = money::add(
                    tally.overpayment,
                    payment.overpayment_amount,
                    "overpayment_total",
                )?;
                tally.payment_count += 1;
            }
            None => discrepancies.push(Discrepancy::OrphanPayment {
                payment_id: payment.payment_id,
                invoice_id: payment.invoice_id,
            }),
        }
    }

    for refund in refunds {
        match tallies.get_mut(&refund.invoice_id) {
            Some(tally) => {
                tally.refunded = money::add(tally.refunded, refund.amount, "refunded_total")?;
            }
            None => discrepancies.push(Discrepancy::OrphanRefund {
                refund_id: refund.refund_id,
                invoice_id: refund.invoice_id,
            }),
        }
    }

    let by_id: HashMap<Uuid, &Invoice> = invoices.iter().map(|i| (i.invoice_id, i)).collect();
    for (invoice_id, tally) in &tallies {
        let Some(invoice) = by_id.get(invoice_id) else {
            continue;
        };

        let mismatches: Vec<FieldMismatch> = [
            (AggregateField::PaidTotal, invoice.paid_total, tally.applied),
            (
                AggregateField::OverpaymentTotal,
                invoice.overpayment_total,
                tally.overpayment,
            ),
            (AggregateField::RefundedTotal, invoice.refunded_total, tally.refunded),
        ]
        .into_iter()
        .filter(|(_, stored, recomputed)| stored != recomputed)
        .map(|(field, stored, recomputed)| FieldMismatch {
            field,
            stored,
            recomputed,
        })
        .collect();

        if !mismatches.is_empty() {
            discrepancies.push(Discrepancy::InvoiceAggregate {
                invoice_id: *invoice_id,
                org_id: invoice.org_id,
                mismatches,
            });
        }
        if invoice.refunded_total > invoice.paid_total {
            discrepancies.push(Discrepancy::RefundExceedsPaid {
                invoice_id: *invoice_id,
                paid_total: invoice.paid_total,
                refunded_total: invoice.refunded_total,
            });
        }
        if invoice.status == InvoiceStatus::Pending && tally.payment_count > 0 {
            discrepancies.push(Discrepancy::StatusMismatch {
                invoice_id: *invoice_id,
                status: invoice.status,
                payment_count: tally.payment_count,
            });
        }
    }

    let revenue_from_invoices = money::sum(
        invoices
            .iter()
            .filter(|i| i.status == InvoiceStatus::Paid)
            .map(Invoice::net_paid),
    )?;
    let applied = money::sum(payments.iter().map(|p| p.applied_amount))?;
    let refunded = money::sum(refunds.iter().map(|r| r.amount))?;
    let revenue_from_records = applied
        .checked_sub(refunded)
        .ok_or(LedgerError::AmountOverflow("revenue"))?;

    if revenue_from_invoices != revenue_from_records {
        discrepancies.push(Discrepancy::Revenue {
            from_invoices: revenue_from_invoices,
            from_records: revenue_from_records,
            drift: revenue_from_invoices - revenue_from_records,
        });
    }

    Ok((revenue_from_invoices, revenue_from_records, discrepancies))
}
