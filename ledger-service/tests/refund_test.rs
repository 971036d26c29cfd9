//! Refund integration tests.

mod common;

use clinic_ledger::models::InvoiceStatus;
use clinic_ledger::LedgerError;
use common::{payment_request, refund_request, spawn_ledger};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

/// A refund within the cap succeeds; a later one crossing it is rejected
/// and leaves the invoice untouched.
#[tokio::test]
async fn refund_within_cap_then_reject_over_cap() {
    let ledger = spawn_ledger();
    let (invoice, payment_id) = ledger.create_paid_invoice(10000).await;

    let refund_id = ledger
        .engine
        .refunds
        .create_refund(&refund_request(&invoice, payment_id, 4000))
        .await
        .unwrap();

    let after_first = ledger.reload(&invoice).await;
    assert_eq!(after_first.refunded_total, 4000);

    let result = ledger
        .engine
        .refunds
        .create_refund(&refund_request(&invoice, payment_id, 7000))
        .await;
    match result {
        Err(LedgerError::RefundExceedsCap {
            refunded_total,
            requested,
            cap,
            ..
        }) => {
            assert_eq!(refunded_total, 4000);
            assert_eq!(requested, 7000);
            assert_eq!(cap, 10000);
        }
        other => panic!("expected RefundExceedsCap, got {:?}", other),
    }

    assert_eq!(ledger.reload(&invoice).await, after_first);
    let refunds = ledger
        .engine
        .invoices
        .list_refunds(ledger.org_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].refund_id, refund_id);
    assert_eq!(refunds[0].amount, 4000);
}

/// Refunding exactly up to the grand total is allowed; one more unit is not.
#[tokio::test]
async fn refund_cap_is_inclusive() {
    let ledger = spawn_ledger();
    let (invoice, payment_id) = ledger.create_paid_invoice(10000).await;

    assert_ok!(
        ledger
            .engine
            .refunds
            .create_refund(&refund_request(&invoice, payment_id, 10000))
            .await
    );
    let err = assert_err!(
        ledger
            .engine
            .refunds
            .create_refund(&refund_request(&invoice, payment_id, 1))
            .await
    );

    assert!(matches!(err, LedgerError::RefundExceedsCap { .. }));
    assert!(err.is_business());
    assert_eq!(ledger.reload(&invoice).await.refunded_total, 10000);
}

/// Overpayments are not refundable through the cap.
#[tokio::test]
async fn overpayment_does_not_raise_refund_cap() {
    let ledger = spawn_ledger();
    let invoice = ledger.create_invoice(10000).await;
    let confirmation = ledger
        .engine
        .payments
        .confirm_payment(
            ledger.org_id,
            invoice.invoice_id,
            &payment_request("over", 15000),
            "cashier",
        )
        .await
        .unwrap();

    let result = ledger
        .engine
        .refunds
        .create_refund(&refund_request(&invoice, confirmation.payment_id, 12000))
        .await;
    assert!(matches!(result, Err(LedgerError::RefundExceedsCap { cap: 10000, .. })));
}

#[tokio::test]
async fn reject_refund_on_pending_invoice() {
    let ledger = spawn_ledger();
    let invoice = ledger.create_invoice(10000).await;

    let result = ledger
        .engine
        .refunds
        .create_refund(&refund_request(&invoice, Uuid::new_v4(), 100))
        .await;

    assert!(matches!(
        result,
        Err(LedgerError::InvalidInvoiceStatus {
            expected: InvoiceStatus::Paid,
            actual: InvoiceStatus::Pending,
            ..
        })
    ));
}

#[tokio::test]
async fn reject_refund_for_unknown_invoice() {
    let ledger = spawn_ledger();
    let (mut invoice, payment_id) = ledger.create_paid_invoice(10000).await;
    invoice.invoice_id = Uuid::new_v4();

    let result = ledger
        .engine
        .refunds
        .create_refund(&refund_request(&invoice, payment_id, 100))
        .await;
    assert!(matches!(result, Err(LedgerError::InvoiceNotFound(_))));
}

/// The source payment must belong to the refunded invoice.
#[tokio::test]
async fn reject_refund_against_foreign_payment() {
    let ledger = spawn_ledger();
    let (invoice, _) = ledger.create_paid_invoice(10000).await;
    let (_, other_payment) = ledger.create_paid_invoice(10000).await;

    for payment_id in [other_payment, Uuid::new_v4()] {
        let result = ledger
            .engine
            .refunds
            .create_refund(&refund_request(&invoice, payment_id, 100))
            .await;
        assert!(matches!(result, Err(LedgerError::PaymentNotFound { .. })));
    }
    assert_eq!(ledger.reload(&invoice).await.refunded_total, 0);
}

#[tokio::test]
async fn reject_non_positive_refund() {
    let ledger = spawn_ledger();
    let (invoice, payment_id) = ledger.create_paid_invoice(10000).await;

    for amount in [0, -1] {
        let result = ledger
            .engine
            .refunds
            .create_refund(&refund_request(&invoice, payment_id, amount))
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::InvalidAmount { field: "amount", .. })
        ));
    }
}

/// Ten concurrent refunds that together reach the cap all succeed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refunds_under_cap_all_succeed() {
    let ledger = spawn_ledger();
    let (invoice, payment_id) = ledger.create_paid_invoice(10000).await;
    assert_eq!(invoice.paid_total, 10000);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = ledger.engine.clone();
        let request = refund_request(&invoice, payment_id, 1000);
        handles.push(tokio::spawn(async move {
            engine.refunds.create_refund(&request).await
        }));
    }

    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }

    let invoice = ledger.reload(&invoice).await;
    assert_eq!(invoice.refunded_total, 10000);

    let refunds = ledger
        .engine
        .invoices
        .list_refunds(ledger.org_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(refunds.len(), 10);
    assert_eq!(refunds.iter().map(|r| r.amount).sum::<i64>(), invoice.refunded_total);
    assert_eq!(ledger.metrics.snapshot().refund_success_count, 10);
}

/// Ten concurrent full refunds: exactly one wins, the rest hit the cap.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_full_refunds_single_winner() {
    let ledger = spawn_ledger();
    let (invoice, payment_id) = ledger.create_paid_invoice(10000).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = ledger.engine.clone();
        let request = refund_request(&invoice, payment_id, invoice.grand_total);
        handles.push(tokio::spawn(async move {
            engine.refunds.create_refund(&request).await
        }));
    }

    let mut succeeded = 0;
    let mut rejected = 0;
    for result in futures::future::join_all(handles).await {
        match result.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::RefundExceedsCap { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(rejected, 9);

    let invoice = ledger.reload(&invoice).await;
    assert_eq!(invoice.refunded_total, 10000);
    assert!(invoice.refunded_total <= invoice.paid_total);

    let snapshot = ledger.metrics.snapshot();
    assert_eq!(snapshot.refund_success_count, 1);
    assert_eq!(snapshot.refund_fail_count, 9);
}
