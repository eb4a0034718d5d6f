//! Ledger reconciler invariants, exercised directly against the in-memory
//! backend: balance bounds, no lost updates, and atomic rejections.

mod common;

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use uuid::Uuid;

use common::seed_invoice;
use payment_recon_rs::error::PaymentError;
use payment_recon_rs::models::{Gateway, Invoice, InvoiceStatus};
use payment_recon_rs::reconciler::{LedgerReconciler, PaymentMeta};
use payment_recon_rs::store::{LedgerStore, MemoryLedgerStore};

fn meta(txn_ref: &str) -> PaymentMeta {
    PaymentMeta {
        gateway: Gateway::CardHosted,
        provider_txn_ref: txn_ref.to_string(),
        payment_intent_id: None,
    }
}

fn setup(allow_overpayment: bool) -> (Arc<MemoryLedgerStore>, Arc<LedgerReconciler>) {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Arc::new(LedgerReconciler::new(store.clone(), allow_overpayment));
    (store, reconciler)
}

#[tokio::test]
async fn concurrent_payments_are_never_lost() {
    let (store, reconciler) = setup(false);
    let invoice_id = seed_invoice(&store, 100_000, "USD").await;

    let tasks = (0..10).map(|i| {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            reconciler
                .apply_payment(invoice_id, 10_000, "USD", meta(&format!("TXN_LOST_{i}")))
                .await
        })
    });

    for result in join_all(tasks).await {
        result.unwrap().expect("every payment fits the headroom");
    }

    let invoice = store.invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.amount_paid_minor, 100_000, "no update may be lost");
    assert_eq!(invoice.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn two_concurrent_payments_with_headroom_both_land() {
    let (store, reconciler) = setup(false);
    let invoice_id = seed_invoice(&store, 10_000, "USD").await;

    let a = {
        let r = reconciler.clone();
        tokio::spawn(async move { r.apply_payment(invoice_id, 4_000, "USD", meta("TXN_A")).await })
    };
    let b = {
        let r = reconciler.clone();
        tokio::spawn(async move { r.apply_payment(invoice_id, 6_000, "USD", meta("TXN_B")).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let invoice = store.invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.amount_paid_minor, 10_000);
    assert_eq!(invoice.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn overpayment_is_rejected_without_the_policy_flag() {
    let (store, reconciler) = setup(false);
    let invoice_id = seed_invoice(&store, 10_000, "USD").await;

    reconciler
        .apply_payment(invoice_id, 6_000, "USD", meta("TXN_OP_1"))
        .await
        .unwrap();

    let err = reconciler
        .apply_payment(invoice_id, 5_000, "USD", meta("TXN_OP_2"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::OverpaymentNotAllowed { .. }));

    let invoice = store.invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.amount_paid_minor, 6_000);
    assert_eq!(invoice.status, InvoiceStatus::Partial);
}

#[tokio::test]
async fn overpayment_policy_lifts_the_ceiling() {
    let (store, reconciler) = setup(true);
    let invoice_id = seed_invoice(&store, 10_000, "USD").await;

    reconciler
        .apply_payment(invoice_id, 15_000, "USD", meta("TXN_OP_3"))
        .await
        .unwrap();

    let invoice = store.invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.amount_paid_minor, 15_000);
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.balance_due_minor(), -5_000);
}

#[tokio::test]
async fn currency_mismatch_is_an_integrity_failure() {
    let (store, reconciler) = setup(false);
    let invoice_id = seed_invoice(&store, 10_000, "USD").await;

    let err = reconciler
        .apply_payment(invoice_id, 10_000, "EUR", meta("TXN_CUR"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::CurrencyMismatch { .. }));

    let invoice = store.invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.amount_paid_minor, 0);
}

#[tokio::test]
async fn duplicate_provider_transaction_ref_conflicts() {
    let (store, reconciler) = setup(false);
    let invoice_id = seed_invoice(&store, 10_000, "USD").await;

    reconciler
        .apply_payment(invoice_id, 4_000, "USD", meta("TXN_SAME"))
        .await
        .unwrap();

    let err = reconciler
        .apply_payment(invoice_id, 4_000, "USD", meta("TXN_SAME"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Store(_)));

    let invoice = store.invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.amount_paid_minor, 4_000);
}

#[tokio::test]
async fn void_invoice_accepts_no_payments() {
    let (store, reconciler) = setup(false);
    let now = Utc::now();
    let invoice = Invoice {
        id: Uuid::new_v4(),
        total_minor: 10_000,
        amount_paid_minor: 0,
        currency: "USD".to_string(),
        status: InvoiceStatus::Void,
        created_at: now,
        updated_at: now,
    };
    store.insert_invoice(&invoice).await.unwrap();

    let err = reconciler
        .apply_payment(invoice.id, 10_000, "USD", meta("TXN_VOID"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InvalidRequest(_)));
}

#[tokio::test]
async fn overdue_invoice_moves_with_money_like_any_other() {
    let (store, reconciler) = setup(false);
    let now = Utc::now();
    let invoice = Invoice {
        id: Uuid::new_v4(),
        total_minor: 10_000,
        amount_paid_minor: 0,
        currency: "USD".to_string(),
        status: InvoiceStatus::Overdue,
        created_at: now,
        updated_at: now,
    };
    store.insert_invoice(&invoice).await.unwrap();

    let (_, updated) = reconciler
        .apply_payment(invoice.id, 4_000, "USD", meta("TXN_OD_1"))
        .await
        .unwrap();
    assert_eq!(updated.status, InvoiceStatus::Partial);

    let (_, updated) = reconciler
        .apply_payment(invoice.id, 6_000, "USD", meta("TXN_OD_2"))
        .await
        .unwrap();
    assert_eq!(updated.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn rejected_refund_leaves_both_rows_untouched() {
    let (store, reconciler) = setup(false);
    let invoice_id = seed_invoice(&store, 10_000, "USD").await;

    let (payment, _) = reconciler
        .apply_payment(invoice_id, 6_000, "USD", meta("TXN_RB"))
        .await
        .unwrap();

    let err = reconciler
        .apply_refund(payment.id, 8_000, None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PaymentError::RefundExceedsPayment {
            requested_minor: 8_000,
            remaining_minor: 6_000
        }
    ));

    let payment = store.payment(payment.id).await.unwrap().unwrap();
    assert_eq!(payment.refunded_minor, 0);
    let invoice = store.invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.amount_paid_minor, 6_000);
}

#[tokio::test]
async fn concurrent_payment_and_refund_keep_the_ledger_consistent() {
    let (store, reconciler) = setup(false);
    let invoice_id = seed_invoice(&store, 20_000, "USD").await;

    let (first, _) = reconciler
        .apply_payment(invoice_id, 8_000, "USD", meta("TXN_MIX_1"))
        .await
        .unwrap();

    let pay = {
        let r = reconciler.clone();
        tokio::spawn(async move {
            r.apply_payment(invoice_id, 7_000, "USD", meta("TXN_MIX_2"))
                .await
        })
    };
    let refund = {
        let r = reconciler.clone();
        tokio::spawn(async move { r.apply_refund(first.id, 8_000, None, None).await })
    };
    pay.await.unwrap().unwrap();
    refund.await.unwrap().unwrap();

    // +8000 +7000 -8000, in whatever interleaving the lock admitted.
    let invoice = store.invoice(invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.amount_paid_minor, 7_000);
    assert_eq!(invoice.status, InvoiceStatus::Partial);
}

#[tokio::test]
async fn balance_invariant_holds_after_every_committed_step() {
    let (store, reconciler) = setup(false);
    let invoice_id = seed_invoice(&store, 10_000, "USD").await;

    let assert_invariant = |invoice: &Invoice| {
        assert!(
            invoice.amount_paid_minor >= 0 && invoice.amount_paid_minor <= invoice.total_minor,
            "invariant violated: paid={} total={}",
            invoice.amount_paid_minor,
            invoice.total_minor
        );
    };

    let (p1, invoice) = reconciler
        .apply_payment(invoice_id, 3_000, "USD", meta("TXN_SEQ_1"))
        .await
        .unwrap();
    assert_invariant(&invoice);
    assert_eq!(invoice.status, InvoiceStatus::Partial);

    let (_, invoice) = reconciler
        .apply_payment(invoice_id, 7_000, "USD", meta("TXN_SEQ_2"))
        .await
        .unwrap();
    assert_invariant(&invoice);
    assert_eq!(invoice.status, InvoiceStatus::Paid);

    let (_, _, invoice) = reconciler
        .apply_refund(p1.id, 1_500, None, None)
        .await
        .unwrap();
    assert_invariant(&invoice);
    assert_eq!(invoice.status, InvoiceStatus::Partial);

    let (_, _, invoice) = reconciler
        .apply_refund(p1.id, 1_500, None, None)
        .await
        .unwrap();
    assert_invariant(&invoice);
    assert_eq!(invoice.amount_paid_minor, 7_000);
}
