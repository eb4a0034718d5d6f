//! Ledger reconciler.
//!
//! The only writer of the invoice's payment-derived fields. Every
//! read-modify-write runs under a per-invoice exclusive section, so two
//! events touching the same invoice (a payment and a refund, two partial
//! payments) never interleave, and unrelated invoices never contend.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::models::{
    Gateway, Invoice, InvoiceStatus, Payment, PaymentStatus, RefundRequest, RefundStatus,
};
use crate::store::LedgerStore;

/// Provenance attached to a payment row at reconciliation time.
#[derive(Debug, Clone)]
pub struct PaymentMeta {
    pub gateway: Gateway,
    pub provider_txn_ref: String,
    pub payment_intent_id: Option<Uuid>,
}

pub struct LedgerReconciler {
    store: Arc<dyn LedgerStore>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    allow_overpayment: bool,
}

impl LedgerReconciler {
    pub fn new(store: Arc<dyn LedgerStore>, allow_overpayment: bool) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            allow_overpayment,
        }
    }

    fn invoice_lock(&self, invoice_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(invoice_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Status rule after money lands: `paid` once the balance is covered,
    /// `partial` while something is paid, otherwise unchanged (`overdue`
    /// and `unpaid` stay what they are until money moves them).
    fn status_after_payment(invoice: &Invoice) -> InvoiceStatus {
        if invoice.balance_due_minor() <= 0 {
            InvoiceStatus::Paid
        } else if invoice.amount_paid_minor > 0 {
            InvoiceStatus::Partial
        } else {
            invoice.status
        }
    }

    /// Refunds walk the same rule downwards and may land back on `unpaid`.
    fn status_after_refund(invoice: &Invoice) -> InvoiceStatus {
        if invoice.status == InvoiceStatus::Void {
            InvoiceStatus::Void
        } else if invoice.balance_due_minor() <= 0 {
            InvoiceStatus::Paid
        } else if invoice.amount_paid_minor > 0 {
            InvoiceStatus::Partial
        } else {
            InvoiceStatus::Unpaid
        }
    }

    /// Apply a verified payment to the invoice ledger. Commits the payment
    /// row and the recomputed invoice atomically.
    pub async fn apply_payment(
        &self,
        invoice_id: Uuid,
        amount_minor: i64,
        currency: &str,
        meta: PaymentMeta,
    ) -> Result<(Payment, Invoice), PaymentError> {
        if amount_minor <= 0 {
            return Err(PaymentError::InvalidRequest(
                "payment amount must be positive".to_string(),
            ));
        }

        let lock = self.invoice_lock(invoice_id);
        let _guard = lock.lock().await;

        let mut invoice = self
            .store
            .invoice(invoice_id)
            .await?
            .ok_or(PaymentError::NotFound("invoice"))?;

        if invoice.status == InvoiceStatus::Void {
            return Err(PaymentError::InvalidRequest(
                "invoice is void".to_string(),
            ));
        }
        if !currency.eq_ignore_ascii_case(&invoice.currency) {
            return Err(PaymentError::CurrencyMismatch {
                expected: invoice.currency.clone(),
                got: currency.to_string(),
            });
        }

        let new_paid = invoice.amount_paid_minor + amount_minor;
        if new_paid > invoice.total_minor && !self.allow_overpayment {
            return Err(PaymentError::OverpaymentNotAllowed { amount_minor });
        }

        let payment = Payment {
            id: Uuid::new_v4(),
            invoice_id,
            payment_intent_id: meta.payment_intent_id,
            amount_minor,
            currency: invoice.currency.clone(),
            gateway: meta.gateway,
            provider_txn_ref: meta.provider_txn_ref,
            status: PaymentStatus::Completed,
            refunded_minor: 0,
            created_at: Utc::now(),
        };

        invoice.amount_paid_minor = new_paid;
        invoice.status = Self::status_after_payment(&invoice);
        invoice.updated_at = Utc::now();

        self.store.commit_payment(&payment, &invoice).await?;
        Ok((payment, invoice))
    }

    /// The refundable remainder of a payment. Read-only precheck for the
    /// coordinator before it touches the provider; the authoritative check
    /// re-runs under the invoice lock in `apply_refund`.
    pub async fn refundable_remainder(
        &self,
        payment_id: Uuid,
    ) -> Result<(Payment, i64), PaymentError> {
        let payment = self
            .store
            .payment(payment_id)
            .await?
            .ok_or(PaymentError::NotFound("payment"))?;
        let remaining = payment.refundable_minor();
        Ok((payment, remaining))
    }

    /// Apply a provider-confirmed refund. Rejects with
    /// `RefundExceedsPayment` before mutating anything if the amount exceeds
    /// the un-refunded remainder.
    pub async fn apply_refund(
        &self,
        payment_id: Uuid,
        amount_minor: i64,
        reason: Option<String>,
        provider_refund_ref: Option<String>,
    ) -> Result<(RefundRequest, Payment, Invoice), PaymentError> {
        if amount_minor <= 0 {
            return Err(PaymentError::InvalidRequest(
                "refund amount must be positive".to_string(),
            ));
        }

        let payment = self
            .store
            .payment(payment_id)
            .await?
            .ok_or(PaymentError::NotFound("payment"))?;

        let lock = self.invoice_lock(payment.invoice_id);
        let _guard = lock.lock().await;

        // Re-read under the lock; a concurrent refund may have landed since.
        let mut payment = self
            .store
            .payment(payment_id)
            .await?
            .ok_or(PaymentError::NotFound("payment"))?;

        let remaining = payment.refundable_minor();
        if amount_minor > remaining {
            return Err(PaymentError::RefundExceedsPayment {
                requested_minor: amount_minor,
                remaining_minor: remaining,
            });
        }

        let mut invoice = self
            .store
            .invoice(payment.invoice_id)
            .await?
            .ok_or(PaymentError::NotFound("invoice"))?;

        payment.refunded_minor += amount_minor;
        payment.status = if payment.refunded_minor == payment.amount_minor {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };

        invoice.amount_paid_minor -= amount_minor;
        invoice.status = Self::status_after_refund(&invoice);
        invoice.updated_at = Utc::now();

        let refund = RefundRequest {
            id: Uuid::new_v4(),
            payment_id,
            amount_minor,
            reason,
            status: RefundStatus::Completed,
            provider_refund_ref,
            created_at: Utc::now(),
        };

        self.store.commit_refund(&refund, &payment, &invoice).await?;
        Ok((refund, payment, invoice))
    }

    /// Keep a refund the provider declined in the trail instead of dropping
    /// it.
    pub async fn record_failed_refund(
        &self,
        payment_id: Uuid,
        amount_minor: i64,
        reason: Option<String>,
    ) -> Result<RefundRequest, PaymentError> {
        let refund = RefundRequest {
            id: Uuid::new_v4(),
            payment_id,
            amount_minor,
            reason,
            status: RefundStatus::Failed,
            provider_refund_ref: None,
            created_at: Utc::now(),
        };
        self.store.insert_refund(&refund).await?;
        Ok(refund)
    }
}
