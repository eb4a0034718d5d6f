//! In-memory ledger backend for development and tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Gateway, IntentStatus, Invoice, Payment, PaymentIntent, RefundRequest};
use crate::store::{LedgerStore, StoreError};

#[derive(Default)]
struct Inner {
    invoices: HashMap<Uuid, Invoice>,
    payments: HashMap<Uuid, Payment>,
    intents: HashMap<Uuid, PaymentIntent>,
    refunds: HashMap<Uuid, RefundRequest>,
    /// Mirrors the unique `(gateway, provider_txn_ref)` index.
    txn_refs: HashSet<(Gateway, String)>,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<Inner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn invoice(&self, id: Uuid) -> Result<Option<Invoice>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.invoices.get(&id).cloned())
    }

    async fn payment(&self, id: Uuid) -> Result<Option<Payment>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.payments.get(&id).cloned())
    }

    async fn payments_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<Payment>, StoreError> {
        let inner = self.inner.lock().await;
        let mut payments: Vec<Payment> = inner
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn commit_payment(&self, payment: &Payment, invoice: &Invoice) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let txn_key = (payment.gateway, payment.provider_txn_ref.clone());
        if inner.txn_refs.contains(&txn_key) {
            return Err(StoreError::Conflict(format!(
                "provider transaction {} already recorded for {}",
                payment.provider_txn_ref, payment.gateway
            )));
        }
        inner.txn_refs.insert(txn_key);
        inner.payments.insert(payment.id, payment.clone());
        inner.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn commit_refund(
        &self,
        refund: &RefundRequest,
        payment: &Payment,
        invoice: &Invoice,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.refunds.insert(refund.id, refund.clone());
        inner.payments.insert(payment.id, payment.clone());
        inner.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn insert_refund(&self, refund: &RefundRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.refunds.insert(refund.id, refund.clone());
        Ok(())
    }

    async fn insert_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        // Mirrors the partial unique index on (invoice_id, gateway) over
        // non-terminal intents.
        if !intent.status.is_terminal()
            && inner.intents.values().any(|i| {
                i.invoice_id == intent.invoice_id
                    && i.gateway == intent.gateway
                    && i.id != intent.id
                    && !i.status.is_terminal()
            })
        {
            return Err(StoreError::Conflict(format!(
                "active payment intent already exists for invoice {} via {}",
                intent.invoice_id, intent.gateway
            )));
        }
        inner.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn update_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.intents.contains_key(&intent.id) {
            return Err(StoreError::NotFound("payment intent"));
        }
        inner.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn intent(&self, id: Uuid) -> Result<Option<PaymentIntent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.intents.get(&id).cloned())
    }

    async fn intent_by_session(
        &self,
        gateway: Gateway,
        session_ref: &str,
    ) -> Result<Option<PaymentIntent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .intents
            .values()
            .find(|i| {
                i.gateway == gateway && i.provider_session_ref.as_deref() == Some(session_ref)
            })
            .cloned())
    }

    async fn active_intent(
        &self,
        invoice_id: Uuid,
        gateway: Gateway,
    ) -> Result<Option<PaymentIntent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .intents
            .values()
            .find(|i| {
                i.invoice_id == invoice_id && i.gateway == gateway && !i.status.is_terminal()
            })
            .cloned())
    }

    async fn expire_intents_before(
        &self,
        gateway: Gateway,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentIntent>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut expired = Vec::new();
        for intent in inner.intents.values_mut() {
            if intent.gateway == gateway
                && intent.status == IntentStatus::AwaitingConfirmation
                && intent.created_at < cutoff
            {
                intent.status = IntentStatus::Expired;
                intent.updated_at = now;
                expired.push(intent.clone());
            }
        }
        Ok(expired)
    }
}
