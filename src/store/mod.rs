pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Gateway, Invoice, Payment, PaymentIntent, RefundRequest};

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Persistence port for the ledger. The `commit_*` operations are atomic:
/// either the payment/refund row and the invoice update are both visible or
/// neither is.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;
    async fn invoice(&self, id: Uuid) -> Result<Option<Invoice>, StoreError>;

    async fn payment(&self, id: Uuid) -> Result<Option<Payment>, StoreError>;
    async fn payments_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<Payment>, StoreError>;

    /// Insert a payment and write back the invoice in one transaction.
    /// Rejects with `Conflict` if `(gateway, provider_txn_ref)` is taken.
    async fn commit_payment(&self, payment: &Payment, invoice: &Invoice) -> Result<(), StoreError>;

    /// Persist a completed refund, the updated payment, and the updated
    /// invoice in one transaction.
    async fn commit_refund(
        &self,
        refund: &RefundRequest,
        payment: &Payment,
        invoice: &Invoice,
    ) -> Result<(), StoreError>;

    /// Record a refund row on its own (used for failed gateway refunds).
    async fn insert_refund(&self, refund: &RefundRequest) -> Result<(), StoreError>;

    async fn insert_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError>;
    async fn update_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError>;
    async fn intent(&self, id: Uuid) -> Result<Option<PaymentIntent>, StoreError>;
    async fn intent_by_session(
        &self,
        gateway: Gateway,
        session_ref: &str,
    ) -> Result<Option<PaymentIntent>, StoreError>;

    /// The non-terminal intent for `(invoice, gateway)`, if one exists.
    async fn active_intent(
        &self,
        invoice_id: Uuid,
        gateway: Gateway,
    ) -> Result<Option<PaymentIntent>, StoreError>;

    /// Transition awaiting intents created before `cutoff` to `Expired` and
    /// return them.
    async fn expire_intents_before(
        &self,
        gateway: Gateway,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentIntent>, StoreError>;
}
