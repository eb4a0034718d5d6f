//! Outbound event contracts.
//!
//! Events are a post-commit, fire-and-forget notification to the rest of
//! the platform (dashboards, dunning, GL). Payloads carry the post-commit
//! invoice state so consumers need no read-back.

pub mod publisher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Gateway, InvoiceStatus};

pub use publisher::{EventPublisher, InMemoryEventPublisher, NatsEventPublisher, PublishError};

pub const SUBJECT_PREFIX: &str = "payments.events";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(event_type: impl Into<String>, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            source: format!("payment-recon-rs@{}", env!("CARGO_PKG_VERSION")),
            payload,
        }
    }
}

/// payments.events.payment.confirmed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmedPayload {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<Uuid>,
    pub gateway: Gateway,
    pub amount_minor: i64,
    pub currency: String,
    pub provider_txn_ref: String,
    pub invoice_status: InvoiceStatus,
    pub balance_due_minor: i64,
    pub out_of_band: bool,
}

/// payments.events.payment.failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<Uuid>,
    pub gateway: Gateway,
    pub provider_txn_ref: String,
    pub raw_status: String,
}

/// payments.events.payment.refunded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRefundedPayload {
    pub refund_id: Uuid,
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub invoice_status: InvoiceStatus,
    pub balance_due_minor: i64,
}

/// payments.events.intent.expired
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentExpiredPayload {
    pub payment_intent_id: Uuid,
    pub invoice_id: Uuid,
    pub gateway: Gateway,
}
