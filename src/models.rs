use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// External payment provider a payment is collected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "payment_gateway", rename_all = "kebab-case")]
pub enum Gateway {
    CardHosted,
    OrderSignature,
    MobileMoney,
}

impl Gateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gateway::CardHosted => "card-hosted",
            Gateway::OrderSignature => "order-signature",
            Gateway::MobileMoney => "mobile-money",
        }
    }

    /// Parse the gateway segment of a webhook path.
    pub fn from_path(s: &str) -> Option<Gateway> {
        match s {
            "card-hosted" => Some(Gateway::CardHosted),
            "order-signature" => Some(Gateway::OrderSignature),
            "mobile-money" => Some(Gateway::MobileMoney),
            _ => None,
        }
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a gateway settles only the exact requested amount or may confirm
/// less than requested (the ledger then records the provider amount).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountPolicy {
    ExactMatch,
    AcceptPartial,
}

// ============================================================================
// INVOICE LEDGER VIEW
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "invoice_status", rename_all = "snake_case")]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
    Overdue,
    Void,
}

/// Payment-derived view of an invoice. The CRUD layer owns the rest of the
/// invoice; these fields are written only by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub total_minor: i64,
    pub amount_paid_minor: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn balance_due_minor(&self) -> i64 {
        self.total_minor - self.amount_paid_minor
    }
}

// ============================================================================
// PAYMENT INTENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_intent_status", rename_all = "snake_case")]
pub enum IntentStatus {
    Created,
    AwaitingConfirmation,
    Verified,
    Failed,
    Expired,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Verified | IntentStatus::Failed | IntentStatus::Expired
        )
    }
}

/// One attempt to collect a specific amount for an invoice via a specific
/// gateway. At most one non-terminal intent may exist per (invoice, gateway).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub gateway: Gateway,
    pub requested_minor: i64,
    pub currency: String,
    pub status: IntentStatus,
    pub provider_session_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn new(invoice_id: Uuid, gateway: Gateway, requested_minor: i64, currency: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            invoice_id,
            gateway,
            requested_minor,
            currency: currency.to_string(),
            status: IntentStatus::Created,
            provider_session_ref: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// PAYMENTS & REFUNDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
pub enum PaymentStatus {
    Completed,
    Refunded,
    PartiallyRefunded,
}

/// A confirmed monetary movement against an invoice. `provider_txn_ref` is
/// stored exactly as received; it is the cross-system join key for audits.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub payment_intent_id: Option<Uuid>,
    pub amount_minor: i64,
    pub currency: String,
    pub gateway: Gateway,
    pub provider_txn_ref: String,
    pub status: PaymentStatus,
    pub refunded_minor: i64,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn refundable_minor(&self) -> i64 {
        self.amount_minor - self.refunded_minor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "refund_status", rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RefundRequest {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub amount_minor: i64,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub provider_refund_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// NORMALIZED ADAPTER CONTRACT
// ============================================================================

/// Provider-side session created by `GatewayAdapter::initiate`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSession {
    pub session_ref: String,
    /// Hosted-checkout URL to send the payer to, when the gateway uses one.
    pub redirect_url: Option<String>,
    /// Client-side challenge data (SDK key, handset prompt) for gateways
    /// that complete the payment without a redirect.
    pub client_prompt: Option<String>,
}

/// Normalized result of a provider confirmation, independent of how the
/// provider encodes status. No downstream code branches on provider shapes.
#[derive(Debug, Clone)]
pub struct PaymentAttemptResult {
    pub gateway: Gateway,
    pub success: bool,
    pub amount_minor: i64,
    pub currency: String,
    pub provider_txn_ref: String,
    pub session_ref: Option<String>,
    /// Invoice reference carried in the provider payload, when present.
    /// Required to accept an out-of-band payment with no live intent.
    pub invoice_id: Option<Uuid>,
    pub raw_status: String,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub success: bool,
    pub provider_refund_ref: Option<String>,
    pub raw_status: String,
}

// ============================================================================
// CONFIRMATION OUTCOME (idempotency snapshot + verify response body)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmStatus {
    Confirmed,
    Declined,
}

/// The outcome of processing one confirmation event. Persisted verbatim as
/// the idempotency snapshot so every duplicate delivery observes an
/// identical response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmOutcome {
    pub status: ConfirmStatus,
    pub gateway: Gateway,
    pub provider_txn_ref: String,
    pub invoice_id: Option<Uuid>,
    pub payment_intent_id: Option<Uuid>,
    pub payment: Option<Payment>,
    pub invoice_status: Option<InvoiceStatus>,
    pub balance_due_minor: Option<i64>,
    /// True when the payment was accepted without a live intent (late
    /// webhook for an expired session, or a transaction the provider settled
    /// outside any session we know about).
    pub out_of_band: bool,
}

// ============================================================================
// API REQUEST / RESPONSE BODIES
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub invoice_id: Uuid,
    pub gateway: Gateway,
    /// Defaults to the invoice balance due.
    pub amount_minor: Option<i64>,
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitiatePaymentResponse {
    pub intent_id: Uuid,
    pub session_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    pub gateway: Gateway,
    pub session_ref: String,
    /// Gateway-specific proof (e.g. the order-signature triple). Interpreted
    /// by the adapter, never by the coordinator.
    #[serde(default)]
    pub proof: JsonValue,
}

#[derive(Debug, Deserialize)]
pub struct RefundPaymentRequest {
    pub amount_minor: i64,
    pub reason: Option<String>,
}

/// Read-only ledger projection returned by `GET /api/invoices/{id}`.
#[derive(Debug, Serialize)]
pub struct InvoiceView {
    pub id: Uuid,
    pub total_minor: i64,
    pub amount_paid_minor: i64,
    pub balance_due_minor: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub payments: Vec<Payment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceView {
    pub fn from_parts(invoice: Invoice, payments: Vec<Payment>) -> Self {
        Self {
            balance_due_minor: invoice.balance_due_minor(),
            id: invoice.id,
            total_minor: invoice.total_minor,
            amount_paid_minor: invoice.amount_paid_minor,
            currency: invoice.currency,
            status: invoice.status,
            payments,
            created_at: invoice.created_at,
            updated_at: invoice.updated_at,
        }
    }
}

/// Standard error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
