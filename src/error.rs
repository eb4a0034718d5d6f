use thiserror::Error;

use crate::store::StoreError;

/// Error taxonomy for the payment surface. Variants are classified as
/// retryable (transport) or terminal; only `GatewayUnavailable` is ever
/// retried.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("amount mismatch: provider confirmed {confirmed_minor}, intent requested {requested_minor}")]
    AmountMismatch {
        confirmed_minor: i64,
        requested_minor: i64,
    },

    #[error("currency mismatch: provider sent {got}, invoice is {expected}")]
    CurrencyMismatch { expected: String, got: String },

    #[error("an active payment intent already exists for this invoice and gateway")]
    DuplicateActiveIntent,

    #[error("payment of {amount_minor} would exceed the invoice total")]
    OverpaymentNotAllowed { amount_minor: i64 },

    #[error("refund of {requested_minor} exceeds the refundable remainder of {remaining_minor}")]
    RefundExceedsPayment {
        requested_minor: i64,
        remaining_minor: i64,
    },

    #[error("another confirmation for this transaction is still in flight")]
    IdempotencyConflict,

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl PaymentError {
    /// Only transport-class failures are safe to retry; integrity and
    /// business-rule failures are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PaymentError::GatewayUnavailable(_))
    }

    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::InvalidRequest(_) => "invalid_request",
            PaymentError::NotFound(_) => "not_found",
            PaymentError::GatewayUnavailable(_) => "gateway_unavailable",
            PaymentError::SignatureMismatch => "signature_mismatch",
            PaymentError::AmountMismatch { .. } => "amount_mismatch",
            PaymentError::CurrencyMismatch { .. } => "amount_mismatch",
            PaymentError::DuplicateActiveIntent => "duplicate_active_intent",
            PaymentError::OverpaymentNotAllowed { .. } => "overpayment_not_allowed",
            PaymentError::RefundExceedsPayment { .. } => "refund_exceeds_payment",
            PaymentError::IdempotencyConflict => "idempotency_conflict",
            PaymentError::Store(_) => "storage_error",
        }
    }
}
