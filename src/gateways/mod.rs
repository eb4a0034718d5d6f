//! Provider adapters.
//!
//! Each external provider speaks a different protocol; every adapter
//! normalizes it into the same contract at this boundary so no downstream
//! code ever branches on provider-specific shapes.

pub mod hosted_checkout;
pub mod mobile_money;
pub mod mock;
pub mod order_signature;

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value as JsonValue;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::models::{
    AmountPolicy, Gateway, PaymentAttemptResult, ProviderSession, RefundOutcome,
};

pub use hosted_checkout::HostedCheckoutGateway;
pub use mobile_money::MobileMoneyGateway;
pub use mock::MockGateway;
pub use order_signature::OrderSignatureGateway;

type HmacSha256 = Hmac<Sha256>;

/// One external payment provider, normalized.
///
/// Adapters are stateless and safe to call concurrently; their only side
/// effects are outbound provider calls. `parse_webhook` is pure (signature
/// check + decode) so webhook acknowledgement stays fast.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn gateway(&self) -> Gateway;

    /// Whether this gateway settles only the exact requested amount or may
    /// confirm a partial payment.
    fn amount_policy(&self) -> AmountPolicy;

    /// How long a provider session stays confirmable.
    fn session_ttl(&self) -> chrono::Duration;

    async fn initiate(
        &self,
        invoice_id: Uuid,
        amount_minor: i64,
        currency: &str,
        return_url: Option<&str>,
    ) -> Result<ProviderSession, PaymentError>;

    async fn verify(
        &self,
        session_ref: &str,
        proof: &JsonValue,
    ) -> Result<PaymentAttemptResult, PaymentError>;

    fn parse_webhook(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<PaymentAttemptResult, PaymentError>;

    async fn refund(
        &self,
        provider_txn_ref: &str,
        amount_minor: i64,
        reason: Option<&str>,
    ) -> Result<RefundOutcome, PaymentError>;
}

/// Provider calls use bounded timeouts; anything slower is treated as
/// `GatewayUnavailable` and retried by the coordinator.
pub(crate) fn http_client() -> Result<Client, PaymentError> {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))
}

pub(crate) fn transport_error(e: reqwest::Error) -> PaymentError {
    PaymentError::GatewayUnavailable(e.to_string())
}

/// Decode a provider response, classifying HTTP failures: 5xx is retryable,
/// 4xx means we sent something the provider rejects.
pub(crate) async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, PaymentError> {
    let status = response.status();
    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable(format!("malformed provider response: {e}")))
    } else {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read error response".to_string());
        if status.is_server_error() {
            Err(PaymentError::GatewayUnavailable(format!(
                "provider returned {status}: {body}"
            )))
        } else {
            Err(PaymentError::InvalidRequest(format!(
                "provider rejected request ({status}): {body}"
            )))
        }
    }
}

pub(crate) fn sign_hmac_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time HMAC check against a hex-encoded signature.
pub(crate) fn verify_hmac_hex(secret: &str, message: &[u8], provided_hex: &str) -> bool {
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.verify_slice(&provided).is_ok()
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
