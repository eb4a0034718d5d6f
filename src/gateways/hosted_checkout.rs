//! Card processor with a hosted checkout page.
//!
//! `initiate` opens a checkout session and returns the redirect URL;
//! confirmation arrives as a signed webhook (`t=...,v1=...` header over
//! `"{timestamp}.{body}"`) or through a session lookup when the client
//! returns from the redirect. Exact-amount gateway: the session settles the
//! requested amount or nothing.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{
    decode_response, header_str, http_client, sign_hmac_hex, transport_error, verify_hmac_hex,
    GatewayAdapter,
};
use crate::config::CardHostedConfig;
use crate::error::PaymentError;
use crate::models::{
    AmountPolicy, Gateway, PaymentAttemptResult, ProviderSession, RefundOutcome,
};

/// Maximum allowed webhook timestamp skew, in seconds.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const SIGNATURE_HEADER: &str = "checkout-signature";

pub struct HostedCheckoutGateway {
    config: Arc<CardHostedConfig>,
    http: Client,
}

impl HostedCheckoutGateway {
    pub fn new(config: CardHostedConfig) -> Result<Self, PaymentError> {
        Ok(Self {
            config: Arc::new(config),
            http: http_client()?,
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    amount_minor: i64,
    currency: &'a str,
    invoice_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    id: String,
    #[serde(default)]
    url: Option<String>,
    status: String,
    #[serde(default)]
    invoice_id: Option<Uuid>,
    #[serde(default)]
    payment: Option<CheckoutPayment>,
}

#[derive(Debug, Deserialize)]
struct CheckoutPayment {
    id: String,
    amount_minor: i64,
    currency: String,
}

#[derive(Debug, Serialize)]
struct CreateRefundRequest<'a> {
    payment_id: &'a str,
    amount_minor: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    payment_id: String,
    session_id: String,
    #[serde(default)]
    amount_minor: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    invoice_id: Option<Uuid>,
    status: String,
}

/// Verify a `t=<unix>,v1=<hex hmac>` signature header over
/// `"{timestamp}.{body}"`, rejecting stale timestamps to prevent replays.
pub fn verify_webhook_signature(
    body: &[u8],
    signature: &str,
    webhook_secret: &str,
) -> Result<(), PaymentError> {
    let parts: Vec<&str> = signature.split(',').collect();

    let timestamp = parts
        .iter()
        .find_map(|p| p.strip_prefix("t="))
        .ok_or(PaymentError::SignatureMismatch)?;
    let received = parts
        .iter()
        .find_map(|p| p.strip_prefix("v1="))
        .ok_or(PaymentError::SignatureMismatch)?;

    let webhook_time = timestamp
        .parse::<i64>()
        .map_err(|_| PaymentError::SignatureMismatch)?;
    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| PaymentError::SignatureMismatch)?
        .as_secs() as i64;
    if (current_time - webhook_time).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(PaymentError::SignatureMismatch);
    }

    let mut signed_payload = Vec::with_capacity(timestamp.len() + 1 + body.len());
    signed_payload.extend_from_slice(timestamp.as_bytes());
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(body);

    if verify_hmac_hex(webhook_secret, &signed_payload, received) {
        Ok(())
    } else {
        Err(PaymentError::SignatureMismatch)
    }
}

/// Build a signature header for a payload, standing in for the provider.
pub fn sign_webhook(body: &[u8], webhook_secret: &str, timestamp: i64) -> String {
    let mut signed_payload = Vec::new();
    signed_payload.extend_from_slice(timestamp.to_string().as_bytes());
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(body);
    format!(
        "t={},v1={}",
        timestamp,
        sign_hmac_hex(webhook_secret, &signed_payload)
    )
}

#[async_trait]
impl GatewayAdapter for HostedCheckoutGateway {
    fn gateway(&self) -> Gateway {
        Gateway::CardHosted
    }

    fn amount_policy(&self) -> AmountPolicy {
        AmountPolicy::ExactMatch
    }

    fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.session_ttl_minutes)
    }

    async fn initiate(
        &self,
        invoice_id: Uuid,
        amount_minor: i64,
        currency: &str,
        return_url: Option<&str>,
    ) -> Result<ProviderSession, PaymentError> {
        let request = CreateSessionRequest {
            amount_minor,
            currency,
            invoice_id,
            return_url,
        };

        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.config.base_path))
            .header("Authorization", format!("Bearer {}", self.config.secret_key))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let session: CheckoutSession = decode_response(response).await?;

        Ok(ProviderSession {
            session_ref: session.id,
            redirect_url: session.url,
            client_prompt: None,
        })
    }

    async fn verify(
        &self,
        session_ref: &str,
        _proof: &JsonValue,
    ) -> Result<PaymentAttemptResult, PaymentError> {
        let response = self
            .http
            .get(format!(
                "{}/v1/checkout/sessions/{}",
                self.config.base_path, session_ref
            ))
            .header("Authorization", format!("Bearer {}", self.config.secret_key))
            .send()
            .await
            .map_err(transport_error)?;
        let session: CheckoutSession = decode_response(response).await?;

        let success = session.status == "completed" && session.payment.is_some();
        let (txn_ref, amount_minor, currency) = match session.payment {
            Some(p) => (p.id, p.amount_minor, p.currency),
            None => (String::new(), 0, String::new()),
        };

        Ok(PaymentAttemptResult {
            gateway: Gateway::CardHosted,
            success,
            amount_minor,
            currency,
            provider_txn_ref: txn_ref,
            session_ref: Some(session.id),
            invoice_id: session.invoice_id,
            raw_status: session.status,
        })
    }

    fn parse_webhook(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<PaymentAttemptResult, PaymentError> {
        let signature =
            header_str(headers, SIGNATURE_HEADER).ok_or(PaymentError::SignatureMismatch)?;
        verify_webhook_signature(body, signature, &self.config.webhook_secret)?;

        let event: WebhookEvent = serde_json::from_slice(body)
            .map_err(|e| PaymentError::InvalidRequest(format!("malformed webhook: {e}")))?;

        Ok(PaymentAttemptResult {
            gateway: Gateway::CardHosted,
            success: event.event_type == "payment.succeeded",
            amount_minor: event.data.amount_minor,
            currency: event.data.currency,
            provider_txn_ref: event.data.payment_id,
            session_ref: Some(event.data.session_id),
            invoice_id: event.data.invoice_id,
            raw_status: event.data.status,
        })
    }

    async fn refund(
        &self,
        provider_txn_ref: &str,
        amount_minor: i64,
        reason: Option<&str>,
    ) -> Result<RefundOutcome, PaymentError> {
        let request = CreateRefundRequest {
            payment_id: provider_txn_ref,
            amount_minor,
            reason,
        };

        let response = self
            .http
            .post(format!("{}/v1/refunds", self.config.base_path))
            .header("Authorization", format!("Bearer {}", self.config.secret_key))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let refund: RefundResponse = decode_response(response).await?;

        Ok(RefundOutcome {
            success: matches!(refund.status.as_str(), "succeeded" | "pending"),
            provider_refund_ref: Some(refund.id),
            raw_status: refund.status,
        })
    }
}
