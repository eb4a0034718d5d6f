//! Order/signature gateway.
//!
//! `initiate` registers an order; the client SDK collects the payment and
//! hands back a `(payment_ref, signature)` pair, where the signature is an
//! HMAC the provider computes over `order_ref|payment_ref|amount`. Verify
//! recomputes it with the shared secret and rejects on any byte difference.
//! Webhooks carry a plain body HMAC header. Exact-amount gateway.

use std::sync::Arc;

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
use crate::config::OrderSignatureConfig;
use crate::error::PaymentError;
use crate::models::{
    AmountPolicy, Gateway, PaymentAttemptResult, ProviderSession, RefundOutcome,
};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub struct OrderSignatureGateway {
    config: Arc<OrderSignatureConfig>,
    http: Client,
}

impl OrderSignatureGateway {
    pub fn new(config: OrderSignatureConfig) -> Result<Self, PaymentError> {
        Ok(Self {
            config: Arc::new(config),
            http: http_client()?,
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    amount_minor: i64,
    currency: &'a str,
    receipt: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Order {
    id: String,
    amount_minor: i64,
    currency: String,
    #[serde(default)]
    receipt: Option<Uuid>,
    status: String,
}

/// Client-supplied proof for `verify`.
#[derive(Debug, Deserialize)]
struct VerifyProof {
    payment_ref: String,
    signature: String,
    amount_minor: i64,
}

#[derive(Debug, Serialize)]
struct CreateRefundRequest<'a> {
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
    event: String,
    payload: WebhookPayload,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    payment: WebhookPayment,
}

#[derive(Debug, Deserialize)]
struct WebhookPayment {
    id: String,
    order_id: String,
    amount_minor: i64,
    currency: String,
    #[serde(default)]
    invoice_id: Option<Uuid>,
    status: String,
}

/// The message the provider signs when handing the payment back to the
/// client: `order_ref|payment_ref|amount`.
pub fn proof_message(order_ref: &str, payment_ref: &str, amount_minor: i64) -> String {
    format!("{order_ref}|{payment_ref}|{amount_minor}")
}

/// Compute a proof signature. Used by tests standing in for the provider.
pub fn sign_proof(secret: &str, order_ref: &str, payment_ref: &str, amount_minor: i64) -> String {
    sign_hmac_hex(secret, proof_message(order_ref, payment_ref, amount_minor).as_bytes())
}

#[async_trait]
impl GatewayAdapter for OrderSignatureGateway {
    fn gateway(&self) -> Gateway {
        Gateway::OrderSignature
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
        let request = CreateOrderRequest {
            amount_minor,
            currency,
            receipt: invoice_id,
            return_url,
        };

        let response = self
            .http
            .post(format!("{}/v1/orders", self.config.base_path))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let order: Order = decode_response(response).await?;

        Ok(ProviderSession {
            session_ref: order.id,
            redirect_url: None,
            // The client SDK needs the public key id to open the payment
            // sheet against this order.
            client_prompt: Some(self.config.key_id.clone()),
        })
    }

    async fn verify(
        &self,
        session_ref: &str,
        proof: &JsonValue,
    ) -> Result<PaymentAttemptResult, PaymentError> {
        let proof: VerifyProof = serde_json::from_value(proof.clone())
            .map_err(|e| PaymentError::InvalidRequest(format!("malformed proof: {e}")))?;

        let message = proof_message(session_ref, &proof.payment_ref, proof.amount_minor);
        if !verify_hmac_hex(&self.config.key_secret, message.as_bytes(), &proof.signature) {
            return Err(PaymentError::SignatureMismatch);
        }

        // The signature pins (order, payment, amount); the order lookup
        // supplies currency and invoice reference and cross-checks the
        // amount actually registered.
        let response = self
            .http
            .get(format!("{}/v1/orders/{}", self.config.base_path, session_ref))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .send()
            .await
            .map_err(transport_error)?;
        let order: Order = decode_response(response).await?;

        if order.amount_minor != proof.amount_minor {
            return Err(PaymentError::AmountMismatch {
                confirmed_minor: proof.amount_minor,
                requested_minor: order.amount_minor,
            });
        }

        Ok(PaymentAttemptResult {
            gateway: Gateway::OrderSignature,
            success: true,
            amount_minor: proof.amount_minor,
            currency: order.currency,
            provider_txn_ref: proof.payment_ref,
            session_ref: Some(session_ref.to_string()),
            invoice_id: order.receipt,
            raw_status: order.status,
        })
    }

    fn parse_webhook(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<PaymentAttemptResult, PaymentError> {
        let signature =
            header_str(headers, SIGNATURE_HEADER).ok_or(PaymentError::SignatureMismatch)?;
        if !verify_hmac_hex(&self.config.webhook_secret, body, signature) {
            return Err(PaymentError::SignatureMismatch);
        }

        let event: WebhookEvent = serde_json::from_slice(body)
            .map_err(|e| PaymentError::InvalidRequest(format!("malformed webhook: {e}")))?;
        let payment = event.payload.payment;

        Ok(PaymentAttemptResult {
            gateway: Gateway::OrderSignature,
            success: event.event == "payment.captured",
            amount_minor: payment.amount_minor,
            currency: payment.currency,
            provider_txn_ref: payment.id,
            session_ref: Some(payment.order_id),
            invoice_id: payment.invoice_id,
            raw_status: payment.status,
        })
    }

    async fn refund(
        &self,
        provider_txn_ref: &str,
        amount_minor: i64,
        reason: Option<&str>,
    ) -> Result<RefundOutcome, PaymentError> {
        let request = CreateRefundRequest {
            amount_minor,
            reason,
        };

        let response = self
            .http
            .post(format!(
                "{}/v1/payments/{}/refunds",
                self.config.base_path, provider_txn_ref
            ))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let refund: RefundResponse = decode_response(response).await?;

        Ok(RefundOutcome {
            success: matches!(refund.status.as_str(), "processed" | "pending"),
            provider_refund_ref: Some(refund.id),
            raw_status: refund.status,
        })
    }
}
