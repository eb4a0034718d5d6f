//! Mock gateway for development and testing.
//!
//! Stands in for any of the three providers without network access. Follows
//! the usual trigger convention: a `fail_` prefix (on a session ref, a proof
//! flag, or a transaction ref) makes the corresponding operation decline.

use async_trait::async_trait;
use axum::http::HeaderMap;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{header_str, verify_hmac_hex, GatewayAdapter};
use crate::error::PaymentError;
use crate::models::{
    AmountPolicy, Gateway, PaymentAttemptResult, ProviderSession, RefundOutcome,
};

pub const SIGNATURE_HEADER: &str = "x-mock-signature";
pub const DEFAULT_WEBHOOK_SECRET: &str = "mock-webhook-secret";

struct MockSession {
    invoice_id: Uuid,
    amount_minor: i64,
    currency: String,
}

pub struct MockGateway {
    gateway: Gateway,
    policy: AmountPolicy,
    ttl: chrono::Duration,
    webhook_secret: String,
    sessions: DashMap<String, MockSession>,
}

impl MockGateway {
    pub fn new(gateway: Gateway, policy: AmountPolicy) -> Self {
        Self {
            gateway,
            policy,
            ttl: chrono::Duration::minutes(30),
            webhook_secret: DEFAULT_WEBHOOK_SECRET.to_string(),
            sessions: DashMap::new(),
        }
    }

    pub fn with_session_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = secret.into();
        self
    }

    /// The transaction ref `verify` reports for a session unless the proof
    /// overrides it.
    pub fn txn_ref_for(session_ref: &str) -> String {
        format!("mock_txn_{session_ref}")
    }
}

#[derive(Debug, Default, Deserialize)]
struct MockProof {
    #[serde(default)]
    txn_ref: Option<String>,
    #[serde(default)]
    amount_minor: Option<i64>,
    #[serde(default)]
    fail: bool,
}

#[derive(Debug, Deserialize)]
struct MockWebhook {
    session_ref: String,
    txn_ref: String,
    amount_minor: i64,
    currency: String,
    #[serde(default)]
    invoice_id: Option<Uuid>,
    status: String,
}

#[async_trait]
impl GatewayAdapter for MockGateway {
    fn gateway(&self) -> Gateway {
        self.gateway
    }

    fn amount_policy(&self) -> AmountPolicy {
        self.policy
    }

    fn session_ttl(&self) -> chrono::Duration {
        self.ttl
    }

    async fn initiate(
        &self,
        invoice_id: Uuid,
        amount_minor: i64,
        currency: &str,
        _return_url: Option<&str>,
    ) -> Result<ProviderSession, PaymentError> {
        let session_ref = format!("mock_sess_{}", Uuid::new_v4().simple());
        self.sessions.insert(
            session_ref.clone(),
            MockSession {
                invoice_id,
                amount_minor,
                currency: currency.to_string(),
            },
        );
        Ok(ProviderSession {
            redirect_url: Some(format!("https://checkout.mock.example/{session_ref}")),
            client_prompt: None,
            session_ref,
        })
    }

    async fn verify(
        &self,
        session_ref: &str,
        proof: &JsonValue,
    ) -> Result<PaymentAttemptResult, PaymentError> {
        let proof: MockProof = serde_json::from_value(proof.clone()).unwrap_or_default();
        let session = self
            .sessions
            .get(session_ref)
            .ok_or_else(|| PaymentError::InvalidRequest("unknown mock session".to_string()))?;

        let failed = proof.fail || session_ref.starts_with("fail_");
        Ok(PaymentAttemptResult {
            gateway: self.gateway,
            success: !failed,
            amount_minor: proof.amount_minor.unwrap_or(session.amount_minor),
            currency: session.currency.clone(),
            provider_txn_ref: proof
                .txn_ref
                .unwrap_or_else(|| Self::txn_ref_for(session_ref)),
            session_ref: Some(session_ref.to_string()),
            invoice_id: Some(session.invoice_id),
            raw_status: if failed { "failed" } else { "succeeded" }.to_string(),
        })
    }

    fn parse_webhook(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<PaymentAttemptResult, PaymentError> {
        let signature =
            header_str(headers, SIGNATURE_HEADER).ok_or(PaymentError::SignatureMismatch)?;
        if !verify_hmac_hex(&self.webhook_secret, body, signature) {
            return Err(PaymentError::SignatureMismatch);
        }

        let webhook: MockWebhook = serde_json::from_slice(body)
            .map_err(|e| PaymentError::InvalidRequest(format!("malformed webhook: {e}")))?;

        // The webhook may name an invoice directly (out-of-band payments) or
        // rely on the session we recorded at initiation.
        let invoice_id = webhook.invoice_id.or_else(|| {
            self.sessions
                .get(&webhook.session_ref)
                .map(|s| s.invoice_id)
        });

        Ok(PaymentAttemptResult {
            gateway: self.gateway,
            success: webhook.status == "success",
            amount_minor: webhook.amount_minor,
            currency: webhook.currency,
            provider_txn_ref: webhook.txn_ref,
            session_ref: Some(webhook.session_ref),
            invoice_id,
            raw_status: webhook.status,
        })
    }

    async fn refund(
        &self,
        provider_txn_ref: &str,
        _amount_minor: i64,
        _reason: Option<&str>,
    ) -> Result<RefundOutcome, PaymentError> {
        if provider_txn_ref.starts_with("fail_") {
            return Ok(RefundOutcome {
                success: false,
                provider_refund_ref: None,
                raw_status: "declined".to_string(),
            });
        }
        Ok(RefundOutcome {
            success: true,
            provider_refund_ref: Some(format!("mock_re_{}", Uuid::new_v4().simple())),
            raw_status: "succeeded".to_string(),
        })
    }
}
