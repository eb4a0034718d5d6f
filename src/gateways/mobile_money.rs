//! Mobile-money callback network.
//!
//! `initiate` fires a handset push request; the payer approves on-device and
//! the network settles asynchronously, reporting through a signed callback.
//! The network may settle less than requested (wallet balance), so this is
//! the partial-accepting gateway: the ledger records the provider amount.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{
    decode_response, header_str, http_client, transport_error, verify_hmac_hex, GatewayAdapter,
};
use crate::config::MobileMoneyConfig;
use crate::error::PaymentError;
use crate::models::{
    AmountPolicy, Gateway, PaymentAttemptResult, ProviderSession, RefundOutcome,
};

pub const SIGNATURE_HEADER: &str = "x-callback-signature";

pub struct MobileMoneyGateway {
    config: Arc<MobileMoneyConfig>,
    http: Client,
}

impl MobileMoneyGateway {
    pub fn new(config: MobileMoneyConfig) -> Result<Self, PaymentError> {
        Ok(Self {
            config: Arc::new(config),
            http: http_client()?,
        })
    }

    /// API password: `base64(shortcode + passkey + timestamp)`.
    fn api_password(&self, timestamp: &str) -> String {
        BASE64.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }
}

fn request_timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    shortcode: &'a str,
    password: String,
    timestamp: String,
    amount_minor: i64,
    currency: &'a str,
    account_reference: Uuid,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    request_ref: String,
    response_code: String,
    #[serde(default)]
    response_description: String,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    shortcode: &'a str,
    password: String,
    timestamp: String,
    request_ref: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    result_code: i64,
    #[serde(default)]
    result_desc: String,
    #[serde(default)]
    receipt_ref: Option<String>,
    #[serde(default)]
    amount_minor: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    account_reference: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct Callback {
    request_ref: String,
    result_code: i64,
    #[serde(default)]
    result_desc: String,
    #[serde(default)]
    receipt_ref: Option<String>,
    #[serde(default)]
    amount_minor: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    account_reference: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct ReversalRequest<'a> {
    shortcode: &'a str,
    receipt_ref: &'a str,
    amount_minor: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    remarks: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ReversalResponse {
    #[serde(default)]
    reversal_ref: Option<String>,
    response_code: String,
    #[serde(default)]
    response_description: String,
}

#[async_trait]
impl GatewayAdapter for MobileMoneyGateway {
    fn gateway(&self) -> Gateway {
        Gateway::MobileMoney
    }

    fn amount_policy(&self) -> AmountPolicy {
        AmountPolicy::AcceptPartial
    }

    fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.session_ttl_minutes)
    }

    async fn initiate(
        &self,
        invoice_id: Uuid,
        amount_minor: i64,
        currency: &str,
        _return_url: Option<&str>,
    ) -> Result<ProviderSession, PaymentError> {
        let timestamp = request_timestamp();
        let request = PushRequest {
            shortcode: &self.config.shortcode,
            password: self.api_password(&timestamp),
            timestamp,
            amount_minor,
            currency,
            account_reference: invoice_id,
            description: "invoice payment",
        };

        let response = self
            .http
            .post(format!("{}/v1/push/request", self.config.base_path))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let push: PushResponse = decode_response(response).await?;

        if push.response_code != "0" {
            return Err(PaymentError::InvalidRequest(format!(
                "push request rejected: {}",
                push.response_description
            )));
        }

        Ok(ProviderSession {
            session_ref: push.request_ref,
            redirect_url: None,
            client_prompt: Some("approve the payment prompt on your handset".to_string()),
        })
    }

    async fn verify(
        &self,
        session_ref: &str,
        _proof: &JsonValue,
    ) -> Result<PaymentAttemptResult, PaymentError> {
        let timestamp = request_timestamp();
        let request = QueryRequest {
            shortcode: &self.config.shortcode,
            password: self.api_password(&timestamp),
            timestamp,
            request_ref: session_ref,
        };

        let response = self
            .http
            .post(format!("{}/v1/push/query", self.config.base_path))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let query: QueryResponse = decode_response(response).await?;

        Ok(PaymentAttemptResult {
            gateway: Gateway::MobileMoney,
            success: query.result_code == 0,
            amount_minor: query.amount_minor.unwrap_or(0),
            currency: query.currency.unwrap_or_default(),
            provider_txn_ref: query.receipt_ref.unwrap_or_default(),
            session_ref: Some(session_ref.to_string()),
            invoice_id: query.account_reference,
            raw_status: format!("{}:{}", query.result_code, query.result_desc),
        })
    }

    fn parse_webhook(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<PaymentAttemptResult, PaymentError> {
        let signature =
            header_str(headers, SIGNATURE_HEADER).ok_or(PaymentError::SignatureMismatch)?;
        if !verify_hmac_hex(&self.config.callback_secret, body, signature) {
            return Err(PaymentError::SignatureMismatch);
        }

        let callback: Callback = serde_json::from_slice(body)
            .map_err(|e| PaymentError::InvalidRequest(format!("malformed callback: {e}")))?;

        Ok(PaymentAttemptResult {
            gateway: Gateway::MobileMoney,
            success: callback.result_code == 0,
            amount_minor: callback.amount_minor.unwrap_or(0),
            currency: callback.currency.unwrap_or_default(),
            provider_txn_ref: callback.receipt_ref.unwrap_or_default(),
            session_ref: Some(callback.request_ref),
            invoice_id: callback.account_reference,
            raw_status: format!("{}:{}", callback.result_code, callback.result_desc),
        })
    }

    async fn refund(
        &self,
        provider_txn_ref: &str,
        amount_minor: i64,
        reason: Option<&str>,
    ) -> Result<RefundOutcome, PaymentError> {
        let request = ReversalRequest {
            shortcode: &self.config.shortcode,
            receipt_ref: provider_txn_ref,
            amount_minor,
            remarks: reason,
        };

        let response = self
            .http
            .post(format!("{}/v1/reversal", self.config.base_path))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let reversal: ReversalResponse = decode_response(response).await?;

        Ok(RefundOutcome {
            success: reversal.response_code == "0",
            provider_refund_ref: reversal.reversal_ref,
            raw_status: reversal.response_description,
        })
    }
}
