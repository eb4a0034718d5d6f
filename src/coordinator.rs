//! Payment coordinator.
//!
//! Orchestrates initiate → verify/webhook → reconcile → publish and owns the
//! intent state machine (`created → awaiting_confirmation →
//! {verified|failed|expired}`). Confirmation is invoked concurrently from at
//! least two triggers (client verify and provider webhook, each multiplied
//! by provider retries); the idempotency store's reserve/commit cycle is the
//! only synchronization used for "same event, many deliveries".

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::error::PaymentError;
use crate::events::{
    EventEnvelope, EventPublisher, IntentExpiredPayload, PaymentConfirmedPayload,
    PaymentFailedPayload, PaymentRefundedPayload, SUBJECT_PREFIX,
};
use crate::gateways::GatewayAdapter;
use crate::idempotency::{confirmation_key, IdempotencyStore, Reservation};
use crate::metrics::Metrics;
use crate::models::{
    AmountPolicy, ConfirmOutcome, ConfirmStatus, Gateway, InitiatePaymentRequest, IntentStatus,
    PaymentAttemptResult, PaymentIntent, ProviderSession, RefundPaymentRequest, RefundRequest,
};
use crate::reconciler::{LedgerReconciler, PaymentMeta};
use crate::store::{LedgerStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmSource {
    ClientVerify,
    Webhook,
}

impl ConfirmSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmSource::ClientVerify => "client-verify",
            ConfirmSource::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Attempts per provider call; only `GatewayUnavailable` is retried.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    /// How long a caller waits on an in-flight reservation before giving
    /// up. Matches the idempotency lease.
    pub idempotency_wait: Duration,
    pub poll_interval: Duration,
    pub allow_overpayment: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            idempotency_wait: Duration::from_secs(60),
            poll_interval: Duration::from_millis(25),
            allow_overpayment: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            retry_attempts: cfg.gateway_retry_attempts,
            retry_backoff: cfg.gateway_retry_backoff,
            idempotency_wait: cfg.idempotency_lease,
            poll_interval: Duration::from_millis(25),
            allow_overpayment: cfg.allow_overpayment,
        }
    }
}

pub struct PaymentCoordinator {
    store: Arc<dyn LedgerStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    reconciler: Arc<LedgerReconciler>,
    publisher: Arc<dyn EventPublisher>,
    adapters: HashMap<Gateway, Arc<dyn GatewayAdapter>>,
    metrics: Arc<Metrics>,
    cfg: CoordinatorConfig,
}

impl PaymentCoordinator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        reconciler: Arc<LedgerReconciler>,
        publisher: Arc<dyn EventPublisher>,
        adapters: Vec<Arc<dyn GatewayAdapter>>,
        metrics: Arc<Metrics>,
        cfg: CoordinatorConfig,
    ) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|a| (a.gateway(), a))
            .collect();
        Self {
            store,
            idempotency,
            reconciler,
            publisher,
            adapters,
            metrics,
            cfg,
        }
    }

    fn adapter(&self, gateway: Gateway) -> Result<&Arc<dyn GatewayAdapter>, PaymentError> {
        self.adapters
            .get(&gateway)
            .ok_or_else(|| PaymentError::InvalidRequest(format!("unsupported gateway: {gateway}")))
    }

    /// Retry `call` with exponential backoff, for `GatewayUnavailable` only.
    /// Integrity and business failures are terminal and propagate at once.
    async fn with_retry<T, F, Fut>(
        &self,
        op: &str,
        gateway: Gateway,
        mut call: F,
    ) -> Result<T, PaymentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PaymentError>>,
    {
        let mut delay = self.cfg.retry_backoff;
        let mut attempt = 1u32;
        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt < self.cfg.retry_attempts => {
                    tracing::warn!(
                        gateway = %gateway,
                        op,
                        attempt,
                        error = %e,
                        "provider call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // ------------------------------------------------------------------
    // initiate
    // ------------------------------------------------------------------

    pub async fn initiate(
        &self,
        req: InitiatePaymentRequest,
    ) -> Result<(PaymentIntent, ProviderSession), PaymentError> {
        let adapter = self.adapter(req.gateway)?;

        let invoice = self
            .store
            .invoice(req.invoice_id)
            .await?
            .ok_or(PaymentError::NotFound("invoice"))?;

        if invoice.status == crate::models::InvoiceStatus::Void {
            return Err(PaymentError::InvalidRequest("invoice is void".to_string()));
        }
        let balance = invoice.balance_due_minor();
        if balance <= 0 {
            return Err(PaymentError::InvalidRequest(
                "invoice is already settled".to_string(),
            ));
        }

        let amount_minor = req.amount_minor.unwrap_or(balance);
        if amount_minor <= 0 {
            return Err(PaymentError::InvalidRequest(
                "amount_minor must be positive".to_string(),
            ));
        }
        if amount_minor > balance && !self.cfg.allow_overpayment {
            return Err(PaymentError::OverpaymentNotAllowed { amount_minor });
        }

        if self
            .store
            .active_intent(req.invoice_id, req.gateway)
            .await?
            .is_some()
        {
            return Err(PaymentError::DuplicateActiveIntent);
        }

        let mut intent =
            PaymentIntent::new(req.invoice_id, req.gateway, amount_minor, &invoice.currency);
        // The store enforces the one-active-intent invariant; losing the
        // insert race maps back to the same error the pre-check produces.
        self.store.insert_intent(&intent).await.map_err(|e| match e {
            StoreError::Conflict(_) => PaymentError::DuplicateActiveIntent,
            other => PaymentError::Store(other),
        })?;

        let session = match self
            .with_retry("initiate", req.gateway, || {
                adapter.initiate(
                    req.invoice_id,
                    amount_minor,
                    &invoice.currency,
                    req.return_url.as_deref(),
                )
            })
            .await
        {
            Ok(session) => session,
            Err(e) => {
                intent.status = IntentStatus::Failed;
                intent.updated_at = Utc::now();
                if let Err(update_err) = self.store.update_intent(&intent).await {
                    tracing::error!(
                        intent_id = %intent.id,
                        error = %update_err,
                        "failed to mark intent failed after initiate error"
                    );
                }
                return Err(e);
            }
        };

        intent.status = IntentStatus::AwaitingConfirmation;
        intent.provider_session_ref = Some(session.session_ref.clone());
        intent.updated_at = Utc::now();
        self.store.update_intent(&intent).await?;

        tracing::info!(
            intent_id = %intent.id,
            invoice_id = %req.invoice_id,
            gateway = %req.gateway,
            amount_minor,
            session_ref = %session.session_ref,
            "payment intent awaiting confirmation"
        );

        Ok((intent, session))
    }

    // ------------------------------------------------------------------
    // confirm (client verify + webhook)
    // ------------------------------------------------------------------

    pub async fn verify(
        &self,
        gateway: Gateway,
        session_ref: &str,
        proof: &JsonValue,
    ) -> Result<ConfirmOutcome, PaymentError> {
        let adapter = self.adapter(gateway)?;
        let attempt = self
            .with_retry("verify", gateway, || adapter.verify(session_ref, proof))
            .await
            .inspect_err(|e| self.note_integrity_failure(gateway, e))?;
        self.confirm(attempt, ConfirmSource::ClientVerify).await
    }

    pub async fn handle_webhook(
        &self,
        gateway: Gateway,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<ConfirmOutcome, PaymentError> {
        let adapter = self.adapter(gateway)?;
        let attempt = match adapter.parse_webhook(body, headers) {
            Ok(attempt) => attempt,
            Err(e) => {
                self.note_integrity_failure(gateway, &e);
                self.metrics
                    .webhooks_received_total
                    .with_label_values(&[gateway.as_str(), "rejected"])
                    .inc();
                return Err(e);
            }
        };

        let result = self.confirm(attempt, ConfirmSource::Webhook).await;
        let outcome_label = if result.is_ok() { "processed" } else { "rejected" };
        self.metrics
            .webhooks_received_total
            .with_label_values(&[gateway.as_str(), outcome_label])
            .inc();
        result
    }

    /// Process one normalized confirmation event. Safe under N-way
    /// concurrent delivery of the same transaction: exactly one caller
    /// reconciles, everyone observes the identical outcome.
    pub async fn confirm(
        &self,
        attempt: PaymentAttemptResult,
        source: ConfirmSource,
    ) -> Result<ConfirmOutcome, PaymentError> {
        let started = Instant::now();
        let gateway = attempt.gateway;
        let key = self.key_for(&attempt);

        let wait_started = Instant::now();
        loop {
            match self.idempotency.check_and_reserve(&key).await? {
                Reservation::Completed(outcome) => {
                    self.metrics
                        .idempotent_replays_total
                        .with_label_values(&[gateway.as_str()])
                        .inc();
                    tracing::info!(
                        gateway = %gateway,
                        source = source.as_str(),
                        provider_txn_ref = %attempt.provider_txn_ref,
                        "confirmation already processed, replaying snapshot"
                    );
                    return Ok(outcome);
                }
                Reservation::New => break,
                Reservation::InFlight => {
                    if wait_started.elapsed() >= self.cfg.idempotency_wait {
                        return Err(PaymentError::IdempotencyConflict);
                    }
                    tokio::time::sleep(self.cfg.poll_interval).await;
                }
            }
        }

        match self.process_confirmation(&attempt, source).await {
            Ok(outcome) => {
                self.idempotency.commit(&key, &outcome).await?;
                let result_label = match outcome.status {
                    ConfirmStatus::Confirmed => "confirmed",
                    ConfirmStatus::Declined => "declined",
                };
                self.metrics
                    .payments_confirmed_total
                    .with_label_values(&[gateway.as_str(), result_label])
                    .inc();
                self.metrics
                    .confirm_duration_seconds
                    .with_label_values(&[gateway.as_str()])
                    .observe(started.elapsed().as_secs_f64());

                match outcome.status {
                    ConfirmStatus::Confirmed => {
                        if let (Some(payment), Some(invoice_status), Some(balance)) = (
                            outcome.payment.as_ref(),
                            outcome.invoice_status,
                            outcome.balance_due_minor,
                        ) {
                            self.publish_event(
                                "payment.confirmed",
                                PaymentConfirmedPayload {
                                    payment_id: payment.id,
                                    invoice_id: payment.invoice_id,
                                    payment_intent_id: payment.payment_intent_id,
                                    gateway,
                                    amount_minor: payment.amount_minor,
                                    currency: payment.currency.clone(),
                                    provider_txn_ref: payment.provider_txn_ref.clone(),
                                    invoice_status,
                                    balance_due_minor: balance,
                                    out_of_band: outcome.out_of_band,
                                },
                            );
                        }
                    }
                    ConfirmStatus::Declined => {
                        self.publish_event(
                            "payment.failed",
                            PaymentFailedPayload {
                                invoice_id: outcome.invoice_id,
                                payment_intent_id: outcome.payment_intent_id,
                                gateway,
                                provider_txn_ref: attempt.provider_txn_ref.clone(),
                                raw_status: attempt.raw_status.clone(),
                            },
                        );
                    }
                }

                Ok(outcome)
            }
            Err(e) => {
                self.note_integrity_failure(gateway, &e);
                // No reconciliation outcome exists to replay; free the key
                // so a later (re)delivery can be processed safely.
                if let Err(release_err) = self.idempotency.release(&key).await {
                    tracing::error!(key = %key, error = %release_err, "failed to release reservation");
                }
                Err(e)
            }
        }
    }

    async fn process_confirmation(
        &self,
        attempt: &PaymentAttemptResult,
        source: ConfirmSource,
    ) -> Result<ConfirmOutcome, PaymentError> {
        let adapter = self.adapter(attempt.gateway)?;

        let intent = match attempt.session_ref.as_deref() {
            Some(session_ref) => {
                self.store
                    .intent_by_session(attempt.gateway, session_ref)
                    .await?
            }
            None => None,
        };

        match intent {
            Some(mut intent) if !intent.status.is_terminal() => {
                if !attempt.success {
                    intent.status = IntentStatus::Failed;
                    intent.updated_at = Utc::now();
                    self.store.update_intent(&intent).await?;
                    tracing::info!(
                        intent_id = %intent.id,
                        gateway = %attempt.gateway,
                        source = source.as_str(),
                        raw_status = %attempt.raw_status,
                        "provider declined payment"
                    );
                    return Ok(ConfirmOutcome {
                        status: ConfirmStatus::Declined,
                        gateway: attempt.gateway,
                        provider_txn_ref: attempt.provider_txn_ref.clone(),
                        invoice_id: Some(intent.invoice_id),
                        payment_intent_id: Some(intent.id),
                        payment: None,
                        invoice_status: None,
                        balance_due_minor: None,
                        out_of_band: false,
                    });
                }

                if adapter.amount_policy() == AmountPolicy::ExactMatch
                    && attempt.amount_minor != intent.requested_minor
                {
                    return Err(PaymentError::AmountMismatch {
                        confirmed_minor: attempt.amount_minor,
                        requested_minor: intent.requested_minor,
                    });
                }

                // Partial-accepting gateways record the provider amount,
                // not the requested one.
                let (payment, invoice) = self
                    .reconciler
                    .apply_payment(
                        intent.invoice_id,
                        attempt.amount_minor,
                        &attempt.currency,
                        PaymentMeta {
                            gateway: attempt.gateway,
                            provider_txn_ref: attempt.provider_txn_ref.clone(),
                            payment_intent_id: Some(intent.id),
                        },
                    )
                    .await?;

                intent.status = IntentStatus::Verified;
                intent.updated_at = Utc::now();
                self.store.update_intent(&intent).await?;

                tracing::info!(
                    intent_id = %intent.id,
                    payment_id = %payment.id,
                    invoice_id = %invoice.id,
                    gateway = %attempt.gateway,
                    source = source.as_str(),
                    amount_minor = payment.amount_minor,
                    invoice_status = ?invoice.status,
                    "payment reconciled"
                );

                Ok(ConfirmOutcome {
                    status: ConfirmStatus::Confirmed,
                    gateway: attempt.gateway,
                    provider_txn_ref: attempt.provider_txn_ref.clone(),
                    invoice_id: Some(invoice.id),
                    payment_intent_id: Some(intent.id),
                    invoice_status: Some(invoice.status),
                    balance_due_minor: Some(invoice.balance_due_minor()),
                    payment: Some(payment),
                    out_of_band: false,
                })
            }

            // Expired or otherwise terminal intent, or no intent at all.
            // Real money may still be attached: accept it as an out-of-band
            // payment rather than silently losing it, provided the signature
            // already passed (the adapter enforced that) and the ledger
            // checks below hold.
            other => {
                let intent_id = other.as_ref().map(|i| i.id);
                let invoice_from_intent = other.as_ref().map(|i| i.invoice_id);

                if !attempt.success {
                    return Ok(ConfirmOutcome {
                        status: ConfirmStatus::Declined,
                        gateway: attempt.gateway,
                        provider_txn_ref: attempt.provider_txn_ref.clone(),
                        invoice_id: attempt.invoice_id.or(invoice_from_intent),
                        payment_intent_id: intent_id,
                        payment: None,
                        invoice_status: None,
                        balance_due_minor: None,
                        out_of_band: false,
                    });
                }

                if attempt.provider_txn_ref.is_empty() {
                    return Err(PaymentError::InvalidRequest(
                        "missing provider transaction reference".to_string(),
                    ));
                }
                let invoice_id = attempt
                    .invoice_id
                    .or(invoice_from_intent)
                    .ok_or_else(|| {
                        PaymentError::InvalidRequest(
                            "no invoice reference for out-of-band payment".to_string(),
                        )
                    })?;

                tracing::warn!(
                    gateway = %attempt.gateway,
                    source = source.as_str(),
                    provider_txn_ref = %attempt.provider_txn_ref,
                    invoice_id = %invoice_id,
                    intent_id = ?intent_id,
                    "accepting out-of-band payment for expired or unknown session"
                );

                let (payment, invoice) = self
                    .reconciler
                    .apply_payment(
                        invoice_id,
                        attempt.amount_minor,
                        &attempt.currency,
                        PaymentMeta {
                            gateway: attempt.gateway,
                            provider_txn_ref: attempt.provider_txn_ref.clone(),
                            payment_intent_id: None,
                        },
                    )
                    .await?;

                Ok(ConfirmOutcome {
                    status: ConfirmStatus::Confirmed,
                    gateway: attempt.gateway,
                    provider_txn_ref: attempt.provider_txn_ref.clone(),
                    invoice_id: Some(invoice.id),
                    payment_intent_id: intent_id,
                    invoice_status: Some(invoice.status),
                    balance_due_minor: Some(invoice.balance_due_minor()),
                    payment: Some(payment),
                    out_of_band: true,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // refund
    // ------------------------------------------------------------------

    pub async fn refund(
        &self,
        payment_id: Uuid,
        req: RefundPaymentRequest,
    ) -> Result<RefundRequest, PaymentError> {
        if req.amount_minor <= 0 {
            return Err(PaymentError::InvalidRequest(
                "amount_minor must be positive".to_string(),
            ));
        }

        let (payment, remaining) = self.reconciler.refundable_remainder(payment_id).await?;
        if req.amount_minor > remaining {
            self.metrics
                .refunds_total
                .with_label_values(&["rejected"])
                .inc();
            return Err(PaymentError::RefundExceedsPayment {
                requested_minor: req.amount_minor,
                remaining_minor: remaining,
            });
        }

        let adapter = self.adapter(payment.gateway)?;
        let outcome = self
            .with_retry("refund", payment.gateway, || {
                adapter.refund(
                    &payment.provider_txn_ref,
                    req.amount_minor,
                    req.reason.as_deref(),
                )
            })
            .await?;

        if !outcome.success {
            tracing::warn!(
                payment_id = %payment_id,
                gateway = %payment.gateway,
                raw_status = %outcome.raw_status,
                "provider declined refund"
            );
            self.metrics
                .refunds_total
                .with_label_values(&["failed"])
                .inc();
            return self
                .reconciler
                .record_failed_refund(payment_id, req.amount_minor, req.reason)
                .await;
        }

        let (refund, _payment, invoice) = self
            .reconciler
            .apply_refund(
                payment_id,
                req.amount_minor,
                req.reason,
                outcome.provider_refund_ref,
            )
            .await?;

        self.metrics
            .refunds_total
            .with_label_values(&["completed"])
            .inc();
        tracing::info!(
            refund_id = %refund.id,
            payment_id = %payment_id,
            invoice_id = %invoice.id,
            amount_minor = refund.amount_minor,
            invoice_status = ?invoice.status,
            "refund reconciled"
        );

        self.publish_event(
            "payment.refunded",
            PaymentRefundedPayload {
                refund_id: refund.id,
                payment_id,
                invoice_id: invoice.id,
                amount_minor: refund.amount_minor,
                invoice_status: invoice.status,
                balance_due_minor: invoice.balance_due_minor(),
            },
        );

        Ok(refund)
    }

    // ------------------------------------------------------------------
    // expiry sweep
    // ------------------------------------------------------------------

    /// Move awaiting intents past their gateway's TTL to `expired` so stale
    /// sessions cannot be confirmed later. Returns how many were expired.
    pub async fn expire_stale_intents(&self) -> Result<usize, PaymentError> {
        let mut total = 0;
        for adapter in self.adapters.values() {
            let gateway = adapter.gateway();
            let cutoff = Utc::now() - adapter.session_ttl();
            let expired = self.store.expire_intents_before(gateway, cutoff).await?;
            for intent in &expired {
                self.metrics
                    .intents_expired_total
                    .with_label_values(&[gateway.as_str()])
                    .inc();
                tracing::info!(
                    intent_id = %intent.id,
                    invoice_id = %intent.invoice_id,
                    gateway = %gateway,
                    "payment intent expired"
                );
                self.publish_event(
                    "intent.expired",
                    IntentExpiredPayload {
                        payment_intent_id: intent.id,
                        invoice_id: intent.invoice_id,
                        gateway,
                    },
                );
            }
            total += expired.len();
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Confirmation events are keyed by `(gateway, provider_txn_ref)`. A
    /// declined result may carry no transaction reference; those fall back
    /// to a session-scoped key so unrelated declines never collide.
    fn key_for(&self, attempt: &PaymentAttemptResult) -> String {
        if attempt.provider_txn_ref.is_empty() {
            let session = attempt.session_ref.as_deref().unwrap_or("unknown");
            format!("{}:session:{}", attempt.gateway.as_str(), session)
        } else {
            confirmation_key(attempt.gateway, &attempt.provider_txn_ref)
        }
    }

    fn note_integrity_failure(&self, gateway: Gateway, e: &PaymentError) {
        match e {
            PaymentError::SignatureMismatch => {
                self.metrics
                    .signature_failures_total
                    .with_label_values(&[gateway.as_str()])
                    .inc();
                tracing::warn!(gateway = %gateway, "signature verification failed");
            }
            PaymentError::AmountMismatch { confirmed_minor, requested_minor } => {
                tracing::warn!(
                    gateway = %gateway,
                    confirmed_minor,
                    requested_minor,
                    "amount mismatch, refusing to reconcile"
                );
            }
            PaymentError::CurrencyMismatch { expected, got } => {
                tracing::warn!(
                    gateway = %gateway,
                    expected = %expected,
                    got = %got,
                    "currency mismatch, refusing to reconcile"
                );
            }
            _ => {}
        }
    }

    /// Best-effort, post-commit event dispatch. Never blocks or fails the
    /// request that produced the event.
    fn publish_event<T: Serialize + Send + 'static>(&self, event_type: &str, payload: T) {
        let envelope = EventEnvelope::new(event_type, payload);
        let subject = format!("{SUBJECT_PREFIX}.{event_type}");
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(event_type, error = %e, "failed to serialize event");
                return;
            }
        };

        let publisher = self.publisher.clone();
        let fail_counter = self
            .metrics
            .event_publish_fail_total
            .with_label_values(&[event_type]);
        let event_type = event_type.to_string();
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&subject, bytes).await {
                tracing::warn!(event_type = %event_type, error = %e, "event publish failed");
                fail_counter.inc();
            }
        });
    }
}
