use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::coordinator::PaymentCoordinator;
use crate::error::PaymentError;
use crate::metrics::Metrics;
use crate::models::{
    ConfirmOutcome, ErrorResponse, Gateway, InitiatePaymentRequest, InitiatePaymentResponse,
    InvoiceView, Payment, PaymentIntent, RefundPaymentRequest, RefundRequest,
    VerifyPaymentRequest,
};
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<PaymentCoordinator>,
    pub store: Arc<dyn LedgerStore>,
    pub metrics: Arc<Metrics>,
}

pub fn payments_router(state: AppState) -> Router {
    Router::new()
        // Payment endpoints
        .route("/api/payments/initiate", post(initiate_payment))
        .route("/api/payments/verify", post(verify_payment))
        .route("/api/payments/{id}", get(get_payment))
        .route("/api/payments/{id}/refund", post(refund_payment))
        // Provider webhook endpoints
        .route("/api/webhooks/{gateway}", post(receive_webhook))
        // Ledger read endpoints
        .route("/api/invoices/{id}", get(get_invoice))
        .route("/api/intents/{id}", get(get_intent))
        // Operational endpoints
        .route("/api/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

/// Map a domain error to its structured HTTP shape. Terminal errors carry a
/// precise code so the UI layer never has to render a generic 500.
fn error_response(e: PaymentError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        PaymentError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
        PaymentError::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
        PaymentError::SignatureMismatch => StatusCode::UNAUTHORIZED,
        PaymentError::AmountMismatch { .. }
        | PaymentError::CurrencyMismatch { .. }
        | PaymentError::DuplicateActiveIntent
        | PaymentError::OverpaymentNotAllowed { .. }
        | PaymentError::RefundExceedsPayment { .. }
        | PaymentError::IdempotencyConflict => StatusCode::CONFLICT,
        PaymentError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "request failed on storage");
        return (
            status,
            Json(ErrorResponse::new(e.code(), "internal storage error")),
        );
    }

    (status, Json(ErrorResponse::new(e.code(), e.to_string())))
}

/// POST /api/payments/initiate - Create a provider session for an invoice
async fn initiate_payment(
    State(state): State<AppState>,
    Json(req): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<InitiatePaymentResponse>), (StatusCode, Json<ErrorResponse>)> {
    let (intent, session) = state
        .coordinator
        .initiate(req)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::OK,
        Json(InitiatePaymentResponse {
            intent_id: intent.id,
            session_ref: session.session_ref,
            redirect_url: session.redirect_url,
            client_prompt: session.client_prompt,
        }),
    ))
}

/// POST /api/payments/verify - Client-side confirmation of a session.
/// The response reflects the idempotent outcome: whichever of verify and
/// webhook lands first wins, the other observes the same body.
async fn verify_payment(
    State(state): State<AppState>,
    Json(req): Json<VerifyPaymentRequest>,
) -> Result<Json<ConfirmOutcome>, (StatusCode, Json<ErrorResponse>)> {
    let outcome = state
        .coordinator
        .verify(req.gateway, &req.session_ref, &req.proof)
        .await
        .map_err(error_response)?;

    Ok(Json(outcome))
}

/// POST /api/webhooks/{gateway} - Provider webhook delivery.
/// Signature verification and the idempotency reservation happen before any
/// slow work; a 2xx suppresses provider retries, anything else re-delivers,
/// which stays safe because processing is idempotent.
async fn receive_webhook(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let gateway = Gateway::from_path(&gateway).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "unknown gateway")),
        )
    })?;

    state
        .coordinator
        .handle_webhook(gateway, &body, &headers)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::OK)
}

/// POST /api/payments/{id}/refund - Refund a completed payment
async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RefundPaymentRequest>,
) -> Result<Json<RefundRequest>, (StatusCode, Json<ErrorResponse>)> {
    let refund = state
        .coordinator
        .refund(id, req)
        .await
        .map_err(error_response)?;

    Ok(Json(refund))
}

/// GET /api/payments/{id}
async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, (StatusCode, Json<ErrorResponse>)> {
    let payment = state
        .store
        .payment(id)
        .await
        .map_err(|e| error_response(e.into()))?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("not_found", "payment not found")),
            )
        })?;

    Ok(Json(payment))
}

/// GET /api/invoices/{id} - Ledger view of an invoice
async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InvoiceView>, (StatusCode, Json<ErrorResponse>)> {
    let invoice = state
        .store
        .invoice(id)
        .await
        .map_err(|e| error_response(e.into()))?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("not_found", "invoice not found")),
            )
        })?;

    let payments = state
        .store
        .payments_for_invoice(id)
        .await
        .map_err(|e| error_response(e.into()))?;

    Ok(Json(InvoiceView::from_parts(invoice, payments)))
}

/// GET /api/intents/{id}
async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentIntent>, (StatusCode, Json<ErrorResponse>)> {
    let intent = state
        .store
        .intent(id)
        .await
        .map_err(|e| error_response(e.into()))?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("not_found", "payment intent not found")),
            )
        })?;

    Ok(Json(intent))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "payment-recon-rs",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn render_metrics(
    State(state): State<AppState>,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    state.metrics.render().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("metrics_error", e)),
        )
    })
}
