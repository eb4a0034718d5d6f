#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::Sha256;
use tower::util::ServiceExt;
use uuid::Uuid;

use payment_recon_rs::coordinator::{CoordinatorConfig, PaymentCoordinator};
use payment_recon_rs::events::InMemoryEventPublisher;
use payment_recon_rs::gateways::{mock, GatewayAdapter, MockGateway};
use payment_recon_rs::idempotency::MemoryIdempotencyStore;
use payment_recon_rs::metrics::Metrics;
use payment_recon_rs::models::{AmountPolicy, Gateway, Invoice, InvoiceStatus};
use payment_recon_rs::reconciler::LedgerReconciler;
use payment_recon_rs::routes::{payments_router, AppState};
use payment_recon_rs::store::{LedgerStore, MemoryLedgerStore};

pub const WEBHOOK_SECRET: &str = mock::DEFAULT_WEBHOOK_SECRET;

pub struct TestApp {
    pub router: Router,
    pub coordinator: Arc<PaymentCoordinator>,
    pub store: Arc<MemoryLedgerStore>,
    pub publisher: Arc<InMemoryEventPublisher>,
}

/// Full engine against the in-memory backend and mock adapters, with the
/// same amount policies as the live gateways.
pub fn build_app() -> TestApp {
    build_app_with(false, chrono::Duration::minutes(30))
}

pub fn build_app_with(allow_overpayment: bool, mock_ttl: chrono::Duration) -> TestApp {
    let store = Arc::new(MemoryLedgerStore::new());
    let idempotency = Arc::new(MemoryIdempotencyStore::new(
        Duration::from_secs(2),
        chrono::Duration::days(30),
    ));
    let publisher = Arc::new(InMemoryEventPublisher::new());
    let metrics = Arc::new(Metrics::new());
    let reconciler = Arc::new(LedgerReconciler::new(store.clone(), allow_overpayment));

    let adapters: Vec<Arc<dyn GatewayAdapter>> = vec![
        Arc::new(
            MockGateway::new(Gateway::CardHosted, AmountPolicy::ExactMatch)
                .with_session_ttl(mock_ttl),
        ),
        Arc::new(
            MockGateway::new(Gateway::OrderSignature, AmountPolicy::ExactMatch)
                .with_session_ttl(mock_ttl),
        ),
        Arc::new(
            MockGateway::new(Gateway::MobileMoney, AmountPolicy::AcceptPartial)
                .with_session_ttl(mock_ttl),
        ),
    ];

    let cfg = CoordinatorConfig {
        retry_attempts: 2,
        retry_backoff: Duration::from_millis(10),
        idempotency_wait: Duration::from_secs(2),
        poll_interval: Duration::from_millis(5),
        allow_overpayment,
    };

    let coordinator = Arc::new(PaymentCoordinator::new(
        store.clone(),
        idempotency,
        reconciler,
        publisher.clone(),
        adapters,
        metrics.clone(),
        cfg,
    ));

    let state = AppState {
        coordinator: coordinator.clone(),
        store: store.clone(),
        metrics,
    };

    TestApp {
        router: payments_router(state),
        coordinator,
        store,
        publisher,
    }
}

/// Seed an unpaid invoice and return its id.
pub async fn seed_invoice(store: &MemoryLedgerStore, total_minor: i64, currency: &str) -> Uuid {
    let now = chrono::Utc::now();
    let invoice = Invoice {
        id: Uuid::new_v4(),
        total_minor,
        amount_paid_minor: 0,
        currency: currency.to_string(),
        status: InvoiceStatus::Unpaid,
        created_at: now,
        updated_at: now,
    };
    store
        .insert_invoice(&invoice)
        .await
        .expect("failed to seed invoice");
    invoice.id
}

/// Hex HMAC-SHA256, the signature scheme the mock gateway verifies.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub async fn post_json(
    router: &Router,
    path: &str,
    body: serde_json::Value,
) -> Response<Body> {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

/// Deliver a signed mock webhook for `gateway`.
pub async fn post_webhook(
    router: &Router,
    gateway: &str,
    body: &serde_json::Value,
    secret: &str,
) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap();
    let signature = sign(secret, &bytes);
    router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/webhooks/{gateway}"))
                .header("content-type", "application/json")
                .header("x-mock-signature", signature)
                .body(Body::from(bytes))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn get(router: &Router, path: &str) -> Response<Body> {
    router
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// Read response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Run an initiate + verify round trip over HTTP and return
/// (invoice_id, payment_id). Used by the refund suites to set up state.
pub async fn pay_invoice(
    app: &TestApp,
    total_minor: i64,
    pay_minor: i64,
    gateway: &str,
    txn_ref: &str,
) -> (Uuid, Uuid) {
    let invoice_id = seed_invoice(&app.store, total_minor, "USD").await;

    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({
            "invoice_id": invoice_id,
            "gateway": gateway,
            "amount_minor": pay_minor,
        }),
    )
    .await;
    assert_eq!(response.status(), 200, "initiate should succeed");
    let session_ref = body_json(response).await["session_ref"]
        .as_str()
        .unwrap()
        .to_string();

    let response = post_json(
        &app.router,
        "/api/payments/verify",
        serde_json::json!({
            "gateway": gateway,
            "session_ref": session_ref,
            "proof": { "txn_ref": txn_ref },
        }),
    )
    .await;
    assert_eq!(response.status(), 200, "verify should succeed");
    let outcome = body_json(response).await;
    assert_eq!(outcome["status"], "confirmed");
    let payment_id = outcome["payment"]["id"].as_str().unwrap().parse().unwrap();

    (invoice_id, payment_id)
}
