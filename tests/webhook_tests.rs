//! Provider webhook delivery: signature enforcement, duplicate suppression,
//! and out-of-band acceptance for expired sessions.

mod common;

use axum::body::Body;
use axum::http::Request;
use common::*;
use tower::util::ServiceExt;

async fn initiate(app: &TestApp, invoice_id: uuid::Uuid, gateway: &str) -> (String, String) {
    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({ "invoice_id": invoice_id, "gateway": gateway }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    (
        body["session_ref"].as_str().unwrap().to_string(),
        body["intent_id"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn signed_webhook_confirms_payment() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;
    let (session_ref, intent_id) = initiate(&app, invoice_id, "card-hosted").await;

    let response = post_webhook(
        &app.router,
        "card-hosted",
        &serde_json::json!({
            "session_ref": session_ref,
            "txn_ref": "TXN_WH_1",
            "amount_minor": 10_000,
            "currency": "USD",
            "status": "success",
        }),
        WEBHOOK_SECRET,
    )
    .await;
    assert_eq!(response.status(), 200);

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["status"], "paid");
    assert_eq!(invoice["payments"][0]["provider_txn_ref"], "TXN_WH_1");

    let intent = body_json(get(&app.router, &format!("/api/intents/{intent_id}")).await).await;
    assert_eq!(intent["status"], "verified");
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected_untouched() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;
    let (session_ref, _) = initiate(&app, invoice_id, "card-hosted").await;

    let response = post_webhook(
        &app.router,
        "card-hosted",
        &serde_json::json!({
            "session_ref": session_ref,
            "txn_ref": "TXN_FORGED",
            "amount_minor": 10_000,
            "currency": "USD",
            "status": "success",
        }),
        "not-the-webhook-secret",
    )
    .await;
    assert_eq!(response.status(), 401);
    let body = body_json(response).await;
    assert_eq!(body["error"], "signature_mismatch");

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["amount_paid_minor"], 0);
    assert!(invoice["payments"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_without_signature_header_is_rejected() {
    let app = build_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webhooks/card-hosted")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn webhook_for_unknown_gateway_is_404() {
    let app = build_app();

    let response = post_webhook(
        &app.router,
        "carrier-pigeon",
        &serde_json::json!({}),
        WEBHOOK_SECRET,
    )
    .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn redelivered_webhook_creates_exactly_one_payment() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;
    let (session_ref, _) = initiate(&app, invoice_id, "card-hosted").await;

    let webhook = serde_json::json!({
        "session_ref": session_ref,
        "txn_ref": "TXN_DUP",
        "amount_minor": 10_000,
        "currency": "USD",
        "status": "success",
    });

    // Providers retry until they see a 2xx; every delivery must be safe.
    for _ in 0..3 {
        let response = post_webhook(&app.router, "card-hosted", &webhook, WEBHOOK_SECRET).await;
        assert_eq!(response.status(), 200);
    }

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["payments"].as_array().unwrap().len(), 1);
    assert_eq!(invoice["amount_paid_minor"], 10_000);
}

#[tokio::test]
async fn failed_webhook_marks_intent_failed() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;
    let (session_ref, intent_id) = initiate(&app, invoice_id, "card-hosted").await;

    let response = post_webhook(
        &app.router,
        "card-hosted",
        &serde_json::json!({
            "session_ref": session_ref,
            "txn_ref": "TXN_DECLINED",
            "amount_minor": 10_000,
            "currency": "USD",
            "status": "failed",
        }),
        WEBHOOK_SECRET,
    )
    .await;
    assert_eq!(response.status(), 200);

    let intent = body_json(get(&app.router, &format!("/api/intents/{intent_id}")).await).await;
    assert_eq!(intent["status"], "failed");

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["status"], "unpaid");
}

#[tokio::test]
async fn late_webhook_for_expired_intent_is_accepted_out_of_band() {
    // Zero TTL: the intent expires as soon as the sweeper runs.
    let app = build_app_with(false, chrono::Duration::zero());
    let invoice_id = seed_invoice(&app.store, 10_000, "KES").await;
    let (session_ref, intent_id) = initiate(&app, invoice_id, "mobile-money").await;

    let expired = app.coordinator.expire_stale_intents().await.unwrap();
    assert_eq!(expired, 1);
    let intent = body_json(get(&app.router, &format!("/api/intents/{intent_id}")).await).await;
    assert_eq!(intent["status"], "expired");

    // The network settled anyway; the money is real and must not be lost.
    let response = post_webhook(
        &app.router,
        "mobile-money",
        &serde_json::json!({
            "session_ref": session_ref,
            "txn_ref": "RCP_LATE",
            "amount_minor": 10_000,
            "currency": "KES",
            "status": "success",
        }),
        WEBHOOK_SECRET,
    )
    .await;
    assert_eq!(response.status(), 200);

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["status"], "paid");
    assert_eq!(invoice["amount_paid_minor"], 10_000);
    // Recorded as out-of-band: no intent is attached to the payment.
    assert!(invoice["payments"][0]["payment_intent_id"].is_null());

    // The expired intent does not come back to life.
    let intent = body_json(get(&app.router, &format!("/api/intents/{intent_id}")).await).await;
    assert_eq!(intent["status"], "expired");
}

#[tokio::test]
async fn webhook_for_unknown_session_with_invoice_reference_is_accepted() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    let response = post_webhook(
        &app.router,
        "card-hosted",
        &serde_json::json!({
            "session_ref": "cs_never_seen",
            "txn_ref": "TXN_OOB",
            "amount_minor": 10_000,
            "currency": "USD",
            "invoice_id": invoice_id,
            "status": "success",
        }),
        WEBHOOK_SECRET,
    )
    .await;
    assert_eq!(response.status(), 200);

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["status"], "paid");
    assert!(invoice["payments"][0]["payment_intent_id"].is_null());
}

#[tokio::test]
async fn webhook_with_no_invoice_reference_at_all_is_rejected() {
    let app = build_app();

    let response = post_webhook(
        &app.router,
        "card-hosted",
        &serde_json::json!({
            "session_ref": "cs_unknown",
            "txn_ref": "TXN_NOWHERE",
            "amount_minor": 10_000,
            "currency": "USD",
            "status": "success",
        }),
        WEBHOOK_SECRET,
    )
    .await;
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn expired_intent_emits_an_expired_event() {
    let app = build_app_with(false, chrono::Duration::zero());
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;
    initiate(&app, invoice_id, "card-hosted").await;

    app.coordinator.expire_stale_intents().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let subjects = app.publisher.subjects();
    assert!(
        subjects.contains(&"payments.events.intent.expired".to_string()),
        "expected an intent.expired event, got {subjects:?}"
    );
}
