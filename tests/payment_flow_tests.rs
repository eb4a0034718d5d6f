//! Initiate → verify flows over the HTTP surface.

mod common;

use common::*;

#[tokio::test]
async fn initiate_creates_awaiting_intent() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({
            "invoice_id": invoice_id,
            "gateway": "card-hosted",
        }),
    )
    .await;
    assert_eq!(response.status(), 200);

    let body = body_json(response).await;
    let session_ref = body["session_ref"].as_str().unwrap();
    assert!(session_ref.starts_with("mock_sess_"));
    assert!(body["redirect_url"].as_str().unwrap().contains(session_ref));

    let intent_id = body["intent_id"].as_str().unwrap();
    let response = get(&app.router, &format!("/api/intents/{intent_id}")).await;
    assert_eq!(response.status(), 200);
    let intent = body_json(response).await;
    assert_eq!(intent["status"], "awaiting_confirmation");
    // Amount defaults to the invoice balance due.
    assert_eq!(intent["requested_minor"], 10_000);
    assert_eq!(intent["gateway"], "card-hosted");
}

#[tokio::test]
async fn second_initiate_for_same_invoice_and_gateway_conflicts() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    let request = serde_json::json!({
        "invoice_id": invoice_id,
        "gateway": "card-hosted",
    });
    let response = post_json(&app.router, "/api/payments/initiate", request.clone()).await;
    assert_eq!(response.status(), 200);

    let response = post_json(&app.router, "/api/payments/initiate", request).await;
    assert_eq!(response.status(), 409);
    let body = body_json(response).await;
    assert_eq!(body["error"], "duplicate_active_intent");
}

#[tokio::test]
async fn same_invoice_may_have_active_intents_on_different_gateways() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    for gateway in ["card-hosted", "mobile-money"] {
        let response = post_json(
            &app.router,
            "/api/payments/initiate",
            serde_json::json!({ "invoice_id": invoice_id, "gateway": gateway }),
        )
        .await;
        assert_eq!(response.status(), 200, "{gateway} initiate should succeed");
    }
}

#[tokio::test]
async fn initiate_unknown_invoice_is_404() {
    let app = build_app();

    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({
            "invoice_id": uuid::Uuid::new_v4(),
            "gateway": "card-hosted",
        }),
    )
    .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn initiate_above_balance_is_rejected_without_overpayment_policy() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({
            "invoice_id": invoice_id,
            "gateway": "card-hosted",
            "amount_minor": 20_000,
        }),
    )
    .await;
    assert_eq!(response.status(), 409);
    let body = body_json(response).await;
    assert_eq!(body["error"], "overpayment_not_allowed");
}

#[tokio::test]
async fn verify_confirms_payment_and_settles_invoice() {
    let app = build_app();
    let (invoice_id, payment_id) =
        pay_invoice(&app, 10_000, 10_000, "card-hosted", "TXN_FLOW_1").await;

    let response = get(&app.router, &format!("/api/invoices/{invoice_id}")).await;
    assert_eq!(response.status(), 200);
    let invoice = body_json(response).await;
    assert_eq!(invoice["status"], "paid");
    assert_eq!(invoice["amount_paid_minor"], 10_000);
    assert_eq!(invoice["balance_due_minor"], 0);
    assert_eq!(invoice["payments"].as_array().unwrap().len(), 1);
    assert_eq!(invoice["payments"][0]["provider_txn_ref"], "TXN_FLOW_1");

    let response = get(&app.router, &format!("/api/payments/{payment_id}")).await;
    assert_eq!(response.status(), 200);
    let payment = body_json(response).await;
    assert_eq!(payment["status"], "completed");
    assert_eq!(payment["amount_minor"], 10_000);
}

#[tokio::test]
async fn repeated_verify_replays_the_identical_outcome() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({ "invoice_id": invoice_id, "gateway": "card-hosted" }),
    )
    .await;
    let session_ref = body_json(response).await["session_ref"]
        .as_str()
        .unwrap()
        .to_string();

    let verify_request = serde_json::json!({
        "gateway": "card-hosted",
        "session_ref": session_ref,
        "proof": { "txn_ref": "TXN_REPLAY" },
    });

    let first = body_json(
        post_json(&app.router, "/api/payments/verify", verify_request.clone()).await,
    )
    .await;
    let second =
        body_json(post_json(&app.router, "/api/payments/verify", verify_request).await).await;

    // Identical snapshot, including the payment id: no second row was made.
    assert_eq!(first, second);

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["payments"].as_array().unwrap().len(), 1);
    assert_eq!(invoice["amount_paid_minor"], 10_000);
}

#[tokio::test]
async fn declined_verify_marks_intent_failed_and_leaves_ledger_alone() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({ "invoice_id": invoice_id, "gateway": "card-hosted" }),
    )
    .await;
    let body = body_json(response).await;
    let session_ref = body["session_ref"].as_str().unwrap().to_string();
    let intent_id = body["intent_id"].as_str().unwrap().to_string();

    let response = post_json(
        &app.router,
        "/api/payments/verify",
        serde_json::json!({
            "gateway": "card-hosted",
            "session_ref": session_ref,
            "proof": { "fail": true },
        }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let outcome = body_json(response).await;
    assert_eq!(outcome["status"], "declined");
    assert!(outcome["payment"].is_null());

    let intent = body_json(get(&app.router, &format!("/api/intents/{intent_id}")).await).await;
    assert_eq!(intent["status"], "failed");

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["status"], "unpaid");
    assert_eq!(invoice["amount_paid_minor"], 0);
}

#[tokio::test]
async fn partial_accepting_gateway_records_the_provider_amount() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({ "invoice_id": invoice_id, "gateway": "mobile-money" }),
    )
    .await;
    let session_ref = body_json(response).await["session_ref"]
        .as_str()
        .unwrap()
        .to_string();

    // The wallet settled less than requested.
    let response = post_json(
        &app.router,
        "/api/payments/verify",
        serde_json::json!({
            "gateway": "mobile-money",
            "session_ref": session_ref,
            "proof": { "txn_ref": "TXN_PARTIAL", "amount_minor": 4_000 },
        }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let outcome = body_json(response).await;
    assert_eq!(outcome["status"], "confirmed");
    assert_eq!(outcome["payment"]["amount_minor"], 4_000);

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["status"], "partial");
    assert_eq!(invoice["amount_paid_minor"], 4_000);
    assert_eq!(invoice["balance_due_minor"], 6_000);
}

#[tokio::test]
async fn exact_match_gateway_rejects_amount_mismatch() {
    let app = build_app();
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({ "invoice_id": invoice_id, "gateway": "card-hosted" }),
    )
    .await;
    let session_ref = body_json(response).await["session_ref"]
        .as_str()
        .unwrap()
        .to_string();

    let response = post_json(
        &app.router,
        "/api/payments/verify",
        serde_json::json!({
            "gateway": "card-hosted",
            "session_ref": session_ref,
            "proof": { "txn_ref": "TXN_SHORT", "amount_minor": 5_000 },
        }),
    )
    .await;
    assert_eq!(response.status(), 409);
    let body = body_json(response).await;
    assert_eq!(body["error"], "amount_mismatch");

    // Never silently reconciled.
    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["amount_paid_minor"], 0);
    assert!(invoice["payments"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn overpayment_policy_admits_amounts_above_total() {
    let app = build_app_with(true, chrono::Duration::minutes(30));
    let invoice_id = seed_invoice(&app.store, 10_000, "USD").await;

    let response = post_json(
        &app.router,
        "/api/payments/initiate",
        serde_json::json!({
            "invoice_id": invoice_id,
            "gateway": "card-hosted",
            "amount_minor": 12_000,
        }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let session_ref = body_json(response).await["session_ref"]
        .as_str()
        .unwrap()
        .to_string();

    let response = post_json(
        &app.router,
        "/api/payments/verify",
        serde_json::json!({
            "gateway": "card-hosted",
            "session_ref": session_ref,
            "proof": { "txn_ref": "TXN_OVER" },
        }),
    )
    .await;
    assert_eq!(response.status(), 200);

    let invoice = body_json(get(&app.router, &format!("/api/invoices/{invoice_id}")).await).await;
    assert_eq!(invoice["status"], "paid");
    assert_eq!(invoice["amount_paid_minor"], 12_000);
    assert_eq!(invoice["balance_due_minor"], -2_000);
}

#[tokio::test]
async fn confirmed_payment_emits_a_confirmed_event() {
    let app = build_app();
    pay_invoice(&app, 10_000, 10_000, "card-hosted", "TXN_EVENT").await;

    // Publishing is fire-and-forget on a spawned task.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let subjects = app.publisher.subjects();
    assert!(
        subjects.contains(&"payments.events.payment.confirmed".to_string()),
        "expected a payment.confirmed event, got {subjects:?}"
    );
}
