//! Integration tests for the gift API.

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use common::*;
use gift_escrow::api::{create_router_with_rate_limit, AppState, RateLimitState};
use gift_escrow::types::NATIVE_SOL_MINT;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const OPERATOR_TOKEN: &str = "operator-secret";

fn create_test_state(harness: &Harness) -> AppState {
    AppState::new(
        harness.machine.clone(),
        harness.claims.clone(),
        Arc::new(MockIdentity::standard()),
        Some(SecretString::new(OPERATOR_TOKEN.to_string())),
    )
}

fn test_app(harness: &Harness) -> Router {
    create_router_with_rate_limit(create_test_state(harness), RateLimitState::permissive())
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn sol_quote_body() -> Value {
    json!({
        "content": { "kind": "single", "mint": NATIVE_SOL_MINT },
        "face_value_usd": 50_000_000u64,
        "payment_method": "direct_asset_transfer"
    })
}

fn sol_gift_body() -> Value {
    json!({
        "content": { "kind": "single", "mint": NATIVE_SOL_MINT },
        "face_value_usd": 50_000_000u64,
        "payment_method": "direct_asset_transfer",
        "recipient": { "email": RECIPIENT_EMAIL, "name": "Bob" },
        "message": "Enjoy"
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = Harness::new();
    let response = test_app(&harness)
        .oneshot(get("/health", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["gift_count"], 0);
    assert_eq!(json["settlement_network_healthy"], true);
}

#[tokio::test]
async fn test_quote_requires_authentication() {
    let harness = Harness::new();
    let app = test_app(&harness);

    let response = app
        .clone()
        .oneshot(post("/v1/quote", None, sol_quote_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(post("/v1/quote", Some("stolen-token"), sol_quote_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_quote_direct_sol_gift() {
    let harness = Harness::new();
    let response = test_app(&harness)
        .oneshot(post("/v1/quote", Some("alice-token"), sol_quote_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["breakdown"]["network_fee_usd"], 135_882);
    assert_eq!(json["breakdown"]["processing_fee_usd"], 0);
    assert_eq!(json["breakdown"]["total_usd"], 50_135_882);
    assert_eq!(json["degraded_pricing"], false);
}

#[tokio::test]
async fn test_create_gift_and_read_status() {
    let harness = Harness::new();
    harness
        .network
        .set_balance(SENDER_WALLET, NATIVE_SOL_MINT, 1_000_000_000);
    let app = test_app(&harness);

    let response = app
        .clone()
        .oneshot(post("/v1/gifts", Some("alice-token"), sol_gift_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let gift_id = created["gift_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "AWAITING_FUNDING");

    let uri = format!("/v1/gifts/{}", gift_id);
    let response = app
        .clone()
        .oneshot(get(&uri, Some("alice-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view = body_json(response).await;
    assert_eq!(view["gift_id"], gift_id.as_str());

    // Only the sender may read a gift's status.
    let response = app.oneshot(get(&uri, Some("bob-token"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_create_gift_rejects_unlinked_wallet() {
    let harness = Harness::new();
    let mut body = sol_gift_body();
    body["wallet"] = json!(RECIPIENT_WALLET);

    let response = test_app(&harness)
        .oneshot(post("/v1/gifts", Some("alice-token"), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(harness.store.count().await, 0);
}

#[tokio::test]
async fn test_unknown_gift_is_not_found() {
    let harness = Harness::new();
    let response = test_app(&harness)
        .oneshot(get("/v1/gifts/does-not-exist", Some("alice-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_claim_unknown_token() {
    let harness = Harness::new();
    let response = test_app(&harness)
        .oneshot(post("/v1/claims/not-a-token", Some("bob-token"), json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "CLAIM_NOT_FOUND");
}

#[tokio::test]
async fn test_claim_over_http() {
    let harness = Harness::new();
    let (gift_id, token) = harness.send_sol_gift().await;
    let app = test_app(&harness);
    let uri = format!("/v1/claims/{}", token);

    let response = app
        .clone()
        .oneshot(post(&uri, Some("mallory-token"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(post(&uri, Some("bob-token"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "claimed");
    assert_eq!(json["gift_id"], gift_id.as_str());
    assert_eq!(json["wallet"], RECIPIENT_WALLET);

    let response = app
        .oneshot(post(&uri, Some("bob-token"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_claims_are_rate_limited() {
    let harness = Harness::new();
    let app = create_router_with_rate_limit(create_test_state(&harness), RateLimitState::new(1));

    let response = app
        .clone()
        .oneshot(post("/v1/claims/guess-1", Some("bob-token"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(post("/v1/claims/guess-2", Some("bob-token"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Other routes are not limited.
    let response = app.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_grant_credit_requires_operator_token() {
    let harness = Harness::new();
    let app = test_app(&harness);
    let body = json!({ "user_id": "alice", "allowed": 2 });

    let response = app
        .clone()
        .oneshot(post("/v1/credits", Some("alice-token"), body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(post("/v1/credits", Some(OPERATOR_TOKEN), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["credit"]["allowed"], 2);
    assert!(harness
        .store
        .has_usable_credit("alice", chrono::Utc::now())
        .await);
}
