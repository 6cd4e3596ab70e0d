use actix_web::{http::StatusCode, test, test::TestRequest, App};
use dotpay_engine::SqliteDatabase;
use serde_json::{json, Value};

use super::{
    helpers::{bearer, configure_app, test_config, USER},
    mocks::{MockBehaviour, MockMobileMoney},
};
use crate::config::ServerConfig;

struct TestContext {
    config: ServerConfig,
    db: SqliteDatabase,
    mock: MockMobileMoney,
}

impl TestContext {
    async fn new(behaviour: MockBehaviour) -> Self {
        let _ = env_logger::try_init().ok();
        Self {
            config: test_config(),
            db: SqliteDatabase::new_in_memory().await.unwrap(),
            mock: MockMobileMoney::new(behaviour),
        }
    }

    async fn post_onramp(&self, key: Option<&str>, body: Value) -> (StatusCode, Value) {
        let app = App::new().configure(configure_app(
            self.db.clone(),
            self.mock.clone(),
            self.config.clone(),
        ));
        let app = test::init_service(app).await;
        let mut req = TestRequest::post()
            .uri("/api/mpesa/onramp/stk/initiate")
            .insert_header(("Authorization", bearer(&self.config, USER, "mpesa")))
            .set_json(body);
        if let Some(key) = key {
            req = req.insert_header(("Idempotency-Key", key));
        }
        let res = test::call_service(&app, req.to_request()).await;
        let status = res.status();
        let body: Value = test::read_body_json(res).await;
        (status, body)
    }
}

fn onramp_body() -> Value {
    json!({"amount": 1000.0, "currency": "KES", "phone": "254700000000"})
}

#[actix_web::test]
async fn onramp_initiate_submits_an_stk_push() {
    let ctx = TestContext::new(MockBehaviour::Accept).await;
    let (status, body) = ctx.post_onramp(Some("onramp:test-key-001"), onramp_body()).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let tx = &body["data"]["transaction"];
    assert_eq!(tx["status"], "mpesa_processing");
    assert_eq!(body["data"]["idempotent"], false);
    assert_eq!(tx["daraja"]["checkout_request_id"], "ws_CO_mock_1");
    // STK push debits the full quote, rounded up to whole shillings: 1000 + 13 fee
    assert_eq!(ctx.mock.calls(), vec!["stk_push:254700000000:1013"]);
}

#[actix_web::test]
async fn missing_idempotency_key_is_rejected() {
    let ctx = TestContext::new(MockBehaviour::Accept).await;
    let (status, body) = ctx.post_onramp(None, onramp_body()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"].as_str().unwrap().contains("Idempotency-Key header is required"),
        "body: {body}"
    );
    assert!(ctx.mock.calls().is_empty());
}

#[actix_web::test]
async fn malformed_idempotency_keys_are_rejected() {
    let ctx = TestContext::new(MockBehaviour::Accept).await;
    for bad in ["a/b", "short", &"x".repeat(129)] {
        let (status, body) = ctx.post_onramp(Some(bad), onramp_body()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "key {bad} was accepted: {body}");
    }
    assert!(ctx.mock.calls().is_empty());
}

#[actix_web::test]
async fn replayed_initiate_returns_the_same_transaction_without_resubmitting() {
    let ctx = TestContext::new(MockBehaviour::Accept).await;
    let (_, first) = ctx.post_onramp(Some("onramp:replay-key-01"), onramp_body()).await;
    let first_id = first["data"]["transaction"]["transaction_id"].as_str().unwrap().to_string();
    assert_eq!(ctx.mock.calls().len(), 1);

    let (status, second) = ctx.post_onramp(Some("onramp:replay-key-01"), onramp_body()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["idempotent"], true);
    assert_eq!(second["data"]["transaction"]["transaction_id"], first_id.as_str());
    // The provider was not called a second time
    assert_eq!(ctx.mock.calls().len(), 1);
}

#[actix_web::test]
async fn rejected_submission_fails_the_transaction() {
    let ctx = TestContext::new(MockBehaviour::Reject).await;
    let (status, body) = ctx.post_onramp(Some("onramp:reject-key-01"), onramp_body()).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let tx = &body["data"]["transaction"];
    assert_eq!(tx["status"], "failed");
    assert_eq!(tx["daraja"]["response_code"], "1");
}

#[actix_web::test]
async fn transport_errors_fail_the_transaction() {
    let ctx = TestContext::new(MockBehaviour::TransportError).await;
    let (status, body) = ctx.post_onramp(Some("onramp:transport-key-1"), onramp_body()).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"]["transaction"]["status"], "failed");
}

#[actix_web::test]
async fn invalid_msisdns_are_rejected() {
    let ctx = TestContext::new(MockBehaviour::Accept).await;
    for phone in ["0700000000", "7000000000", "254600000000"] {
        let (status, _) = ctx
            .post_onramp(
                Some("onramp:msisdn-key-01"),
                json!({"amount": 1000.0, "currency": "KES", "phone": phone}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{phone} was accepted");
    }
    assert!(ctx.mock.calls().is_empty());
}

#[actix_web::test]
async fn amount_above_the_transaction_cap_is_rejected() {
    let ctx = TestContext::new(MockBehaviour::Accept).await;
    let (status, body) = ctx
        .post_onramp(
            Some("onramp:cap-key-0001"),
            json!({"amount": 200_000.0, "currency": "KES", "phone": "254700000000"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("limit"), "body: {body}");
}

#[actix_web::test]
async fn disabled_gateway_returns_503() {
    let mut ctx = TestContext::new(MockBehaviour::Accept).await;
    ctx.config.enabled = false;
    let (status, _) = ctx.post_onramp(Some("onramp:disabled-key-1"), onramp_body()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(ctx.mock.calls().is_empty());
}

#[actix_web::test]
async fn offramp_requires_pin_and_signature() {
    let ctx = TestContext::new(MockBehaviour::Accept).await;
    let app = App::new().configure(configure_app(
        ctx.db.clone(),
        ctx.mock.clone(),
        ctx.config.clone(),
    ));
    let app = test::init_service(app).await;
    // No PIN provisioned for the user, and the signature is junk; the request must die in
    // authorization before touching the provider.
    let req = TestRequest::post()
        .uri("/api/mpesa/offramp/initiate")
        .insert_header(("Authorization", bearer(&ctx.config, USER, "mpesa")))
        .insert_header(("Idempotency-Key", "offramp:auth-key-01"))
        .set_json(json!({
            "amount": 1000.0,
            "currency": "KES",
            "phone": "254700000000",
            "pin": "123456",
            "signature": "0xdeadbeefdeadbeefdeadbeef",
            "nonce": "nonce-123456",
            "signedAt": chrono::Utc::now().to_rfc3339(),
            "onchainTxHash": format!("0x{}", "ab".repeat(32)),
        }))
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(ctx.mock.calls().is_empty());
}
