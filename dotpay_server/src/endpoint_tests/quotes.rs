use actix_web::{http::StatusCode, test, test::TestRequest, App};
use dotpay_engine::SqliteDatabase;
use serde_json::{json, Value};

use super::{
    helpers::{bearer, configure_app, test_config, USER},
    mocks::MockMobileMoney,
};
use crate::config::ServerConfig;

const MICRO: i64 = 1_000_000;

async fn post_quote(body: Value) -> (StatusCode, Value) {
    let _ = env_logger::try_init().ok();
    let config = test_config();
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let app = App::new().configure(configure_app(db, MockMobileMoney::accepting(), config.clone()));
    let app = test::init_service(app).await;
    let req = TestRequest::post()
        .uri("/api/mpesa/quotes")
        .insert_header(("Authorization", bearer(&config, USER, "mpesa")))
        .set_json(body)
        .to_request();
    let res = test::call_service(&app, req).await;
    let status = res.status();
    let body: Value = test::read_body_json(res).await;
    (status, body)
}

#[actix_web::test]
async fn kes_onramp_quote_prices_correctly() {
    let (status, body) =
        post_quote(json!({"flowType": "onramp", "amount": 1000.0, "currency": "KES"})).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let quote = &body["data"]["quote"];
    assert_eq!(quote["amount_kes"], json!(1000 * MICRO));
    assert_eq!(quote["amount_usd"], json!(7_690_000)); // 7.69 at the default 130 rate
    assert_eq!(quote["fee_kes"], json!(13 * MICRO));
    assert_eq!(quote["network_fee_kes"], json!(0));
    assert_eq!(quote["total_debit_kes"], json!(1013 * MICRO));
    assert_eq!(quote["expected_receive_kes"], json!(1000 * MICRO));
    assert!(quote["quote_id"].as_str().unwrap().starts_with("q_"));

    let transaction = &body["data"]["transaction"];
    assert_eq!(transaction["status"], "quoted");
    assert_eq!(transaction["flow_type"], "onramp");
    assert_eq!(transaction["user_address"], USER);
}

#[actix_web::test]
async fn usd_offramp_quote_with_rate_override() {
    let (status, body) = post_quote(
        json!({"flowType": "offramp", "amount": 10.0, "currency": "USD", "kesPerUsd": 155.0}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let quote = &body["data"]["quote"];
    assert_eq!(quote["amount_usd"], json!(10 * MICRO));
    assert_eq!(quote["amount_kes"], json!(1550 * MICRO));
    assert_eq!(quote["fee_kes"], json!(27_900_000)); // max(5, 1550 * 0.018)
    assert_eq!(quote["network_fee_kes"], json!(3 * MICRO));
    assert_eq!(quote["total_debit_kes"], json!(1_580_900_000));
}

#[actix_web::test]
async fn funded_quote_without_a_treasury_is_a_configuration_error() {
    let _ = env_logger::try_init().ok();
    // Funding required, but no TREASURY_* configuration exists in tests
    let config = ServerConfig { require_onchain_funding: true, ..test_config() };
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let app = App::new().configure(configure_app(db, MockMobileMoney::accepting(), config.clone()));
    let app = test::init_service(app).await;
    let req = TestRequest::post()
        .uri("/api/mpesa/quotes")
        .insert_header(("Authorization", bearer(&config, USER, "mpesa")))
        .set_json(json!({"flowType": "offramp", "amount": 1000.0, "currency": "KES"}))
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    // Onramp does not need funding and still quotes fine
    let req = TestRequest::post()
        .uri("/api/mpesa/quotes")
        .insert_header(("Authorization", bearer(&config, USER, "mpesa")))
        .set_json(json!({"flowType": "onramp", "amount": 1000.0, "currency": "KES"}))
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[actix_web::test]
async fn invalid_quote_inputs_are_rejected() {
    let (status, body) =
        post_quote(json!({"flowType": "onramp", "amount": 0.0, "currency": "KES"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    assert_eq!(body["success"], false);

    let (status, _) =
        post_quote(json!({"flowType": "onramp", "amount": -3.0, "currency": "KES"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) =
        post_quote(json!({"flowType": "onramp", "amount": 100.0, "currency": "ZAR"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("currency"), "body: {body}");

    let (status, _) =
        post_quote(json!({"flowType": "instant-win", "amount": 100.0, "currency": "KES"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
