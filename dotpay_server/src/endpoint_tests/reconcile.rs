use actix_web::{http::StatusCode, test, test::TestRequest, App};
use chrono::Duration;
use dotpay_engine::{
    db_types::{Currency, FlowType, PayTarget, RefundStatus, TransactionStatus},
    quotes::QuoteRequest,
    traits::PaymentDatabase,
    treasury::{TreasuryClient, TreasuryConfig},
    PaymentFlowApi,
    SqliteDatabase,
};
use dp_common::Secret;
use serde_json::{json, Value};

use super::{
    helpers::{configure_app, test_config, USER},
    mocks::MockMobileMoney,
};
use crate::config::ServerConfig;

const INTERNAL_KEY: &str = "internal-ops-key";

fn config_with_key() -> ServerConfig {
    let mut config = test_config();
    config.internal_api_key = Secret::new(INTERNAL_KEY.to_string());
    config
}

async fn seed_processing(db: &SqliteDatabase, key: &str) -> String {
    let flow = PaymentFlowApi::new(db.clone());
    let treasury = TreasuryClient::new(TreasuryConfig::default());
    let tx = flow
        .create_quoted_transaction(
            &QuoteRequest {
                flow_type: FlowType::Offramp,
                amount: 1000.0,
                currency: Currency::Kes,
                kes_per_usd: None,
            },
            USER,
            dp_common::MicroKes::from_kes(130),
            Duration::seconds(300),
            &treasury,
            false,
            None,
            Some(PayTarget::Phone { phone: "254700000000".into() }),
            Some(key.to_string()),
            json!(null),
        )
        .await
        .unwrap();
    flow.transition(&tx.transaction_id, TransactionStatus::AwaitingUserAuthorization, "a", "t").await.unwrap();
    flow.transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "s", "t").await.unwrap();
    flow.transition(&tx.transaction_id, TransactionStatus::MpesaProcessing, "p", "t").await.unwrap();
    tx.transaction_id.to_string()
}

/// Like [`seed_processing`], but the transaction never got past `mpesa_submitted`.
async fn seed_submitted(db: &SqliteDatabase, key: &str) -> String {
    let flow = PaymentFlowApi::new(db.clone());
    let treasury = TreasuryClient::new(TreasuryConfig::default());
    let tx = flow
        .create_quoted_transaction(
            &QuoteRequest {
                flow_type: FlowType::Offramp,
                amount: 1000.0,
                currency: Currency::Kes,
                kes_per_usd: None,
            },
            USER,
            dp_common::MicroKes::from_kes(130),
            Duration::seconds(300),
            &treasury,
            false,
            None,
            Some(PayTarget::Phone { phone: "254700000000".into() }),
            Some(key.to_string()),
            json!(null),
        )
        .await
        .unwrap();
    flow.transition(&tx.transaction_id, TransactionStatus::AwaitingUserAuthorization, "a", "t").await.unwrap();
    flow.transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "s", "t").await.unwrap();
    tx.transaction_id.to_string()
}

async fn post_reconcile(
    db: SqliteDatabase,
    config: ServerConfig,
    key: Option<&str>,
    body: Value,
) -> (StatusCode, Value) {
    let _ = env_logger::try_init().ok();
    let app =
        App::new().configure(configure_app(db, MockMobileMoney::accepting(), config));
    let app = test::init_service(app).await;
    let mut req = TestRequest::post().uri("/api/mpesa/internal/reconcile").set_json(body);
    if let Some(key) = key {
        req = req.insert_header(("X-DotPay-Internal-Key", key));
    }
    let res = test::call_service(&app, req.to_request()).await;
    let status = res.status();
    let body: Value = test::read_body_json(res).await;
    (status, body)
}

#[actix_web::test]
async fn reconcile_requires_the_internal_key() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let (status, _) = post_reconcile(db.clone(), config_with_key(), None, json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = post_reconcile(db, config_with_key(), Some("wrong-key"), json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn reconcile_fails_and_refunds_stuck_transactions() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx_id = seed_processing(&db, "offramp:reconcile-1").await;

    // A zero-minute cutoff captures the freshly updated transaction
    let (status, body) = post_reconcile(
        db.clone(),
        config_with_key(),
        Some(INTERNAL_KEY),
        json!({"maxAgeMinutes": 0}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let report = &body["data"];
    assert_eq!(report["scanned"], 1);
    assert_eq!(report["marked_failed"], 1);
    assert_eq!(report["refunded"], 1);

    let tx = db.fetch_transaction(&tx_id.into()).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Refunded);
    assert_eq!(tx.refund.status, RefundStatus::Completed);
    assert!(tx.refund.tx_hash.unwrap().starts_with("RF_"));
    assert!(tx.history.iter().any(|h| h.source == "reconcile"));
}

#[actix_web::test]
async fn reconcile_with_status_query_records_the_response() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx_id = seed_processing(&db, "offramp:reconcile-2").await;
    // Give the transaction a provider receipt so there is something to query
    let flow = PaymentFlowApi::new(db.clone());
    let merge = dotpay_engine::traits::CallbackMerge {
        result_code: None,
        result_code_num: None,
        result_desc: None,
        receipt_number: Some("SBC999AAA".to_string()),
        raw_callback: json!({}),
        provider_ids: Default::default(),
        received_at: chrono::Utc::now(),
    };
    flow.db().record_callback(&tx_id.clone().into(), &merge, None, "seed", "test").await.unwrap();

    let (status, body) = post_reconcile(
        db.clone(),
        config_with_key(),
        Some(INTERNAL_KEY),
        json!({"maxAgeMinutes": 0, "executeQuery": true}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"]["queried"], 1);
    assert_eq!(body["data"]["query_errors"], 0);

    let tx = db.fetch_transaction(&tx_id.into()).await.unwrap().unwrap();
    assert_eq!(tx.metadata["reconcile_query"]["ResponseCode"], "0");
}

#[actix_web::test]
async fn reconcile_by_transaction_id_forces_the_single_transaction() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let stuck = seed_processing(&db, "offramp:reconcile-3").await;
    let _other = seed_processing(&db, "offramp:reconcile-4").await;

    let (status, body) = post_reconcile(
        db.clone(),
        config_with_key(),
        Some(INTERNAL_KEY),
        json!({"maxAgeMinutes": 30, "transactionId": stuck}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"]["scanned"], 1);
    assert_eq!(body["data"]["marked_failed"], 1);
}

#[actix_web::test]
async fn reconcile_by_transaction_id_overrides_the_status_filter() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    // Never reached mpesa_processing; a cutoff sweep would skip it entirely
    let stuck = seed_submitted(&db, "offramp:reconcile-6").await;

    let (status, body) = post_reconcile(
        db.clone(),
        config_with_key(),
        Some(INTERNAL_KEY),
        json!({"maxAgeMinutes": 30, "transactionId": stuck}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"]["scanned"], 1);
    assert_eq!(body["data"]["marked_failed"], 1);
    assert_eq!(body["data"]["refunded"], 1);

    let tx = db.fetch_transaction(&stuck.into()).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Refunded);
    assert!(tx.history.iter().any(|h| h.source == "reconcile" && h.to == TransactionStatus::Failed));
}

#[actix_web::test]
async fn reconcile_leaves_fresh_transactions_alone() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx_id = seed_processing(&db, "offramp:reconcile-5").await;

    let (status, body) = post_reconcile(
        db.clone(),
        config_with_key(),
        Some(INTERNAL_KEY),
        json!({"maxAgeMinutes": 30}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["scanned"], 0);
    let tx = db.fetch_transaction(&tx_id.into()).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::MpesaProcessing);
}
