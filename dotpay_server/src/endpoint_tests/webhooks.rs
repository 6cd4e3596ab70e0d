use actix_web::{http::StatusCode, test, test::TestRequest, App};
use chrono::Duration;
use dotpay_engine::{
    db_types::{Currency, FlowType, PayTarget, TransactionStatus},
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

/// Seed an offramp sitting in `mpesa_processing`, as if a B2C submission had been accepted.
async fn seed_processing_offramp(db: &SqliteDatabase) -> String {
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
            Some("offramp:webhook-seed-1".to_string()),
            json!(null),
        )
        .await
        .unwrap();
    flow.transition(&tx.transaction_id, TransactionStatus::AwaitingUserAuthorization, "auth", "test")
        .await
        .unwrap();
    flow.transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "submit", "test").await.unwrap();
    flow.transition(&tx.transaction_id, TransactionStatus::MpesaProcessing, "accepted", "test")
        .await
        .unwrap();
    tx.transaction_id.to_string()
}

fn b2c_success_payload() -> Value {
    json!({
        "Result": {
            "ResultType": 0,
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "OriginatorConversationID": "10571-7910404-1",
            "ConversationID": "AG_20260301_000001",
            "TransactionID": "SBC123XYZ",
            "ResultParameters": {
                "ResultParameter": [
                    {"Key": "TransactionReceipt", "Value": "SBC123XYZ"}
                ]
            }
        }
    })
}

/// POST a webhook against a fresh app over the shared database. Webhooks are unauthenticated, so
/// no bearer token is attached.
async fn post_webhook(
    db: &SqliteDatabase,
    config: &ServerConfig,
    uri: &str,
    payload: &Value,
) -> (StatusCode, Value) {
    let app = App::new().configure(configure_app(
        db.clone(),
        MockMobileMoney::accepting(),
        config.clone(),
    ));
    let app = test::init_service(app).await;
    let req = TestRequest::post().uri(uri).set_json(payload).to_request();
    let res = test::call_service(&app, req).await;
    let status = res.status();
    let body: Value = test::read_body_json(res).await;
    (status, body)
}

#[actix_web::test]
async fn b2c_result_success_finalizes_and_acks() {
    let _ = env_logger::try_init().ok();
    let config = test_config();
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx_id = seed_processing_offramp(&db).await;

    let uri = format!("/api/mpesa/webhooks/b2c/result?tx={tx_id}");
    let (status, body) = post_webhook(&db, &config, &uri, &b2c_success_payload()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ResultCode": 0, "ResultDesc": "Accepted"}));

    let tx = db.fetch_transaction(&tx_id.clone().into()).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Succeeded);
    assert_eq!(tx.daraja.receipt_number.as_deref(), Some("SBC123XYZ"));
    assert!(tx.daraja.callback_received_at.is_some());
}

#[actix_web::test]
async fn replayed_webhook_applies_once() {
    let config = test_config();
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx_id = seed_processing_offramp(&db).await;

    let uri = format!("/api/mpesa/webhooks/b2c/result?tx={tx_id}");
    let (first, _) = post_webhook(&db, &config, &uri, &b2c_success_payload()).await;
    let (second, body) = post_webhook(&db, &config, &uri, &b2c_success_payload()).await;
    assert_eq!(first, StatusCode::OK);
    // The replay is acknowledged identically but applied as a no-op
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body["ResultCode"], 0);

    let tx = db.fetch_transaction(&tx_id.clone().into()).await.unwrap().unwrap();
    let terminal_hops = tx.history.iter().filter(|h| h.to == TransactionStatus::Succeeded).count();
    assert_eq!(terminal_hops, 1);
    let events = db.dedup_events_for(&tx.transaction_id).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[actix_web::test]
async fn b2c_timeout_fails_and_refunds_in_simulated_mode() {
    let config = test_config();
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx_id = seed_processing_offramp(&db).await;

    let payload = json!({
        "Result": {
            "ResultType": 1,
            "ResultCode": 1,
            "ResultDesc": "The service request timed out.",
            "ConversationID": "AG_20260301_000001"
        }
    });
    let uri = format!("/api/mpesa/webhooks/b2c/timeout?tx={tx_id}");
    let (status, _) = post_webhook(&db, &config, &uri, &payload).await;
    assert_eq!(status, StatusCode::OK);

    // The refund runs on a spawned task; give it a moment.
    for _ in 0..50 {
        let tx = db.fetch_transaction(&tx_id.clone().into()).await.unwrap().unwrap();
        if tx.status == TransactionStatus::Refunded {
            let reference = tx.refund.tx_hash.unwrap();
            assert!(reference.starts_with("RF_"), "unexpected refund reference {reference}");
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("transaction was not refunded");
}

#[actix_web::test]
async fn unknown_callbacks_are_acknowledged_and_dropped() {
    let config = test_config();
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let (status, body) =
        post_webhook(&db, &config, "/api/mpesa/webhooks/b2c/result", &b2c_success_payload()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ResultCode"], 0);
}

#[actix_web::test]
async fn webhook_secret_mismatch_drops_the_callback() {
    let mut config = test_config();
    config.webhook_secret = Some(Secret::new("hook-secret".to_string()));
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx_id = seed_processing_offramp(&db).await;

    // Wrong secret: acked, but not applied
    let uri = format!("/api/mpesa/webhooks/b2c/result?tx={tx_id}&secret=wrong");
    let (status, _) = post_webhook(&db, &config, &uri, &b2c_success_payload()).await;
    assert_eq!(status, StatusCode::OK);
    let tx = db.fetch_transaction(&tx_id.clone().into()).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::MpesaProcessing);

    // Correct secret via query parameter: applied
    let uri = format!("/api/mpesa/webhooks/b2c/result?tx={tx_id}&secret=hook-secret");
    let (status, _) = post_webhook(&db, &config, &uri, &b2c_success_payload()).await;
    assert_eq!(status, StatusCode::OK);
    let tx = db.fetch_transaction(&tx_id.into()).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Succeeded);
}

#[actix_web::test]
async fn stk_failure_on_onramp_fails_without_refund() {
    let config = test_config();
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    // Seed an onramp in mpesa_submitted
    let flow = PaymentFlowApi::new(db.clone());
    let treasury = TreasuryClient::new(TreasuryConfig::default());
    let tx = flow
        .create_quoted_transaction(
            &QuoteRequest {
                flow_type: FlowType::Onramp,
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
            Some(PayTarget::Onramp { phone: "254700000000".into() }),
            Some("onramp:webhook-seed-1".to_string()),
            json!(null),
        )
        .await
        .unwrap();
    flow.transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "submit", "test").await.unwrap();

    let payload = json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-1",
                "CheckoutRequestID": "ws_CO_1",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user."
            }
        }
    });
    let uri = format!("/api/mpesa/webhooks/stk?tx={}", tx.transaction_id);
    let (status, _) = post_webhook(&db, &config, &uri, &payload).await;
    assert_eq!(status, StatusCode::OK);

    let reloaded = db.fetch_transaction(&tx.transaction_id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TransactionStatus::Failed);
    // Onramp is not funded: no refund may be attempted
    assert_eq!(reloaded.refund.status, dotpay_engine::db_types::RefundStatus::None);
    assert_eq!(reloaded.daraja.result_code.as_deref(), Some("1032"));
}
