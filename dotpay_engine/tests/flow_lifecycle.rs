//! End-to-end flow tests over the in-memory store: initiate, submit, callbacks, refunds.

use chrono::{Duration, Utc};
use dp_common::MicroKes;
use dotpay_engine::{
    db_types::{Currency, FlowType, PayTarget, RefundStatus, TransactionStatus},
    quotes::QuoteRequest,
    traits::{CallbackMerge, DarajaSubmission, PaymentDatabase, ProviderIdQuery},
    treasury::{TreasuryClient, TreasuryConfig},
    CallbackKind,
    CallbackOutcome,
    FollowUp,
    PaymentFlowApi,
    SqliteDatabase,
};
use serde_json::json;

const USER: &str = "0x00a329c0648769a73afac7f9381e08fb43dbea72";

async fn api() -> PaymentFlowApi<SqliteDatabase> {
    PaymentFlowApi::new(SqliteDatabase::new_in_memory().await.unwrap())
}

fn sandbox_treasury() -> TreasuryClient {
    TreasuryClient::new(TreasuryConfig::default())
}

fn offramp_request() -> QuoteRequest {
    QuoteRequest { flow_type: FlowType::Offramp, amount: 1000.0, currency: Currency::Kes, kes_per_usd: None }
}

async fn submitted_offramp(api: &PaymentFlowApi<SqliteDatabase>) -> dotpay_engine::db_types::Transaction {
    let tx = api
        .create_quoted_transaction(
            &offramp_request(),
            USER,
            MicroKes::from_kes(130),
            Duration::seconds(300),
            &sandbox_treasury(),
            false,
            None,
            Some(PayTarget::Phone { phone: "254700000000".into() }),
            Some("offramp:flow-test-001".to_string()),
            json!({"source": "test"}),
        )
        .await
        .unwrap();
    let tx = api
        .transition(&tx.transaction_id, TransactionStatus::AwaitingUserAuthorization, "auth", "test")
        .await
        .unwrap();
    let tx =
        api.transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "submit", "test").await.unwrap();
    let submission = DarajaSubmission {
        raw_request: json!({"CommandID": "BusinessPayment"}),
        raw_response: json!({"ResponseCode": "0", "ConversationID": "AG_1"}),
        response_code: Some("0".to_string()),
        response_description: Some("Accept the service request successfully.".to_string()),
        provider_ids: ProviderIdQuery {
            conversation_id: Some("AG_1".to_string()),
            originator_conversation_id: Some("29112-1".to_string()),
            ..Default::default()
        },
    };
    api.record_submission(&tx.transaction_id, submission, true).await.unwrap()
}

fn b2c_result(code: &str) -> CallbackMerge {
    CallbackMerge {
        result_code: Some(code.to_string()),
        result_code_num: code.parse().ok(),
        result_desc: Some(if code == "0" { "Success" } else { "Failure" }.to_string()),
        receipt_number: Some("SBC123XYZ".to_string()),
        raw_callback: json!({"Result": {"ResultCode": code}}),
        provider_ids: ProviderIdQuery { conversation_id: Some("AG_1".to_string()), ..Default::default() },
        received_at: Utc::now(),
    }
}

#[tokio::test]
async fn quote_issue_and_bind() {
    let api = api().await;
    let tx = api
        .create_quoted_transaction(
            &offramp_request(),
            USER,
            MicroKes::from_kes(130),
            Duration::seconds(300),
            &sandbox_treasury(),
            false,
            None,
            None,
            None,
            json!(null),
        )
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Quoted);
    assert_eq!(tx.history.len(), 1);
    assert!(tx.target.is_none());

    // Bindable by the owner
    let bound = api.bind_quote(&tx.quote.quote_id, USER).await.unwrap();
    assert_eq!(bound.transaction_id, tx.transaction_id);

    // Not by anyone else
    assert!(api.bind_quote(&tx.quote.quote_id, "0xsomeoneelse").await.is_err());

    // Attach the initiation and it can no longer be re-bound
    api.attach_initiation(
        &tx.transaction_id,
        "offramp:bind-test-01",
        &PayTarget::Phone { phone: "254700000000".into() },
        json!({"source": "test"}),
    )
    .await
    .unwrap();
    assert!(api.bind_quote(&tx.quote.quote_id, USER).await.is_err());
}

#[tokio::test]
async fn expired_quote_is_rejected() {
    let api = api().await;
    let tx = api
        .create_quoted_transaction(
            &offramp_request(),
            USER,
            MicroKes::from_kes(130),
            Duration::milliseconds(-10),
            &sandbox_treasury(),
            false,
            None,
            None,
            None,
            json!(null),
        )
        .await
        .unwrap();
    let err = api.bind_quote(&tx.quote.quote_id, USER).await.unwrap_err();
    assert!(err.to_string().contains("expired"), "unexpected error: {err}");
}

#[tokio::test]
async fn limits_are_enforced() {
    let api = api().await;
    let tx = api
        .create_quoted_transaction(
            &offramp_request(),
            USER,
            MicroKes::from_kes(130),
            Duration::seconds(300),
            &sandbox_treasury(),
            false,
            None,
            None,
            None,
            json!(null),
        )
        .await
        .unwrap();

    let generous = dotpay_engine::FlowLimits {
        max_txn_kes: MicroKes::from_kes(150_000),
        max_daily_kes: MicroKes::from_kes(500_000),
    };
    api.check_limits(&tx, &generous).await.unwrap();

    let tight = dotpay_engine::FlowLimits {
        max_txn_kes: MicroKes::from_kes(500),
        max_daily_kes: MicroKes::from_kes(500_000),
    };
    assert!(api.check_limits(&tx, &tight).await.is_err());

    // A second transaction pushes the first over the daily cap
    let tx2 = api
        .create_quoted_transaction(
            &offramp_request(),
            USER,
            MicroKes::from_kes(130),
            Duration::seconds(300),
            &sandbox_treasury(),
            false,
            None,
            None,
            None,
            json!(null),
        )
        .await
        .unwrap();
    let daily = dotpay_engine::FlowLimits {
        max_txn_kes: MicroKes::from_kes(150_000),
        max_daily_kes: MicroKes::from_kes(1500),
    };
    assert!(api.check_limits(&tx2, &daily).await.is_err());
}

#[tokio::test]
async fn successful_b2c_callback_finalizes_the_payout() {
    let api = api().await;
    let tx = submitted_offramp(&api).await;
    assert_eq!(tx.status, TransactionStatus::MpesaProcessing);

    let outcome = api.apply_callback(CallbackKind::B2cResult, None, b2c_result("0")).await.unwrap();
    let CallbackOutcome::Applied { transaction, follow_up } = outcome else {
        panic!("callback was not applied");
    };
    assert_eq!(transaction.status, TransactionStatus::Succeeded);
    assert_eq!(follow_up, FollowUp::None);
    assert_eq!(transaction.daraja.receipt_number.as_deref(), Some("SBC123XYZ"));
    assert!(transaction.daraja.callback_received_at.is_some());
}

#[tokio::test]
async fn replayed_callback_is_dropped_after_the_first() {
    let api = api().await;
    let tx = submitted_offramp(&api).await;

    let first = api.apply_callback(CallbackKind::B2cResult, None, b2c_result("0")).await.unwrap();
    assert!(matches!(first, CallbackOutcome::Applied { .. }));
    let second = api.apply_callback(CallbackKind::B2cResult, None, b2c_result("0")).await.unwrap();
    assert!(matches!(second, CallbackOutcome::Duplicate));

    // Exactly one terminal transition and one dedup row
    let reloaded = api.db().fetch_transaction(&tx.transaction_id).await.unwrap().unwrap();
    let terminal_hops =
        reloaded.history.iter().filter(|h| h.to == TransactionStatus::Succeeded).count();
    assert_eq!(terminal_hops, 1);
    let events = api.db().dedup_events_for(&tx.transaction_id).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn failed_payout_triggers_a_simulated_refund() {
    let api = api().await;
    let tx = submitted_offramp(&api).await;

    let outcome = api.apply_callback(CallbackKind::B2cResult, None, b2c_result("2001")).await.unwrap();
    let CallbackOutcome::Applied { transaction, follow_up } = outcome else {
        panic!("callback was not applied");
    };
    assert_eq!(transaction.status, TransactionStatus::Failed);
    assert_eq!(follow_up, FollowUp::ScheduleRefund);

    // Treasury unconfigured + sandbox: refund completes in simulated mode
    let refunded = api
        .schedule_auto_refund(&tx.transaction_id, &sandbox_treasury(), "provider reported failure")
        .await
        .unwrap()
        .expect("refund should apply");
    assert_eq!(refunded.status, TransactionStatus::Refunded);
    assert_eq!(refunded.refund.status, RefundStatus::Completed);
    let reference = refunded.refund.tx_hash.unwrap();
    assert!(reference.starts_with("RF_"), "unexpected reference {reference}");
    assert!(refunded.refund.initiated_at.is_some());
    assert!(refunded.refund.completed_at.is_some());

    // A second attempt is a no-op
    let again = api
        .schedule_auto_refund(&tx.transaction_id, &sandbox_treasury(), "again")
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn refund_is_a_noop_for_onramp() {
    let api = api().await;
    let tx = api
        .create_quoted_transaction(
            &QuoteRequest {
                flow_type: FlowType::Onramp,
                amount: 500.0,
                currency: Currency::Kes,
                kes_per_usd: None,
            },
            USER,
            MicroKes::from_kes(130),
            Duration::seconds(300),
            &sandbox_treasury(),
            false,
            None,
            Some(PayTarget::Onramp { phone: "254700000000".into() }),
            Some("onramp:refund-noop-01".to_string()),
            json!(null),
        )
        .await
        .unwrap();
    api.transition(&tx.transaction_id, TransactionStatus::Failed, "rejected", "test").await.unwrap();
    let result = api
        .schedule_auto_refund(&tx.transaction_id, &sandbox_treasury(), "rejected")
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn late_callback_on_terminal_transaction_keeps_status() {
    let api = api().await;
    let tx = submitted_offramp(&api).await;
    api.apply_callback(CallbackKind::B2cResult, None, b2c_result("0")).await.unwrap();

    // A late timeout for the same transaction must not un-succeed it
    let timeout = CallbackMerge {
        result_code: None,
        result_code_num: None,
        result_desc: Some("The transaction timed out".to_string()),
        receipt_number: None,
        raw_callback: json!({"Result": {"ResultType": 1}}),
        provider_ids: ProviderIdQuery { conversation_id: Some("AG_1".to_string()), ..Default::default() },
        received_at: Utc::now(),
    };
    let outcome = api.apply_callback(CallbackKind::B2cTimeout, None, timeout).await.unwrap();
    let CallbackOutcome::Applied { transaction, follow_up } = outcome else {
        panic!("late callback should still be recorded");
    };
    assert_eq!(transaction.status, TransactionStatus::Succeeded);
    assert_eq!(follow_up, FollowUp::None);
    assert_eq!(api.db().dedup_events_for(&tx.transaction_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn callback_for_unknown_transaction_is_dropped() {
    let api = api().await;
    let merge = b2c_result("0");
    let outcome = api.apply_callback(CallbackKind::B2cResult, Some("dp_missing"), merge).await.unwrap();
    assert!(matches!(outcome, CallbackOutcome::NotFound));
}

#[tokio::test]
async fn onramp_stk_success_moves_to_processing_and_requests_settlement() {
    let api = api().await;
    let tx = api
        .create_quoted_transaction(
            &QuoteRequest {
                flow_type: FlowType::Onramp,
                amount: 1000.0,
                currency: Currency::Kes,
                kes_per_usd: None,
            },
            USER,
            MicroKes::from_kes(130),
            Duration::seconds(300),
            &sandbox_treasury(),
            false,
            None,
            Some(PayTarget::Onramp { phone: "254700000000".into() }),
            Some("onramp:stk-test-001".to_string()),
            json!(null),
        )
        .await
        .unwrap();
    api.transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "submit", "test").await.unwrap();

    let merge = CallbackMerge {
        result_code: Some("0".to_string()),
        result_code_num: Some(0),
        result_desc: Some("The service request is processed successfully.".to_string()),
        receipt_number: Some("SBX12345".to_string()),
        raw_callback: json!({"Body": {"stkCallback": {"ResultCode": 0}}}),
        provider_ids: ProviderIdQuery {
            checkout_request_id: Some("ws_CO_123".to_string()),
            merchant_request_id: Some("29115-1".to_string()),
            ..Default::default()
        },
        received_at: Utc::now(),
    };
    let outcome = api
        .apply_callback(CallbackKind::Stk, Some(tx.transaction_id.as_str()), merge)
        .await
        .unwrap();
    let CallbackOutcome::Applied { transaction, follow_up } = outcome else {
        panic!("callback not applied");
    };
    assert_eq!(transaction.status, TransactionStatus::MpesaProcessing);
    assert_eq!(follow_up, FollowUp::SettleOnrampCredit);
}
