//! Storage-level tests against an in-memory SQLite database.

use chrono::{Duration, Utc};
use dp_common::MicroKes;
use dotpay_engine::{
    db_types::{
        EventSource,
        FlowType,
        NewDedupEvent,
        NewTransaction,
        OnchainFunding,
        PayTarget,
        RefundInfo,
        RefundStatus,
        TransactionStatus,
        VerificationStatus,
    },
    test_utils::sample_quote,
    traits::{PaymentDatabase, ProviderIdQuery, TransactionQueryFilter},
    SqliteDatabase,
};
use serde_json::json;

const USER: &str = "0x00a329c0648769a73afac7f9381e08fb43dbea72";

fn new_offramp(key: Option<&str>) -> NewTransaction {
    NewTransaction::new(
        FlowType::Offramp,
        USER.to_string(),
        sample_quote(),
        Some(PayTarget::Phone { phone: "254700000000".into() }),
    )
    .with_idempotency_key(key.map(String::from))
}

#[tokio::test]
async fn insert_and_fetch_round_trip() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let new = new_offramp(Some("offramp:test-key-001"));
    let quote_id = new.quote.quote_id.clone();
    let tx = db.insert_transaction(new).await.unwrap();

    assert_eq!(tx.status, TransactionStatus::Created);
    assert_eq!(tx.flow_type, FlowType::Offramp);
    assert_eq!(tx.user_address, USER);
    assert!(tx.history.is_empty());

    let fetched = db.fetch_transaction(&tx.transaction_id).await.unwrap().unwrap();
    assert_eq!(fetched.transaction_id, tx.transaction_id);
    assert_eq!(fetched.quote.quote_id, quote_id);
    assert_eq!(fetched.quote.total_debit_kes, MicroKes::from_kes(1021));
    assert_eq!(fetched.target, Some(PayTarget::Phone { phone: "254700000000".into() }));

    let by_quote = db.fetch_by_quote_id(&quote_id).await.unwrap().unwrap();
    assert_eq!(by_quote.transaction_id, tx.transaction_id);

    let by_key = db
        .fetch_by_idempotency_key(USER, FlowType::Offramp, "offramp:test-key-001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_key.transaction_id, tx.transaction_id);
}

#[tokio::test]
async fn transitions_persist_history() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx = db.insert_transaction(new_offramp(None)).await.unwrap();

    let tx = db.transition(&tx.transaction_id, TransactionStatus::Quoted, "quote issued", "quote").await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Quoted);
    let tx = db
        .transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "submit", "test")
        .await
        .unwrap();
    assert_eq!(tx.history.len(), 2);
    assert_eq!(tx.history[1].from, TransactionStatus::Quoted);
    assert_eq!(tx.history[1].to, TransactionStatus::MpesaSubmitted);

    // Same-state transition is a no-op and appends nothing
    let tx = db
        .transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "again", "test")
        .await
        .unwrap();
    assert_eq!(tx.history.len(), 2);

    // Illegal transition is rejected and persists nothing
    let err = db.transition(&tx.transaction_id, TransactionStatus::Refunded, "nope", "test").await;
    assert!(err.is_err());
    let reloaded = db.fetch_transaction(&tx.transaction_id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TransactionStatus::MpesaSubmitted);
    assert_eq!(reloaded.history.len(), 2);
}

#[tokio::test]
async fn duplicate_idempotency_keys_are_rejected_by_the_index() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    db.insert_transaction(new_offramp(Some("offramp:dup-key-01"))).await.unwrap();
    let err = db.insert_transaction(new_offramp(Some("offramp:dup-key-01"))).await;
    assert!(err.is_err());
    // Same key on a different flow is fine
    let onramp = NewTransaction::new(
        FlowType::Onramp,
        USER.to_string(),
        sample_quote(),
        Some(PayTarget::Onramp { phone: "254700000000".into() }),
    )
    .with_idempotency_key(Some("offramp:dup-key-01".to_string()));
    assert!(db.insert_transaction(onramp).await.is_ok());
}

#[tokio::test]
async fn funding_tx_hash_is_unique_across_transactions() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let a = db.insert_transaction(new_offramp(None)).await.unwrap();
    let b = db.insert_transaction(new_offramp(None)).await.unwrap();
    let hash = format!("0x{}", "ab".repeat(32));

    let onchain = OnchainFunding {
        required: true,
        tx_hash: Some(hash.clone()),
        verification_status: VerificationStatus::Verified,
        ..Default::default()
    };
    db.update_funding(&a.transaction_id, &onchain).await.unwrap();

    let in_use = db.funding_tx_in_use(&hash, &b.transaction_id).await.unwrap();
    assert_eq!(in_use, Some(a.transaction_id.clone()));
    let not_in_use = db.funding_tx_in_use(&hash, &a.transaction_id).await.unwrap();
    assert!(not_in_use.is_none());

    // The partial unique index also rejects a second writer
    assert!(db.update_funding(&b.transaction_id, &onchain).await.is_err());
}

#[tokio::test]
async fn dedup_events_are_inserted_once() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx = db.insert_transaction(new_offramp(None)).await.unwrap();
    let event = NewDedupEvent {
        event_key: format!("b2c_result:{}:AG_1:0", tx.transaction_id),
        transaction_id: tx.transaction_id.clone(),
        source: EventSource::Webhook,
        event_type: "b2c_result".to_string(),
        payload: json!({"ResultCode": 0}),
    };
    assert!(db.insert_dedup_event(&event).await.unwrap());
    assert!(!db.insert_dedup_event(&event).await.unwrap());
    let events = db.dedup_events_for(&tx.transaction_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "b2c_result");
}

#[tokio::test]
async fn provider_id_lookup_finds_the_transaction() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx = db.insert_transaction(new_offramp(None)).await.unwrap();
    let submission = dotpay_engine::traits::DarajaSubmission {
        raw_request: json!({"CommandID": "BusinessPayment"}),
        raw_response: json!({"ResponseCode": "0"}),
        response_code: Some("0".to_string()),
        response_description: None,
        provider_ids: ProviderIdQuery {
            conversation_id: Some("AG_20260301_123".to_string()),
            originator_conversation_id: Some("29112-34801843-1".to_string()),
            ..Default::default()
        },
    };
    let tx = db.transition(&tx.transaction_id, TransactionStatus::Quoted, "q", "t").await.unwrap();
    let tx = db.transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "s", "t").await.unwrap();
    db.record_submission(&tx.transaction_id, &submission, TransactionStatus::MpesaProcessing, "accepted", "mpesa")
        .await
        .unwrap();

    let found = db
        .fetch_by_provider_ids(&ProviderIdQuery {
            conversation_id: Some("AG_20260301_123".to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.transaction_id, tx.transaction_id);
    assert_eq!(found.status, TransactionStatus::MpesaProcessing);
    assert_eq!(found.daraja.conversation_id.as_deref(), Some("AG_20260301_123"));

    assert!(db.fetch_by_provider_ids(&ProviderIdQuery::default()).await.unwrap().is_none());
}

#[tokio::test]
async fn daily_volume_skips_failed_and_excluded_transactions() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let a = db.insert_transaction(new_offramp(None)).await.unwrap();
    let b = db.insert_transaction(new_offramp(None)).await.unwrap();
    let c = db.insert_transaction(new_offramp(None)).await.unwrap();
    db.transition(&b.transaction_id, TransactionStatus::Failed, "x", "t").await.unwrap();

    let since = Utc::now() - Duration::hours(1);
    // b is failed; c is the transaction being initiated
    let volume = db.volume_kes_since(USER, since, &c.transaction_id).await.unwrap();
    assert_eq!(volume, a.quote.amount_kes);

    let volume = db.volume_kes_since("0xother", since, &c.transaction_id).await.unwrap();
    assert_eq!(volume, MicroKes::from(0));
}

#[tokio::test]
async fn search_filters_by_flow_status_and_limit() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    for _ in 0..3 {
        db.insert_transaction(new_offramp(None)).await.unwrap();
    }
    let onramp = NewTransaction::new(
        FlowType::Onramp,
        USER.to_string(),
        sample_quote(),
        Some(PayTarget::Onramp { phone: "254700000000".into() }),
    );
    db.insert_transaction(onramp).await.unwrap();

    let all = db
        .search_transactions(&TransactionQueryFilter {
            user_address: Some(USER.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 4);

    let offramps = db
        .search_transactions(&TransactionQueryFilter {
            user_address: Some(USER.to_string()),
            flow_type: Some(FlowType::Offramp),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(offramps.len(), 3);

    let limited = db
        .search_transactions(&TransactionQueryFilter {
            user_address: Some(USER.to_string()),
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);

    let created = db
        .search_transactions(&TransactionQueryFilter {
            status: Some(TransactionStatus::Created),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(created.len(), 4);
}

#[tokio::test]
async fn refund_bookkeeping_updates_atomically_with_status() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx = db.insert_transaction(new_offramp(None)).await.unwrap();
    db.transition(&tx.transaction_id, TransactionStatus::Failed, "payout failed", "test").await.unwrap();

    let refund = RefundInfo {
        status: RefundStatus::Pending,
        reason: Some("payout failed".to_string()),
        tx_hash: None,
        initiated_at: Some(Utc::now()),
        completed_at: None,
    };
    let tx = db
        .update_refund(&tx.transaction_id, &refund, Some(TransactionStatus::RefundPending), "refund", "refund")
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::RefundPending);
    assert_eq!(tx.refund.status, RefundStatus::Pending);
    assert_eq!(tx.refund.reason.as_deref(), Some("payout failed"));
}

#[tokio::test]
async fn stuck_processing_selects_by_cutoff() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let tx = db.insert_transaction(new_offramp(None)).await.unwrap();
    db.transition(&tx.transaction_id, TransactionStatus::Quoted, "q", "t").await.unwrap();
    db.transition(&tx.transaction_id, TransactionStatus::MpesaSubmitted, "s", "t").await.unwrap();
    db.transition(&tx.transaction_id, TransactionStatus::MpesaProcessing, "p", "t").await.unwrap();

    // Updated just now, so a cutoff in the past finds nothing
    let stale = db.stuck_processing(Utc::now() - Duration::minutes(30), 100).await.unwrap();
    assert!(stale.is_empty());

    // A cutoff in the future captures it
    let stale = db.stuck_processing(Utc::now() + Duration::seconds(5), 100).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].transaction_id, tx.transaction_id);
}

#[tokio::test]
async fn metadata_merge_preserves_existing_keys() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    let new = new_offramp(None).with_metadata(json!({"source": "api"}));
    let tx = db.insert_transaction(new).await.unwrap();
    db.append_metadata(&tx.transaction_id, "reconcile_query", json!({"ResultCode": "0"})).await.unwrap();
    let tx = db.fetch_transaction(&tx.transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.metadata["source"], "api");
    assert_eq!(tx.metadata["reconcile_query"]["ResultCode"], "0");
}

#[tokio::test]
async fn pin_hashes_round_trip() {
    let db = SqliteDatabase::new_in_memory().await.unwrap();
    assert!(db.pin_hash_for(USER).await.unwrap().is_none());
    db.set_pin_hash(USER, "scrypt$c2FsdA$aGFzaA").await.unwrap();
    assert_eq!(db.pin_hash_for(USER).await.unwrap().as_deref(), Some("scrypt$c2FsdA$aGFzaA"));
    db.set_pin_hash(USER, "scrypt$b$c").await.unwrap();
    assert_eq!(db.pin_hash_for(USER).await.unwrap().as_deref(), Some("scrypt$b$c"));
}
