//! Builders for tests. Not intended for production use.

use chrono::{Duration, Utc};
use dp_common::{MicroKes, MicroUsd};
use serde_json::Value;

use crate::db_types::{
    Authorization,
    Currency,
    DarajaDetails,
    FlowType,
    OnchainFunding,
    PayTarget,
    Quote,
    RefundInfo,
    Transaction,
    TransactionId,
    TransactionStatus,
};

pub fn sample_quote() -> Quote {
    let now = Utc::now();
    Quote {
        quote_id: "q_0123456789abcdef0123456789abcdef".into(),
        currency: Currency::Kes,
        amount_requested: MicroKes::from_kes(1000).value(),
        amount_kes: MicroKes::from_kes(1000),
        amount_usd: MicroUsd::from(7_690_000),
        rate_kes_per_usd: MicroKes::from_kes(130),
        fee_kes: MicroKes::from_kes(18),
        network_fee_kes: MicroKes::from_kes(3),
        total_debit_kes: MicroKes::from_kes(1021),
        expected_receive_kes: MicroKes::from_kes(1000),
        expires_at: now + Duration::seconds(300),
        snapshot_at: now,
    }
}

pub fn sample_transaction(flow_type: FlowType, status: TransactionStatus) -> Transaction {
    let now = Utc::now();
    let target = match flow_type {
        FlowType::Onramp => PayTarget::Onramp { phone: "254700000000".into() },
        FlowType::Offramp => PayTarget::Phone { phone: "254700000000".into() },
        FlowType::Paybill => PayTarget::Paybill { paybill: "888880".into(), account_ref: "ACC-1".into() },
        FlowType::Buygoods => PayTarget::Buygoods { till: "55667".into(), account_ref: None },
    };
    Transaction {
        id: 1,
        transaction_id: TransactionId("dp_0123456789abcdef01234567".into()),
        flow_type,
        status,
        user_address: "0x00a329c0648769a73afac7f9381e08fb43dbea72".into(),
        business_id: None,
        idempotency_key: None,
        quote: sample_quote(),
        target: Some(target),
        authorization: Authorization::default(),
        onchain: if flow_type.is_funded() {
            OnchainFunding {
                required: true,
                expected_amount_usd: MicroUsd::from(7_850_000),
                verification_status: crate::db_types::VerificationStatus::Pending,
                ..Default::default()
            }
        } else {
            OnchainFunding::not_required()
        },
        daraja: DarajaDetails::default(),
        refund: RefundInfo::default(),
        history: Vec::new(),
        metadata: Value::Null,
        created_at: now,
        updated_at: now,
    }
}
