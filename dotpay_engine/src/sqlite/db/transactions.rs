use chrono::{DateTime, Utc};
use dp_common::{MicroKes, MicroUsd};
use log::{debug, trace};
use serde_json::Value;
use sqlx::{FromRow, QueryBuilder, SqliteConnection};

use crate::{
    db_types::{
        Authorization,
        Currency,
        DarajaDetails,
        FlowType,
        HistoryEntry,
        NewTransaction,
        OnchainFunding,
        PayTarget,
        Quote,
        RefundInfo,
        RefundStatus,
        Transaction,
        TransactionId,
        TransactionStatus,
        VerificationStatus,
    },
    traits::{CallbackMerge, DarajaSubmission, PaymentDatabaseError, ProviderIdQuery, TransactionQueryFilter},
};

/// The flat persistence image of a [`Transaction`].
#[derive(Debug, FromRow)]
pub struct TransactionRow {
    pub id: i64,
    pub transaction_id: TransactionId,
    pub flow_type: FlowType,
    pub status: TransactionStatus,
    pub user_address: String,
    pub business_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub quote_id: String,
    pub currency: Currency,
    pub amount_requested: i64,
    pub amount_kes: MicroKes,
    pub amount_usd: MicroUsd,
    pub rate_kes_per_usd: MicroKes,
    pub fee_kes: MicroKes,
    pub network_fee_kes: MicroKes,
    pub total_debit_kes: MicroKes,
    pub expected_receive_kes: MicroKes,
    pub quote_expires_at: DateTime<Utc>,
    pub quote_snapshot_at: DateTime<Utc>,
    pub target_phone: Option<String>,
    pub target_paybill: Option<String>,
    pub target_till: Option<String>,
    pub target_account_ref: Option<String>,
    pub pin_verified: bool,
    pub wallet_signature: Option<String>,
    pub signer_address: Option<String>,
    pub auth_nonce: Option<String>,
    pub auth_signed_at: Option<String>,
    pub onchain_required: bool,
    pub onchain_tx_hash: Option<String>,
    pub onchain_chain_id: Option<i64>,
    pub onchain_token: Option<String>,
    pub onchain_treasury: Option<String>,
    pub expected_amount_units: Option<String>,
    pub expected_amount_usd: MicroUsd,
    pub funded_amount_units: Option<String>,
    pub funded_amount_usd: Option<MicroUsd>,
    pub onchain_from: Option<String>,
    pub onchain_log_index: Option<i64>,
    pub verification_status: VerificationStatus,
    pub verification_error: Option<String>,
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub originator_conversation_id: Option<String>,
    pub response_code: Option<String>,
    pub result_code: Option<String>,
    pub result_code_num: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub daraja_raw_request: Option<String>,
    pub daraja_raw_response: Option<String>,
    pub daraja_raw_callback: Option<String>,
    pub callback_received_at: Option<DateTime<Utc>>,
    pub refund_status: RefundStatus,
    pub refund_reason: Option<String>,
    pub refund_tx_hash: Option<String>,
    pub refund_initiated_at: Option<DateTime<Utc>>,
    pub refund_completed_at: Option<DateTime<Utc>>,
    pub history: String,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_units(units: Option<&String>) -> Result<Option<u128>, PaymentDatabaseError> {
    units
        .map(|s| s.parse::<u128>().map_err(|e| PaymentDatabaseError::Encoding(format!("bad unit amount {s}: {e}"))))
        .transpose()
}

fn parse_json(doc: Option<&String>) -> Result<Option<Value>, PaymentDatabaseError> {
    doc.map(|s| serde_json::from_str(s).map_err(|e| PaymentDatabaseError::Encoding(e.to_string()))).transpose()
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = PaymentDatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        // Quote-only rows have no target columns yet.
        let target = match row.flow_type {
            FlowType::Onramp => row.target_phone.clone().map(|phone| PayTarget::Onramp { phone }),
            FlowType::Offramp => row.target_phone.clone().map(|phone| PayTarget::Phone { phone }),
            FlowType::Paybill => row.target_paybill.clone().map(|paybill| PayTarget::Paybill {
                paybill,
                account_ref: row.target_account_ref.clone().unwrap_or_default(),
            }),
            FlowType::Buygoods => row.target_till.clone().map(|till| PayTarget::Buygoods {
                till,
                account_ref: row.target_account_ref.clone(),
            }),
        };
        let history: Vec<HistoryEntry> =
            serde_json::from_str(&row.history).map_err(|e| PaymentDatabaseError::Encoding(e.to_string()))?;
        Ok(Transaction {
            id: row.id,
            transaction_id: row.transaction_id,
            flow_type: row.flow_type,
            status: row.status,
            user_address: row.user_address,
            business_id: row.business_id,
            idempotency_key: row.idempotency_key,
            quote: Quote {
                quote_id: row.quote_id,
                currency: row.currency,
                amount_requested: row.amount_requested,
                amount_kes: row.amount_kes,
                amount_usd: row.amount_usd,
                rate_kes_per_usd: row.rate_kes_per_usd,
                fee_kes: row.fee_kes,
                network_fee_kes: row.network_fee_kes,
                total_debit_kes: row.total_debit_kes,
                expected_receive_kes: row.expected_receive_kes,
                expires_at: row.quote_expires_at,
                snapshot_at: row.quote_snapshot_at,
            },
            target,
            authorization: Authorization {
                pin_verified: row.pin_verified,
                wallet_signature: row.wallet_signature,
                signer_address: row.signer_address,
                nonce: row.auth_nonce,
                signed_at: row.auth_signed_at,
            },
            onchain: OnchainFunding {
                required: row.onchain_required,
                tx_hash: row.onchain_tx_hash,
                chain_id: row.onchain_chain_id.map(|v| v as u64),
                token: row.onchain_token,
                treasury: row.onchain_treasury,
                expected_amount_units: parse_units(row.expected_amount_units.as_ref())?,
                expected_amount_usd: row.expected_amount_usd,
                funded_amount_units: parse_units(row.funded_amount_units.as_ref())?,
                funded_amount_usd: row.funded_amount_usd,
                from_address: row.onchain_from,
                log_index: row.onchain_log_index.map(|v| v as u64),
                verification_status: row.verification_status,
                verification_error: row.verification_error,
            },
            daraja: DarajaDetails {
                merchant_request_id: row.merchant_request_id,
                checkout_request_id: row.checkout_request_id,
                conversation_id: row.conversation_id,
                originator_conversation_id: row.originator_conversation_id,
                response_code: row.response_code,
                result_code: row.result_code,
                result_code_num: row.result_code_num,
                result_desc: row.result_desc,
                receipt_number: row.receipt_number,
                raw_request: parse_json(row.daraja_raw_request.as_ref())?,
                raw_response: parse_json(row.daraja_raw_response.as_ref())?,
                raw_callback: parse_json(row.daraja_raw_callback.as_ref())?,
                callback_received_at: row.callback_received_at,
            },
            refund: RefundInfo {
                status: row.refund_status,
                reason: row.refund_reason,
                tx_hash: row.refund_tx_hash,
                initiated_at: row.refund_initiated_at,
                completed_at: row.refund_completed_at,
            },
            history,
            metadata: parse_json(row.metadata.as_ref())?.unwrap_or(Value::Null),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn target_columns(target: Option<&PayTarget>) -> (Option<&str>, Option<&str>, Option<&str>, Option<&str>) {
    match target {
        None => (None, None, None, None),
        Some(PayTarget::Onramp { phone }) | Some(PayTarget::Phone { phone }) => {
            (Some(phone.as_str()), None, None, None)
        },
        Some(PayTarget::Paybill { paybill, account_ref }) => {
            (None, Some(paybill.as_str()), None, Some(account_ref.as_str()))
        },
        Some(PayTarget::Buygoods { till, account_ref }) => {
            (None, None, Some(till.as_str()), account_ref.as_deref())
        },
    }
}

fn encode_json(doc: &Value) -> Option<String> {
    if doc.is_null() {
        None
    } else {
        Some(doc.to_string())
    }
}

/// Insert a freshly created transaction. The caller is responsible for having checked idempotency;
/// a unique-index violation here still protects against races.
pub async fn insert(
    new: NewTransaction,
    conn: &mut SqliteConnection,
) -> Result<Transaction, PaymentDatabaseError> {
    let (phone, paybill, till, account_ref) = target_columns(new.target.as_ref());
    let now = Utc::now();
    let row: TransactionRow = sqlx::query_as(
        r#"
            INSERT INTO transactions (
                transaction_id, flow_type, status, user_address, business_id, idempotency_key,
                quote_id, currency, amount_requested, amount_kes, amount_usd, rate_kes_per_usd,
                fee_kes, network_fee_kes, total_debit_kes, expected_receive_kes,
                quote_expires_at, quote_snapshot_at,
                target_phone, target_paybill, target_till, target_account_ref,
                onchain_required, onchain_token, onchain_treasury, onchain_chain_id,
                expected_amount_units, expected_amount_usd, verification_status,
                metadata, created_at, updated_at
            ) VALUES (
                $1, $2, 'created', $3, $4, $5,
                $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21,
                $22, $23, $24, $25, $26, $27, $28,
                $29, $30, $31
            )
            RETURNING *;
        "#,
    )
    .bind(&new.transaction_id)
    .bind(new.flow_type)
    .bind(&new.user_address)
    .bind(&new.business_id)
    .bind(&new.idempotency_key)
    .bind(&new.quote.quote_id)
    .bind(new.quote.currency)
    .bind(new.quote.amount_requested)
    .bind(new.quote.amount_kes)
    .bind(new.quote.amount_usd)
    .bind(new.quote.rate_kes_per_usd)
    .bind(new.quote.fee_kes)
    .bind(new.quote.network_fee_kes)
    .bind(new.quote.total_debit_kes)
    .bind(new.quote.expected_receive_kes)
    .bind(new.quote.expires_at)
    .bind(new.quote.snapshot_at)
    .bind(phone)
    .bind(paybill)
    .bind(till)
    .bind(account_ref)
    .bind(new.onchain.required)
    .bind(&new.onchain.token)
    .bind(&new.onchain.treasury)
    .bind(new.onchain.chain_id.map(|v| v as i64))
    .bind(new.onchain.expected_amount_units.map(|u| u.to_string()))
    .bind(new.onchain.expected_amount_usd)
    .bind(new.onchain.verification_status)
    .bind(encode_json(&new.metadata))
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;
    debug!("🗃️ Transaction [{}] inserted with id {}", row.transaction_id, row.id);
    row.try_into()
}

pub async fn fetch_by_transaction_id(
    id: &TransactionId,
    conn: &mut SqliteConnection,
) -> Result<Option<Transaction>, PaymentDatabaseError> {
    let row: Option<TransactionRow> =
        sqlx::query_as("SELECT * FROM transactions WHERE transaction_id = $1")
            .bind(id)
            .fetch_optional(conn)
            .await?;
    row.map(Transaction::try_from).transpose()
}

pub async fn fetch_by_quote_id(
    quote_id: &str,
    conn: &mut SqliteConnection,
) -> Result<Option<Transaction>, PaymentDatabaseError> {
    let row: Option<TransactionRow> = sqlx::query_as("SELECT * FROM transactions WHERE quote_id = $1")
        .bind(quote_id)
        .fetch_optional(conn)
        .await?;
    row.map(Transaction::try_from).transpose()
}

pub async fn fetch_by_idempotency_key(
    user_address: &str,
    flow_type: FlowType,
    key: &str,
    conn: &mut SqliteConnection,
) -> Result<Option<Transaction>, PaymentDatabaseError> {
    let row: Option<TransactionRow> = sqlx::query_as(
        "SELECT * FROM transactions WHERE user_address = $1 AND flow_type = $2 AND idempotency_key = $3",
    )
    .bind(user_address)
    .bind(flow_type)
    .bind(key)
    .fetch_optional(conn)
    .await?;
    row.map(Transaction::try_from).transpose()
}

/// Locate a transaction by any provider correlation id. The most recent match wins.
pub async fn fetch_by_provider_ids(
    ids: &ProviderIdQuery,
    conn: &mut SqliteConnection,
) -> Result<Option<Transaction>, PaymentDatabaseError> {
    if ids.is_empty() {
        return Ok(None);
    }
    let row: Option<TransactionRow> = sqlx::query_as(
        r#"
            SELECT * FROM transactions
            WHERE (checkout_request_id IS NOT NULL AND checkout_request_id = $1)
               OR (merchant_request_id IS NOT NULL AND merchant_request_id = $2)
               OR (conversation_id IS NOT NULL AND conversation_id = $3)
               OR (originator_conversation_id IS NOT NULL AND originator_conversation_id = $4)
            ORDER BY created_at DESC
            LIMIT 1
        "#,
    )
    .bind(&ids.checkout_request_id)
    .bind(&ids.merchant_request_id)
    .bind(&ids.conversation_id)
    .bind(&ids.originator_conversation_id)
    .fetch_optional(conn)
    .await?;
    row.map(Transaction::try_from).transpose()
}

/// Fetch transactions matching the filter, newest first.
pub async fn search(
    filter: &TransactionQueryFilter,
    conn: &mut SqliteConnection,
) -> Result<Vec<Transaction>, PaymentDatabaseError> {
    let mut builder = QueryBuilder::new("SELECT * FROM transactions WHERE 1 = 1");
    if let Some(user) = &filter.user_address {
        builder.push(" AND user_address = ").push_bind(user.clone());
    }
    if let Some(flow) = filter.flow_type {
        builder.push(" AND flow_type = ").push_bind(flow);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status);
    }
    builder.push(" ORDER BY created_at DESC");
    let limit = filter.limit.unwrap_or(20).clamp(1, 100);
    builder.push(" LIMIT ").push_bind(limit);

    trace!("🗃️ Executing query: {}", builder.sql());
    let rows: Vec<TransactionRow> = builder.build_query_as().fetch_all(conn).await?;
    rows.into_iter().map(Transaction::try_from).collect()
}

pub async fn funding_tx_in_use(
    tx_hash: &str,
    exclude: &TransactionId,
    conn: &mut SqliteConnection,
) -> Result<Option<TransactionId>, PaymentDatabaseError> {
    let id: Option<String> = sqlx::query_scalar(
        "SELECT transaction_id FROM transactions WHERE onchain_tx_hash = $1 AND transaction_id <> $2 LIMIT 1",
    )
    .bind(tx_hash)
    .bind(exclude)
    .fetch_optional(conn)
    .await?;
    Ok(id.map(TransactionId::from))
}

/// Sum of `amount_kes` over a user's non-failed transactions created at or after `since`.
pub async fn volume_kes_since(
    user_address: &str,
    since: DateTime<Utc>,
    exclude: &TransactionId,
    conn: &mut SqliteConnection,
) -> Result<MicroKes, PaymentDatabaseError> {
    let total: Option<i64> = sqlx::query_scalar(
        r#"
            SELECT SUM(amount_kes) FROM transactions
            WHERE user_address = $1 AND created_at >= $2 AND status <> 'failed' AND transaction_id <> $3
        "#,
    )
    .bind(user_address)
    .bind(since)
    .bind(exclude)
    .fetch_one(conn)
    .await?;
    Ok(MicroKes::from(total.unwrap_or(0)))
}

/// Persist the status and history of an in-memory transaction that just went through
/// [`crate::state_machine::assert_transition`].
pub async fn persist_transition(
    tx: &Transaction,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentDatabaseError> {
    let history =
        serde_json::to_string(&tx.history).map_err(|e| PaymentDatabaseError::Encoding(e.to_string()))?;
    sqlx::query("UPDATE transactions SET status = $1, history = $2, updated_at = $3 WHERE transaction_id = $4")
        .bind(tx.status)
        .bind(history)
        .bind(Utc::now())
        .bind(&tx.transaction_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn bind_initiation(
    id: &TransactionId,
    idempotency_key: &str,
    target: &PayTarget,
    metadata: &Value,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentDatabaseError> {
    let (phone, paybill, till, account_ref) = target_columns(Some(target));
    sqlx::query(
        r#"
            UPDATE transactions SET
                idempotency_key = $1,
                target_phone = $2, target_paybill = $3, target_till = $4, target_account_ref = $5,
                metadata = $6, updated_at = $7
            WHERE transaction_id = $8
        "#,
    )
    .bind(idempotency_key)
    .bind(phone)
    .bind(paybill)
    .bind(till)
    .bind(account_ref)
    .bind(encode_json(metadata))
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_authorization(
    id: &TransactionId,
    auth: &Authorization,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentDatabaseError> {
    sqlx::query(
        r#"
            UPDATE transactions SET
                pin_verified = $1, wallet_signature = $2, signer_address = $3,
                auth_nonce = $4, auth_signed_at = $5, updated_at = $6
            WHERE transaction_id = $7
        "#,
    )
    .bind(auth.pin_verified)
    .bind(&auth.wallet_signature)
    .bind(&auth.signer_address)
    .bind(&auth.nonce)
    .bind(&auth.signed_at)
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_funding(
    id: &TransactionId,
    onchain: &OnchainFunding,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentDatabaseError> {
    sqlx::query(
        r#"
            UPDATE transactions SET
                onchain_required = $1, onchain_tx_hash = $2, onchain_chain_id = $3,
                onchain_token = $4, onchain_treasury = $5,
                expected_amount_units = $6, expected_amount_usd = $7,
                funded_amount_units = $8, funded_amount_usd = $9,
                onchain_from = $10, onchain_log_index = $11,
                verification_status = $12, verification_error = $13, updated_at = $14
            WHERE transaction_id = $15
        "#,
    )
    .bind(onchain.required)
    .bind(&onchain.tx_hash)
    .bind(onchain.chain_id.map(|v| v as i64))
    .bind(&onchain.token)
    .bind(&onchain.treasury)
    .bind(onchain.expected_amount_units.map(|u| u.to_string()))
    .bind(onchain.expected_amount_usd)
    .bind(onchain.funded_amount_units.map(|u| u.to_string()))
    .bind(onchain.funded_amount_usd)
    .bind(&onchain.from_address)
    .bind(onchain.log_index.map(|v| v as i64))
    .bind(onchain.verification_status)
    .bind(&onchain.verification_error)
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn merge_submission(
    id: &TransactionId,
    submission: &DarajaSubmission,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentDatabaseError> {
    sqlx::query(
        r#"
            UPDATE transactions SET
                daraja_raw_request = $1, daraja_raw_response = $2,
                response_code = $3, result_desc = COALESCE($4, result_desc),
                merchant_request_id = COALESCE($5, merchant_request_id),
                checkout_request_id = COALESCE($6, checkout_request_id),
                conversation_id = COALESCE($7, conversation_id),
                originator_conversation_id = COALESCE($8, originator_conversation_id),
                updated_at = $9
            WHERE transaction_id = $10
        "#,
    )
    .bind(submission.raw_request.to_string())
    .bind(submission.raw_response.to_string())
    .bind(&submission.response_code)
    .bind(&submission.response_description)
    .bind(&submission.provider_ids.merchant_request_id)
    .bind(&submission.provider_ids.checkout_request_id)
    .bind(&submission.provider_ids.conversation_id)
    .bind(&submission.provider_ids.originator_conversation_id)
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn merge_callback(
    id: &TransactionId,
    merge: &CallbackMerge,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentDatabaseError> {
    sqlx::query(
        r#"
            UPDATE transactions SET
                result_code = COALESCE($1, result_code),
                result_code_num = COALESCE($2, result_code_num),
                result_desc = COALESCE($3, result_desc),
                receipt_number = COALESCE($4, receipt_number),
                daraja_raw_callback = $5,
                callback_received_at = $6,
                merchant_request_id = COALESCE($7, merchant_request_id),
                checkout_request_id = COALESCE($8, checkout_request_id),
                conversation_id = COALESCE($9, conversation_id),
                originator_conversation_id = COALESCE($10, originator_conversation_id),
                updated_at = $11
            WHERE transaction_id = $12
        "#,
    )
    .bind(&merge.result_code)
    .bind(merge.result_code_num)
    .bind(&merge.result_desc)
    .bind(&merge.receipt_number)
    .bind(merge.raw_callback.to_string())
    .bind(merge.received_at)
    .bind(&merge.provider_ids.merchant_request_id)
    .bind(&merge.provider_ids.checkout_request_id)
    .bind(&merge.provider_ids.conversation_id)
    .bind(&merge.provider_ids.originator_conversation_id)
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_refund_fields(
    id: &TransactionId,
    refund: &RefundInfo,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentDatabaseError> {
    sqlx::query(
        r#"
            UPDATE transactions SET
                refund_status = $1, refund_reason = $2, refund_tx_hash = $3,
                refund_initiated_at = $4, refund_completed_at = $5, updated_at = $6
            WHERE transaction_id = $7
        "#,
    )
    .bind(refund.status)
    .bind(&refund.reason)
    .bind(&refund.tx_hash)
    .bind(refund.initiated_at)
    .bind(refund.completed_at)
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn stuck_processing(
    cutoff: DateTime<Utc>,
    limit: i64,
    conn: &mut SqliteConnection,
) -> Result<Vec<Transaction>, PaymentDatabaseError> {
    let rows: Vec<TransactionRow> = sqlx::query_as(
        r#"
            SELECT * FROM transactions
            WHERE status = 'mpesa_processing' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(Transaction::try_from).collect()
}

pub async fn update_metadata(
    id: &TransactionId,
    metadata: &Value,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentDatabaseError> {
    sqlx::query("UPDATE transactions SET metadata = $1, updated_at = $2 WHERE transaction_id = $3")
        .bind(encode_json(metadata))
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}
