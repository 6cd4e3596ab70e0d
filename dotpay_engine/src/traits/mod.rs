//! Behaviour required of storage backends for the payment engine.

use std::future::Future;

use chrono::{DateTime, Utc};
use dp_common::MicroKes;
use serde_json::Value;
use thiserror::Error;

use crate::{
    db_types::{
        Authorization,
        DedupEvent,
        FlowType,
        NewDedupEvent,
        NewTransaction,
        OnchainFunding,
        PayTarget,
        RefundInfo,
        Transaction,
        TransactionId,
        TransactionStatus,
    },
    state_machine::StateError,
};

#[derive(Debug, Clone, Error)]
pub enum PaymentDatabaseError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Transaction {0} does not exist")]
    TransactionNotFound(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Could not encode stored document: {0}")]
    Encoding(String),
}

impl From<sqlx::Error> for PaymentDatabaseError {
    fn from(e: sqlx::Error) -> Self {
        PaymentDatabaseError::DatabaseError(e.to_string())
    }
}

/// Provider correlation ids carried by asynchronous callbacks. Used to locate a transaction when
/// the canonical `tx` query parameter is missing.
#[derive(Debug, Clone, Default)]
pub struct ProviderIdQuery {
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub originator_conversation_id: Option<String>,
}

impl ProviderIdQuery {
    pub fn is_empty(&self) -> bool {
        self.merchant_request_id.is_none()
            && self.checkout_request_id.is_none()
            && self.conversation_id.is_none()
            && self.originator_conversation_id.is_none()
    }
}

/// The outcome of a synchronous provider submission, to be merged into `tx.daraja`.
#[derive(Debug, Clone)]
pub struct DarajaSubmission {
    pub raw_request: Value,
    pub raw_response: Value,
    pub response_code: Option<String>,
    pub response_description: Option<String>,
    pub provider_ids: ProviderIdQuery,
}

/// The parsed content of an asynchronous provider callback, to be merged into `tx.daraja`.
#[derive(Debug, Clone)]
pub struct CallbackMerge {
    pub result_code: Option<String>,
    pub result_code_num: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub raw_callback: Value,
    pub provider_ids: ProviderIdQuery,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionQueryFilter {
    pub user_address: Option<String>,
    pub flow_type: Option<FlowType>,
    pub status: Option<TransactionStatus>,
    pub limit: Option<i64>,
}

/// Storage behaviour for the payment gateway.
///
/// Implementations must enforce the uniqueness invariants at the index level: one transaction per
/// `transaction_id`, per `(user_address, flow_type, idempotency_key)` and per `onchain_tx_hash`,
/// and one dedup event per `event_key`. Mutations are per-field updates; a status change persists
/// the new status together with the appended history entry.
///
/// Methods return `Send` futures so refund and settlement work can run on spawned tasks;
/// implementations can still be written as plain `async fn`s.
pub trait PaymentDatabase: Clone + Send + Sync {
    /// The URL of the database.
    fn url(&self) -> &str;

    fn insert_transaction(
        &self,
        tx: NewTransaction,
    ) -> impl Future<Output = Result<Transaction, PaymentDatabaseError>> + Send;

    fn fetch_transaction(
        &self,
        id: &TransactionId,
    ) -> impl Future<Output = Result<Option<Transaction>, PaymentDatabaseError>> + Send;

    fn fetch_by_quote_id(
        &self,
        quote_id: &str,
    ) -> impl Future<Output = Result<Option<Transaction>, PaymentDatabaseError>> + Send;

    fn fetch_by_idempotency_key(
        &self,
        user_address: &str,
        flow_type: FlowType,
        key: &str,
    ) -> impl Future<Output = Result<Option<Transaction>, PaymentDatabaseError>> + Send;

    /// Locate a transaction by any of the provider correlation ids.
    fn fetch_by_provider_ids(
        &self,
        ids: &ProviderIdQuery,
    ) -> impl Future<Output = Result<Option<Transaction>, PaymentDatabaseError>> + Send;

    fn search_transactions(
        &self,
        filter: &TransactionQueryFilter,
    ) -> impl Future<Output = Result<Vec<Transaction>, PaymentDatabaseError>> + Send;

    /// If `tx_hash` already funds a transaction other than `exclude`, return that transaction's id.
    fn funding_tx_in_use(
        &self,
        tx_hash: &str,
        exclude: &TransactionId,
    ) -> impl Future<Output = Result<Option<TransactionId>, PaymentDatabaseError>> + Send;

    /// Sum of `quote.amount_kes` over the user's non-failed transactions created since
    /// `day_start`, excluding the transaction currently being initiated.
    fn volume_kes_since(
        &self,
        user_address: &str,
        day_start: DateTime<Utc>,
        exclude: &TransactionId,
    ) -> impl Future<Output = Result<MicroKes, PaymentDatabaseError>> + Send;

    /// Apply a state transition and persist status + history atomically.
    fn transition(
        &self,
        id: &TransactionId,
        to: TransactionStatus,
        reason: &str,
        source: &str,
    ) -> impl Future<Output = Result<Transaction, PaymentDatabaseError>> + Send;

    /// Attach the initiate-call context (idempotency key, payout target, request metadata) to a
    /// transaction that was created by an earlier quote call.
    fn bind_initiation(
        &self,
        id: &TransactionId,
        idempotency_key: &str,
        target: &PayTarget,
        metadata: Value,
    ) -> impl Future<Output = Result<Transaction, PaymentDatabaseError>> + Send;

    fn update_authorization(
        &self,
        id: &TransactionId,
        authorization: &Authorization,
    ) -> impl Future<Output = Result<(), PaymentDatabaseError>> + Send;

    fn update_funding(
        &self,
        id: &TransactionId,
        onchain: &OnchainFunding,
    ) -> impl Future<Output = Result<(), PaymentDatabaseError>> + Send;

    /// Persist the synchronous provider response and transition in one atomic step.
    fn record_submission(
        &self,
        id: &TransactionId,
        submission: &DarajaSubmission,
        to: TransactionStatus,
        reason: &str,
        source: &str,
    ) -> impl Future<Output = Result<Transaction, PaymentDatabaseError>> + Send;

    /// Merge callback data and optionally transition, in one atomic step.
    fn record_callback(
        &self,
        id: &TransactionId,
        merge: &CallbackMerge,
        to: Option<TransactionStatus>,
        reason: &str,
        source: &str,
    ) -> impl Future<Output = Result<Transaction, PaymentDatabaseError>> + Send;

    /// Insert a dedup event. Returns `false` when the event key already exists.
    fn insert_dedup_event(
        &self,
        event: &NewDedupEvent,
    ) -> impl Future<Output = Result<bool, PaymentDatabaseError>> + Send;

    fn dedup_events_for(
        &self,
        id: &TransactionId,
    ) -> impl Future<Output = Result<Vec<DedupEvent>, PaymentDatabaseError>> + Send;

    /// Update refund bookkeeping, optionally with a state transition, atomically.
    fn update_refund(
        &self,
        id: &TransactionId,
        refund: &RefundInfo,
        to: Option<TransactionStatus>,
        reason: &str,
        source: &str,
    ) -> impl Future<Output = Result<Transaction, PaymentDatabaseError>> + Send;

    /// `mpesa_processing` transactions whose last update is older than `cutoff`.
    fn stuck_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<Transaction>, PaymentDatabaseError>> + Send;

    /// Merge a key into the transaction's metadata document.
    fn append_metadata(
        &self,
        id: &TransactionId,
        key: &str,
        value: Value,
    ) -> impl Future<Output = Result<(), PaymentDatabaseError>> + Send;

    /// The stored PIN hash for a user, if one has been provisioned.
    fn pin_hash_for(
        &self,
        user_address: &str,
    ) -> impl Future<Output = Result<Option<String>, PaymentDatabaseError>> + Send;

    /// Provision (or replace) a user's PIN hash.
    fn set_pin_hash(
        &self,
        user_address: &str,
        pin_hash: &str,
    ) -> impl Future<Output = Result<(), PaymentDatabaseError>> + Send;
}
