//! `SqliteDatabase` is the concrete storage backend of the payment engine.
//!
//! All multi-step mutations run inside a single SQL transaction so that a status change and the
//! fields that accompany it (provider payloads, refund bookkeeping, funding results) land
//! atomically. Status changes always go through [`state_machine::assert_transition`] first, so an
//! illegal transition can never be persisted.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use dp_common::MicroKes;
use log::debug;
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, SqliteConnection, SqlitePool};

use super::db::{dedup_events, new_pool, transactions, user_credentials};
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
    state_machine,
    traits::{
        CallbackMerge,
        DarajaSubmission,
        PaymentDatabase,
        PaymentDatabaseError,
        ProviderIdQuery,
        TransactionQueryFilter,
    },
};

#[derive(Clone)]
pub struct SqliteDatabase {
    url: String,
    pool: SqlitePool,
}

impl Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "SqliteDatabase ({:?})", self.pool)
    }
}

impl SqliteDatabase {
    pub async fn new_with_url(url: &str, max_connections: u32) -> Result<Self, PaymentDatabaseError> {
        let pool = new_pool(url, max_connections).await?;
        Ok(Self { url: url.to_string(), pool })
    }

    /// A fresh single-connection in-memory database. Used by tests.
    pub async fn new_in_memory() -> Result<Self, PaymentDatabaseError> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            PaymentDatabaseError::DatabaseError(format!("Could not run migrations: {e}"))
        })?;
        Ok(Self { url: "sqlite::memory:".to_string(), pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Load a transaction, apply the transition in memory and persist it on the given connection.
    async fn transition_on(
        id: &TransactionId,
        to: TransactionStatus,
        reason: &str,
        source: &str,
        conn: &mut SqliteConnection,
    ) -> Result<Transaction, PaymentDatabaseError> {
        let mut tx = transactions::fetch_by_transaction_id(id, conn)
            .await?
            .ok_or_else(|| PaymentDatabaseError::TransactionNotFound(id.to_string()))?;
        if state_machine::assert_transition(&mut tx, to, reason, source)?.is_some() {
            transactions::persist_transition(&tx, conn).await?;
            debug!("🗃️ [{id}] {} -> {to} ({reason}, via {source})", tx.history.last().map(|h| h.from).unwrap_or(to));
        }
        Ok(tx)
    }
}

impl PaymentDatabase for SqliteDatabase {
    fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn insert_transaction(&self, tx: NewTransaction) -> Result<Transaction, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::insert(tx, &mut conn).await
    }

    async fn fetch_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::fetch_by_transaction_id(id, &mut conn).await
    }

    async fn fetch_by_quote_id(&self, quote_id: &str) -> Result<Option<Transaction>, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::fetch_by_quote_id(quote_id, &mut conn).await
    }

    async fn fetch_by_idempotency_key(
        &self,
        user_address: &str,
        flow_type: FlowType,
        key: &str,
    ) -> Result<Option<Transaction>, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::fetch_by_idempotency_key(user_address, flow_type, key, &mut conn).await
    }

    async fn fetch_by_provider_ids(
        &self,
        ids: &ProviderIdQuery,
    ) -> Result<Option<Transaction>, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::fetch_by_provider_ids(ids, &mut conn).await
    }

    async fn search_transactions(
        &self,
        filter: &TransactionQueryFilter,
    ) -> Result<Vec<Transaction>, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::search(filter, &mut conn).await
    }

    async fn funding_tx_in_use(
        &self,
        tx_hash: &str,
        exclude: &TransactionId,
    ) -> Result<Option<TransactionId>, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::funding_tx_in_use(tx_hash, exclude, &mut conn).await
    }

    async fn volume_kes_since(
        &self,
        user_address: &str,
        day_start: DateTime<Utc>,
        exclude: &TransactionId,
    ) -> Result<MicroKes, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::volume_kes_since(user_address, day_start, exclude, &mut conn).await
    }

    async fn transition(
        &self,
        id: &TransactionId,
        to: TransactionStatus,
        reason: &str,
        source: &str,
    ) -> Result<Transaction, PaymentDatabaseError> {
        let mut tx = self.pool.begin().await?;
        let result = Self::transition_on(id, to, reason, source, &mut *tx).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn bind_initiation(
        &self,
        id: &TransactionId,
        idempotency_key: &str,
        target: &PayTarget,
        metadata: Value,
    ) -> Result<Transaction, PaymentDatabaseError> {
        let mut tx = self.pool.begin().await?;
        transactions::bind_initiation(id, idempotency_key, target, &metadata, &mut *tx).await?;
        let updated = transactions::fetch_by_transaction_id(id, &mut *tx)
            .await?
            .ok_or_else(|| PaymentDatabaseError::TransactionNotFound(id.to_string()))?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn update_authorization(
        &self,
        id: &TransactionId,
        authorization: &Authorization,
    ) -> Result<(), PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::update_authorization(id, authorization, &mut conn).await
    }

    async fn update_funding(
        &self,
        id: &TransactionId,
        onchain: &OnchainFunding,
    ) -> Result<(), PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::update_funding(id, onchain, &mut conn).await
    }

    async fn record_submission(
        &self,
        id: &TransactionId,
        submission: &DarajaSubmission,
        to: TransactionStatus,
        reason: &str,
        source: &str,
    ) -> Result<Transaction, PaymentDatabaseError> {
        let mut tx = self.pool.begin().await?;
        transactions::merge_submission(id, submission, &mut *tx).await?;
        let updated = Self::transition_on(id, to, reason, source, &mut *tx).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn record_callback(
        &self,
        id: &TransactionId,
        merge: &CallbackMerge,
        to: Option<TransactionStatus>,
        reason: &str,
        source: &str,
    ) -> Result<Transaction, PaymentDatabaseError> {
        let mut tx = self.pool.begin().await?;
        transactions::merge_callback(id, merge, &mut *tx).await?;
        let updated = match to {
            Some(to) => Self::transition_on(id, to, reason, source, &mut *tx).await?,
            None => transactions::fetch_by_transaction_id(id, &mut *tx)
                .await?
                .ok_or_else(|| PaymentDatabaseError::TransactionNotFound(id.to_string()))?,
        };
        tx.commit().await?;
        Ok(updated)
    }

    async fn insert_dedup_event(&self, event: &NewDedupEvent) -> Result<bool, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        dedup_events::idempotent_insert(event, &mut conn).await
    }

    async fn dedup_events_for(&self, id: &TransactionId) -> Result<Vec<DedupEvent>, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        dedup_events::fetch_for_transaction(id, &mut conn).await
    }

    async fn update_refund(
        &self,
        id: &TransactionId,
        refund: &RefundInfo,
        to: Option<TransactionStatus>,
        reason: &str,
        source: &str,
    ) -> Result<Transaction, PaymentDatabaseError> {
        let mut tx = self.pool.begin().await?;
        transactions::update_refund_fields(id, refund, &mut *tx).await?;
        let updated = match to {
            Some(to) => Self::transition_on(id, to, reason, source, &mut *tx).await?,
            None => transactions::fetch_by_transaction_id(id, &mut *tx)
                .await?
                .ok_or_else(|| PaymentDatabaseError::TransactionNotFound(id.to_string()))?,
        };
        tx.commit().await?;
        Ok(updated)
    }

    async fn stuck_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        transactions::stuck_processing(cutoff, limit, &mut conn).await
    }

    async fn append_metadata(
        &self,
        id: &TransactionId,
        key: &str,
        value: Value,
    ) -> Result<(), PaymentDatabaseError> {
        let mut tx = self.pool.begin().await?;
        let current = transactions::fetch_by_transaction_id(id, &mut *tx)
            .await?
            .ok_or_else(|| PaymentDatabaseError::TransactionNotFound(id.to_string()))?;
        let mut metadata = match current.metadata {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(serde_json::Map::new()),
        };
        if let Value::Object(map) = &mut metadata {
            map.insert(key.to_string(), value);
        }
        transactions::update_metadata(id, &metadata, &mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pin_hash_for(&self, user_address: &str) -> Result<Option<String>, PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        user_credentials::pin_hash_for(user_address, &mut conn).await
    }

    async fn set_pin_hash(&self, user_address: &str, pin_hash: &str) -> Result<(), PaymentDatabaseError> {
        let mut conn = self.pool.acquire().await?;
        user_credentials::set_pin_hash(user_address, pin_hash, &mut conn).await
    }
}
