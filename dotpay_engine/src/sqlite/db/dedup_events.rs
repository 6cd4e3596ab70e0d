use chrono::{DateTime, Utc};
use log::trace;
use serde_json::Value;
use sqlx::{FromRow, SqliteConnection};

use crate::{
    db_types::{DedupEvent, EventSource, NewDedupEvent, TransactionId},
    traits::PaymentDatabaseError,
};

#[derive(Debug, FromRow)]
struct DedupEventRow {
    id: i64,
    event_key: String,
    transaction_id: TransactionId,
    source: EventSource,
    event_type: String,
    payload: Option<String>,
    received_at: DateTime<Utc>,
}

impl TryFrom<DedupEventRow> for DedupEvent {
    type Error = PaymentDatabaseError;

    fn try_from(row: DedupEventRow) -> Result<Self, Self::Error> {
        let payload = row
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| PaymentDatabaseError::Encoding(e.to_string()))?
            .unwrap_or(Value::Null);
        Ok(DedupEvent {
            id: row.id,
            event_key: row.event_key,
            transaction_id: row.transaction_id,
            source: row.source,
            event_type: row.event_type,
            payload,
            received_at: row.received_at,
        })
    }
}

/// Insert a dedup event, returning `false` when the event key has been seen before.
///
/// This is the at-least-once delivery guard: the unique index on `event_key` makes the
/// insert-or-drop decision atomic even under concurrent webhook retries.
pub async fn idempotent_insert(
    event: &NewDedupEvent,
    conn: &mut SqliteConnection,
) -> Result<bool, PaymentDatabaseError> {
    let payload = if event.payload.is_null() { None } else { Some(event.payload.to_string()) };
    let result = sqlx::query(
        r#"
            INSERT INTO dedup_events (event_key, transaction_id, source, event_type, payload, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_key) DO NOTHING
        "#,
    )
    .bind(&event.event_key)
    .bind(&event.transaction_id)
    .bind(event.source)
    .bind(&event.event_type)
    .bind(payload)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    let inserted = result.rows_affected() > 0;
    if !inserted {
        trace!("🗃️ Dedup event {} already recorded", event.event_key);
    }
    Ok(inserted)
}

pub async fn fetch_for_transaction(
    id: &TransactionId,
    conn: &mut SqliteConnection,
) -> Result<Vec<DedupEvent>, PaymentDatabaseError> {
    let rows: Vec<DedupEventRow> =
        sqlx::query_as("SELECT * FROM dedup_events WHERE transaction_id = $1 ORDER BY received_at ASC")
            .bind(id)
            .fetch_all(conn)
            .await?;
    rows.into_iter().map(DedupEvent::try_from).collect()
}
