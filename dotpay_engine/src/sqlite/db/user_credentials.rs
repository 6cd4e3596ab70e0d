use chrono::Utc;
use sqlx::SqliteConnection;

use crate::traits::PaymentDatabaseError;

pub async fn pin_hash_for(
    user_address: &str,
    conn: &mut SqliteConnection,
) -> Result<Option<String>, PaymentDatabaseError> {
    let hash: Option<String> =
        sqlx::query_scalar("SELECT pin_hash FROM user_credentials WHERE user_address = $1")
            .bind(user_address)
            .fetch_optional(conn)
            .await?;
    Ok(hash)
}

pub async fn set_pin_hash(
    user_address: &str,
    pin_hash: &str,
    conn: &mut SqliteConnection,
) -> Result<(), PaymentDatabaseError> {
    sqlx::query(
        r#"
            INSERT INTO user_credentials (user_address, pin_hash, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (user_address) DO UPDATE SET pin_hash = excluded.pin_hash, updated_at = excluded.updated_at
        "#,
    )
    .bind(user_address)
    .bind(pin_hash)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}
