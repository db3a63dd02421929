//! `flow_instances` persistence — one row per live dispatcher wakeup chain.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::FlowInstanceRow, StoreError};

/// Insert a fresh row, or overwrite the payload of an existing one keyed by
/// `dispatcher_id` — every re-entrant wakeup commits its snapshot here.
pub async fn upsert(
    pool: &PgPool,
    dispatcher_id: &str,
    flow_name: &str,
    payload: serde_json::Value,
) -> Result<FlowInstanceRow, StoreError> {
    let now = Utc::now();

    let row = sqlx::query_as!(
        FlowInstanceRow,
        r#"
        INSERT INTO flow_instances (id, dispatcher_id, flow_name, payload, terminal, created_at, updated_at)
        VALUES ($1, $2, $3, $4, FALSE, $5, $5)
        ON CONFLICT (dispatcher_id) DO UPDATE
          SET payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at
        RETURNING id, dispatcher_id, flow_name, payload, terminal, created_at, updated_at
        "#,
        Uuid::new_v4(),
        dispatcher_id,
        flow_name,
        payload,
        now,
    )
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch the current row for a dispatcher id.
pub async fn get(pool: &PgPool, dispatcher_id: &str) -> Result<FlowInstanceRow, StoreError> {
    let row = sqlx::query_as!(
        FlowInstanceRow,
        r#"SELECT id, dispatcher_id, flow_name, payload, terminal, created_at, updated_at
           FROM flow_instances WHERE dispatcher_id = $1"#,
        dispatcher_id,
    )
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound)?;

    Ok(row)
}

/// Flip a row's `terminal` flag once its flow instance has reached an exit
/// condition. Returns `StoreError::NotFound` if no such row was deleted.
pub async fn mark_terminal(pool: &PgPool, dispatcher_id: &str) -> Result<(), StoreError> {
    let now = Utc::now();
    let result = sqlx::query!(
        "UPDATE flow_instances SET terminal = TRUE, updated_at = $2 WHERE dispatcher_id = $1",
        dispatcher_id,
        now,
    )
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }

    Ok(())
}

/// All rows not yet marked terminal, oldest first — used on process start
/// to find flow instances that may need a recovery wakeup.
pub async fn list_active(pool: &PgPool) -> Result<Vec<FlowInstanceRow>, StoreError> {
    let rows = sqlx::query_as!(
        FlowInstanceRow,
        r#"SELECT id, dispatcher_id, flow_name, payload, terminal, created_at, updated_at
           FROM flow_instances WHERE NOT terminal ORDER BY created_at"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
