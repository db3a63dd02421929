//! `store` crate — durable persistence for dispatcher payloads.
//!
//! Provides a connection pool, a row struct, repository functions, and a
//! `FlowStore` trait so the CLI's `serve`/`dispatch` sub-commands can swap a
//! Postgres-backed instance for an in-memory one in tests. No flow
//! orchestration logic lives here — that's `dispatch`'s job; this crate only
//! ever round-trips a `DispatcherPayload` through JSON.

pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

use async_trait::async_trait;
use dispatch::DispatcherPayload;

pub use error::StoreError;
pub use pool::DbPool;

/// Durable storage for a dispatcher's `DispatcherPayload`, keyed by
/// `dispatcher_id`. Exists so a restarted worker can pick an in-flight flow
/// instance back up from its last committed snapshot rather than losing it —
/// the re-entrant dispatcher itself holds no memory between wakeups.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn save_payload(&self, dispatcher_id: &str, payload: &DispatcherPayload) -> Result<(), StoreError>;
    async fn load_payload(&self, dispatcher_id: &str) -> Result<DispatcherPayload, StoreError>;
    async fn mark_terminal(&self, dispatcher_id: &str) -> Result<(), StoreError>;
    async fn list_active(&self) -> Result<Vec<(String, DispatcherPayload)>, StoreError>;
}

/// `sqlx::PgPool`-backed [`FlowStore`].
pub struct PgFlowStore {
    pool: DbPool,
}

impl PgFlowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowStore for PgFlowStore {
    async fn save_payload(&self, dispatcher_id: &str, payload: &DispatcherPayload) -> Result<(), StoreError> {
        let value = serde_json::to_value(payload)?;
        repository::flow_instances::upsert(&self.pool, dispatcher_id, &payload.flow_name, value).await?;
        Ok(())
    }

    async fn load_payload(&self, dispatcher_id: &str) -> Result<DispatcherPayload, StoreError> {
        let row = repository::flow_instances::get(&self.pool, dispatcher_id).await?;
        Ok(serde_json::from_value(row.payload)?)
    }

    async fn mark_terminal(&self, dispatcher_id: &str) -> Result<(), StoreError> {
        repository::flow_instances::mark_terminal(&self.pool, dispatcher_id).await
    }

    async fn list_active(&self) -> Result<Vec<(String, DispatcherPayload)>, StoreError> {
        let rows = repository::flow_instances::list_active(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let payload = serde_json::from_value(row.payload)?;
                Ok((row.dispatcher_id, payload))
            })
            .collect()
    }
}
