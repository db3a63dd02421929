//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no dispatch behaviour.
//! The live `DispatcherPayload` type lives in the `dispatch` crate; a row's
//! `payload` column is just its serialized form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// flow_instances
// ---------------------------------------------------------------------------

/// A persisted dispatcher payload, one row per live wakeup chain.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowInstanceRow {
    pub id: Uuid,
    pub dispatcher_id: String,
    pub flow_name: String,
    /// Full JSON `DispatcherPayload` as last committed by the dispatcher.
    pub payload: serde_json::Value,
    pub terminal: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
