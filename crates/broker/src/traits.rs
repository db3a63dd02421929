//! The broker and storage adapter contracts the dispatcher is coded against.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use fdr::TaskId;

use crate::status::TaskStatus;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is unavailable: {0}")]
    Unavailable(String),

    #[error("no such task: {0}")]
    NoSuchTask(TaskId),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend is unavailable: {0}")]
    Unavailable(String),

    #[error("no result stored for task '{task_name}' id '{id}'")]
    NotFound { task_name: String, id: TaskId },
}

/// The capabilities the dispatcher needs from the task-queue broker.
///
/// Implementations must be safe to share across concurrently-running
/// dispatcher wakeups (`Send + Sync`) since many wakeups for distinct flow
/// instances run concurrently on different workers.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Submit a new task to `queue`. `countdown` delays visibility by that
    /// many seconds. `idempotency_key`, when given, lets the broker
    /// deduplicate re-submissions from a replayed `update()`.
    async fn submit(
        &self,
        queue: &str,
        payload: Value,
        countdown: u64,
        idempotency_key: Option<&str>,
    ) -> Result<TaskId, BrokerError>;

    async fn status(&self, task_id: &TaskId) -> Result<TaskStatus, BrokerError>;

    async fn cancel(&self, task_id: &TaskId) -> Result<(), BrokerError>;

    /// Re-enqueue the *current* dispatcher task (self-retry). Only the
    /// Dispatcher Entry calls this — the System-State Engine never talks
    /// to the broker for self-scheduling.
    async fn retry_self(&self, payload: Value, countdown: u64, queue: &str) -> Result<TaskId, BrokerError>;
}

/// The capabilities the dispatcher needs from the result-storage layer.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get_result(&self, task_name: &str, id: &TaskId) -> Result<Value, StorageError>;

    async fn put_result(&self, task_name: &str, id: &TaskId, value: Value) -> Result<(), StorageError>;

    /// Optional: most storage backends never need to reclaim space the
    /// dispatcher itself cares about. Default is a no-op.
    async fn delete(&self, _task_name: &str, _id: &TaskId) -> Result<(), StorageError> {
        Ok(())
    }
}
