//! In-memory reference implementations of [`BrokerAdapter`] and
//! [`StorageAdapter`], used by the dispatcher's own test suite and by the
//! CLI's offline `dispatch` sub-command (no real broker/storage needed).
//!
//! Programmer-controlled behaviour plus call recording, shaped around the
//! broker/storage contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use fdr::TaskId;

use crate::status::TaskStatus;
use crate::traits::{BrokerAdapter, BrokerError, StorageAdapter, StorageError};

struct TaskRecord {
    status: TaskStatus,
    queue: String,
    payload: Value,
    countdown: u64,
}

/// Deterministic, non-random task id allocation (`task-{n}`) so tests —
/// including the idempotent-replay property — don't depend on wall-clock
/// time or randomness, neither of which this engine may use internally
/// given its re-entrant, replay-safe design.
pub struct InMemoryBroker {
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    idempotency_index: Mutex<HashMap<String, TaskId>>,
    next_id: AtomicU64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            idempotency_index: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn allocate_id(&self) -> TaskId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        TaskId::new(format!("task-{n}"))
    }

    /// Test/tooling helper: force a task's observed status (simulating the
    /// worker runtime completing or failing it).
    pub async fn set_status(&self, id: &TaskId, status: TaskStatus) {
        if let Some(record) = self.tasks.lock().await.get_mut(id) {
            record.status = status;
        }
    }

    pub async fn queue_of(&self, id: &TaskId) -> Option<String> {
        self.tasks.lock().await.get(id).map(|r| r.queue.clone())
    }

    pub async fn payload_of(&self, id: &TaskId) -> Option<Value> {
        self.tasks.lock().await.get(id).map(|r| r.payload.clone())
    }

    pub async fn countdown_of(&self, id: &TaskId) -> Option<u64> {
        self.tasks.lock().await.get(id).map(|r| r.countdown)
    }

    /// Flip every still-pending task to `Success`, simulating a worker
    /// runtime that completes each submitted leaf task instantly. Backs
    /// the CLI's offline `dispatch` sub-command, which drives a flow to
    /// completion with no real worker runtime attached.
    pub async fn complete_all_pending(&self) {
        let mut tasks = self.tasks.lock().await;
        for record in tasks.values_mut() {
            if record.status == TaskStatus::Pending {
                record.status = TaskStatus::Success;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[async_trait]
impl BrokerAdapter for InMemoryBroker {
    async fn submit(
        &self,
        queue: &str,
        payload: Value,
        countdown: u64,
        idempotency_key: Option<&str>,
    ) -> Result<TaskId, BrokerError> {
        if let Some(key) = idempotency_key {
            let mut index = self.idempotency_index.lock().await;
            if let Some(existing) = index.get(key) {
                return Ok(existing.clone());
            }
            let id = self.allocate_id();
            self.tasks.lock().await.insert(
                id.clone(),
                TaskRecord { status: TaskStatus::Pending, queue: queue.to_owned(), payload, countdown },
            );
            index.insert(key.to_owned(), id.clone());
            return Ok(id);
        }

        let id = self.allocate_id();
        self.tasks.lock().await.insert(
            id.clone(),
            TaskRecord { status: TaskStatus::Pending, queue: queue.to_owned(), payload, countdown },
        );
        Ok(id)
    }

    async fn status(&self, task_id: &TaskId) -> Result<TaskStatus, BrokerError> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .map(|r| r.status)
            .ok_or_else(|| BrokerError::NoSuchTask(task_id.clone()))
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.lock().await;
        let record = tasks.get_mut(task_id).ok_or_else(|| BrokerError::NoSuchTask(task_id.clone()))?;
        record.status = TaskStatus::Revoked;
        Ok(())
    }

    async fn retry_self(&self, payload: Value, countdown: u64, queue: &str) -> Result<TaskId, BrokerError> {
        self.submit(queue, payload, countdown, None).await
    }
}

/// In-memory result storage, keyed by `(task_name, task_id)`.
#[derive(Default)]
pub struct InMemoryStorage {
    results: Mutex<HashMap<(String, TaskId), Value>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn get_result(&self, task_name: &str, id: &TaskId) -> Result<Value, StorageError> {
        self.results
            .lock()
            .await
            .get(&(task_name.to_owned(), id.clone()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound { task_name: task_name.to_owned(), id: id.clone() })
    }

    async fn put_result(&self, task_name: &str, id: &TaskId, value: Value) -> Result<(), StorageError> {
        self.results.lock().await.insert((task_name.to_owned(), id.clone()), value);
        Ok(())
    }
}
