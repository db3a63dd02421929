//! Error taxonomy — the named failure kinds the core raises/consumes.

use serde_json::Value;
use thiserror::Error;

use broker::{BrokerError, StorageError};
use fdr::ConfigError;

/// Errors the System-State Engine and Dispatcher Entry exchange.
///
/// Recovery policy: recover locally (retry or fallback) whenever a
/// flow-level policy covers the failure; surface as `FlowError` otherwise;
/// never silently drop a failure.
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// A task's status was observed as FAILURE. Handled internally by the
    /// System-State Engine's retry/fallback logic — this variant is
    /// constructed but not expected to escape `update()`; it exists to
    /// name the condition explicitly rather than folding it into `FlowError`.
    #[error("node '{0}' failed")]
    NodeFailure(String),

    /// No fallback covers a node and its retries are exhausted. Carries
    /// the JSON-serialized snapshot. Handled by the Dispatcher Entry:
    /// `FLOW_RETRY` if the flow itself has retries
    /// left, else terminal `FLOW_FAILURE`.
    #[error("flow failed: {0}")]
    FlowError(Value),

    /// The engine detected a transient condition (e.g. broker
    /// unavailable) and wants the Dispatcher Entry to re-enqueue this
    /// wakeup rather than treat it as progress.
    #[error("dispatcher asked to retry (adjust_retry_count={adjust_retry_count}, keep_state={keep_state})")]
    DispatcherRetry { adjust_retry_count: bool, keep_state: bool },

    /// FDR lookup for an unknown flow/node. Always surfaced as a
    /// dispatcher defect — there is no retry that makes an unknown flow
    /// name become known.
    #[error("config error: {0}")]
    ConfigError(#[from] ConfigError),

    /// The broker itself is unreachable. Not treated as a `DispatcherRetry`
    /// by default — broker failures during polling are reported as a
    /// dispatcher defect so an operator notices a systemic outage rather
    /// than retrying forever against a dead broker. See
    /// `DispatcherError::from(StorageError)` below for the storage case,
    /// which is singled out for automatic retry instead.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The dispatcher payload failed to serialize back into a broker
    /// message. Treated as a dispatcher defect — there is no snapshot that
    /// can be re-enqueued if it can't be encoded in the first place.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatcherError {
    pub fn flow_error(snapshot_json: Value) -> Self {
        DispatcherError::FlowError(snapshot_json)
    }
}

/// Storage errors bubble as `DispatcherRetry(keep_state=true)`, not as a
/// raw propagation — hence a hand-written conversion rather than a
/// blanket `#[from]`.
impl From<StorageError> for DispatcherError {
    fn from(_: StorageError) -> Self {
        DispatcherError::DispatcherRetry { adjust_retry_count: false, keep_state: true }
    }
}
