//! Trace event codes and the `flow_info` payload shared by all of them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fixed set of event codes the dispatcher can emit.
///
/// This list is closed by design: adding a new kind of event to the engine
/// means adding a new variant here, not stringly-typed ad-hoc event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceEventKind {
    DispatcherWakeup,
    DispatcherRetry,
    DispatcherFailure,
    FlowStart,
    FlowEnd,
    FlowRetry,
    FlowFailure,
    NodeSchedule,
    NodeStart,
    NodeSuccessful,
    NodeFailure,
    FallbackStart,
    ConditionFalse,
    ForeachExpand,
    SelectiveOmit,
}

/// Structured context attached to every trace event.
///
/// `{flow_name, dispatcher_id, node_args, retry, queue, state, selective,
/// retried_count, parent}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInfo {
    pub flow_name: String,
    pub dispatcher_id: String,
    pub node_args: Value,
    pub retry: Option<i64>,
    pub queue: String,
    pub state: Option<Value>,
    pub selective: Option<Value>,
    pub retried_count: u32,
    pub parent: Option<Value>,
}

/// One emitted trace event: a code, the flow context, and free-form extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event: TraceEventKind,
    pub flow_info: FlowInfo,
    /// Event-specific extras (e.g. `will_retry`, `countdown`, an error string).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl TraceEvent {
    pub fn new(event: TraceEventKind, flow_info: FlowInfo) -> Self {
        Self { event, flow_info, extra: serde_json::Map::new() }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_owned(), value.into());
        self
    }
}
