//! The Dispatcher Entry's wire payload — what a broker message for a
//! dispatcher task actually carries.
//!
//! A fresh flow dispatch and a re-entrant wakeup use the same shape:
//! `state` is `None` at birth and `Some(..)` on every subsequent wakeup.

use serde::{Deserialize, Serialize};

use crate::state::{CompoundParent, Selective, StateSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherPayload {
    pub flow_name: String,
    #[serde(default)]
    pub node_args: serde_json::Value,
    pub parent: Option<CompoundParent>,
    #[serde(default)]
    pub retried_count: u32,
    /// Countdown, in seconds, this wakeup was scheduled with — surfaced to
    /// trace events as `retry`.
    pub retry: Option<i64>,
    pub state: Option<StateSnapshot>,
    pub selective: Option<Selective>,
}

impl DispatcherPayload {
    /// A brand-new flow instance: no prior state, no retries yet.
    pub fn fresh(flow_name: impl Into<String>, node_args: serde_json::Value, selective: Option<Selective>, parent: Option<CompoundParent>) -> Self {
        Self {
            flow_name: flow_name.into(),
            node_args,
            parent,
            retried_count: 0,
            retry: None,
            state: None,
            selective,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.state.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_payload_round_trips_json() {
        let payload = DispatcherPayload::fresh("flow1", serde_json::json!({"a": 1}), None, None);
        let text = serde_json::to_string(&payload).unwrap();
        let back: DispatcherPayload = serde_json::from_str(&text).unwrap();
        assert!(back.is_fresh());
        assert_eq!(back.flow_name, "flow1");
        assert_eq!(back.node_args, serde_json::json!({"a": 1}));
    }
}
