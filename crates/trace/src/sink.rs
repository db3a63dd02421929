//! Pluggable trace sinks.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::event::{TraceEvent, TraceEventKind};

/// A sink that receives every [`TraceEvent`] the engine emits.
///
/// `emit` must not panic and has no error return — a sink is responsible
/// for swallowing or logging its own delivery failures.
pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Forwards every event to the `tracing` crate at a level appropriate to
/// its kind. This is the default sink, logging directly with
/// `tracing::info!/warn!/error!` at each step of a wakeup.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn emit(&self, event: TraceEvent) {
        let flow = &event.flow_info.flow_name;
        match event.event {
            TraceEventKind::DispatcherFailure
            | TraceEventKind::FlowFailure
            | TraceEventKind::NodeFailure => {
                tracing::error!(flow = %flow, kind = ?event.event, extra = ?event.extra, "trace event");
            }
            TraceEventKind::DispatcherRetry
            | TraceEventKind::FlowRetry
            | TraceEventKind::ConditionFalse
            | TraceEventKind::SelectiveOmit => {
                tracing::warn!(flow = %flow, kind = ?event.event, extra = ?event.extra, "trace event");
            }
            _ => {
                tracing::info!(flow = %flow, kind = ?event.event, extra = ?event.extra, "trace event");
            }
        }
    }
}

/// Discards every event. Useful in unit tests that don't care about tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn emit(&self, _event: TraceEvent) {}
}

/// Keeps the last `capacity` events in memory. Backs the CLI's `GET /trace`
/// endpoint and is handy for asserting on emitted events in tests.
pub struct RingSink {
    capacity: usize,
    events: Mutex<VecDeque<TraceEvent>>,
}

impl RingSink {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, events: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Snapshot of events currently held, oldest first.
    pub fn drain(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }
}

impl TraceSink for RingSink {
    fn emit(&self, event: TraceEvent) {
        let mut events = self.events.lock().unwrap();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}
