//! The Dispatcher Entry — the re-entrant driver invoked by the broker for
//! every wakeup of a flow instance. `Dispatcher::wakeup` is the top-level
//! entry point; the `FlowError` arm below performs a from-scratch
//! re-enqueue of the whole flow when the System-State Engine gives up.

use std::collections::BTreeMap;

use serde_json::Value;

use fdr::{NodeName, TaskId};
use trace::{FlowInfo, TraceEvent, TraceEventKind};

use crate::deps::EngineDeps;
use crate::error::DispatcherError;
use crate::payload::DispatcherPayload;
use crate::sse::{self, UpdateOutcome};
use crate::state::StateSnapshot;

/// What one `wakeup()` call did. Only [`DispatcherOutcome::Rescheduled`]
/// means the broker will see this flow instance again.
#[derive(Debug)]
pub enum DispatcherOutcome {
    /// Terminal success.
    Success { finished_nodes: BTreeMap<NodeName, Vec<TaskId>> },
    /// Re-enqueued — either a plain `DISPATCHER_RETRY`, a from-scratch
    /// `FLOW_RETRY`, or an engine-requested `DispatcherRetry`.
    Rescheduled { task_id: TaskId },
    /// Terminal flow-level failure after exhausting `max_retry(flow)` —
    /// the caller gets the last JSON state snapshot back for inspection.
    FlowFailed { body: Value },
}

/// The Dispatcher Entry. Holds the same collaborators as the System-State
/// Engine — it is the only component allowed to talk to the broker about
/// *its own* re-scheduling. The System-State Engine itself never talks to
/// the broker for self-scheduling; it only reports what happened.
pub struct Dispatcher {
    deps: EngineDeps,
}

impl Dispatcher {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    fn flow_info(&self, dispatcher_id: &str, payload: &DispatcherPayload) -> FlowInfo {
        FlowInfo {
            flow_name: payload.flow_name.clone(),
            dispatcher_id: dispatcher_id.to_owned(),
            node_args: payload.node_args.clone(),
            retry: payload.retry,
            queue: self.deps.registry.policy(&payload.flow_name).map(|p| p.queue.clone()).unwrap_or_default(),
            state: payload.state.as_ref().and_then(|s| serde_json::to_value(s).ok()),
            selective: payload.selective.as_ref().and_then(|s| serde_json::to_value(s).ok()),
            retried_count: payload.retried_count,
            parent: payload.parent.as_ref().and_then(|p| serde_json::to_value(p).ok()),
        }
    }

    /// Drive one wakeup to completion. `dispatcher_id` is this dispatcher
    /// task's own broker-assigned id (used to derive deterministic child
    /// idempotency keys).
    pub async fn wakeup(
        &self,
        dispatcher_id: &str,
        mut payload: DispatcherPayload,
    ) -> Result<DispatcherOutcome, DispatcherError> {
        if payload.is_fresh() {
            self.deps.trace.emit(TraceEvent::new(TraceEventKind::FlowStart, self.flow_info(dispatcher_id, &payload)));
        }
        self.deps.trace.emit(TraceEvent::new(TraceEventKind::DispatcherWakeup, self.flow_info(dispatcher_id, &payload)));

        let policy = self.deps.registry.policy(&payload.flow_name)?.clone();
        let edge_count = self.deps.registry.edges(&payload.flow_name)?.len();

        let mut snapshot = payload.state.take().unwrap_or_else(|| {
            StateSnapshot::fresh(edge_count, payload.node_args.clone(), payload.selective.clone(), payload.parent.clone())
        });

        match sse::update(&self.deps, &payload.flow_name, dispatcher_id, &mut snapshot).await {
            Ok(UpdateOutcome::Terminal(result)) => Ok(DispatcherOutcome::Success { finished_nodes: result.finished_nodes }),

            Ok(UpdateOutcome::Retry(countdown)) => {
                payload.state = Some(snapshot);
                payload.retry = Some(countdown as i64);
                let body = serde_json::to_value(&payload)?;
                let task_id = self.deps.broker.retry_self(body, countdown, &policy.queue).await?;
                self.deps.trace.emit(TraceEvent::new(TraceEventKind::DispatcherRetry, self.flow_info(dispatcher_id, &payload)));
                Ok(DispatcherOutcome::Rescheduled { task_id })
            }

            Err(DispatcherError::FlowError(body)) => {
                if payload.retried_count < policy.max_retry {
                    self.deps.trace.emit(TraceEvent::new(TraceEventKind::FlowRetry, self.flow_info(dispatcher_id, &payload)));
                    let mut fresh = DispatcherPayload::fresh(
                        payload.flow_name.clone(),
                        payload.node_args.clone(),
                        payload.selective.clone(),
                        payload.parent.clone(),
                    );
                    fresh.retried_count = payload.retried_count + 1;
                    let body = serde_json::to_value(&fresh)?;
                    let task_id = self.deps.broker.retry_self(body, policy.retry_countdown_secs, &policy.queue).await?;
                    Ok(DispatcherOutcome::Rescheduled { task_id })
                } else {
                    self.deps.trace.emit(TraceEvent::new(TraceEventKind::FlowFailure, self.flow_info(dispatcher_id, &payload)));
                    Ok(DispatcherOutcome::FlowFailed { body })
                }
            }

            Err(DispatcherError::DispatcherRetry { adjust_retry_count, keep_state }) => {
                if adjust_retry_count {
                    payload.retried_count += 1;
                }
                payload.state = if keep_state { Some(snapshot) } else { None };
                let body = serde_json::to_value(&payload)?;
                let task_id = self.deps.broker.retry_self(body, 0, &policy.queue).await?;
                self.deps.trace.emit(TraceEvent::new(TraceEventKind::DispatcherRetry, self.flow_info(dispatcher_id, &payload)));
                Ok(DispatcherOutcome::Rescheduled { task_id })
            }

            Err(other) => {
                self.deps.trace.emit(
                    TraceEvent::new(TraceEventKind::DispatcherFailure, self.flow_info(dispatcher_id, &payload))
                        .with_extra("error", other.to_string()),
                );
                Err(other)
            }
        }
    }
}
