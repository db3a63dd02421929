//! The Condition & Foreach Evaluator.
//!
//! Two pure-from-the-caller's-viewpoint entry points. Both are handed a
//! storage accessor capability rather than reaching for storage
//! themselves — the accessor call happens here, in the evaluator, not
//! inside [`fdr::Expr`] or a registered callable, which stay pure
//! functions of an already-assembled [`fdr::ConditionContext`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use broker::StorageAdapter;
use fdr::{CallableTable, Condition, ConditionContext, Foreach, NodeName, TaskId};
use trace::{FlowInfo, TraceEvent, TraceEventKind, TraceSink};

use crate::state::StateSnapshot;

/// Fetch the latest result for each of `nodes` that has actually finished,
/// via the storage adapter. A node with no finished entry, or whose
/// result fetch fails, is simply omitted — conditions referencing it will
/// see a missing result and evaluate falsy rather than panicking — a
/// condition that raises is treated as false.
pub async fn gather_results(
    storage: &dyn StorageAdapter,
    snapshot: &StateSnapshot,
    nodes: &[NodeName],
) -> BTreeMap<NodeName, Value> {
    let mut out = BTreeMap::new();
    for node in nodes {
        let Some(ids) = snapshot.finished_nodes.get(node) else { continue };
        let Some(last_id) = ids.last() else { continue };
        if let Ok(value) = storage.get_result(node, last_id).await {
            out.insert(node.clone(), value);
        }
    }
    out
}

fn parent_json(snapshot: &StateSnapshot) -> Option<Value> {
    snapshot.parent.as_ref().map(|p| serde_json::to_value(p).unwrap_or(Value::Null))
}

/// Evaluate an edge/fallback/selective condition. Never panics: an
/// unresolvable callable is treated as `false` and reported via a
/// `CONDITION_FALSE` trace event, mirroring how a raising condition is
/// handled.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_condition(
    condition: &Condition,
    callables: &CallableTable,
    node_args: &Value,
    results: &BTreeMap<NodeName, Value>,
    parent: Option<&Value>,
    trace_sink: &Arc<dyn TraceSink>,
    flow_info: impl FnOnce() -> FlowInfo,
) -> bool {
    let ctx = ConditionContext { node_args, results, parent };
    match condition {
        Condition::Always => true,
        Condition::Expr(expr) => expr.eval(&ctx),
        Condition::Callable(name) => match callables.condition(name) {
            Some(f) => f(&ctx),
            None => {
                trace_sink.emit(
                    TraceEvent::new(TraceEventKind::ConditionFalse, flow_info())
                        .with_extra("reason", format!("unregistered condition callable '{name}'")),
                );
                false
            }
        },
    }
}

/// Expand a foreach annotation into a finite ordered sequence of
/// element-args. Unlike conditions, an unresolvable foreach has no safe
/// "false" fallback — it yields an empty sequence (no children started),
/// which is the least-surprising reading of "a condition that raises is
/// treated as false" applied to expansion.
pub fn expand_foreach(
    foreach: &Foreach,
    callables: &CallableTable,
    node_args: &Value,
    results: &BTreeMap<NodeName, Value>,
    parent: Option<&Value>,
) -> Vec<Value> {
    let ctx = ConditionContext { node_args, results, parent };
    match foreach {
        Foreach::Range(n) => (0..*n).map(|i| Value::from(i as u64)).collect(),
        Foreach::ArgsArray { pointer } => {
            let pointed = if pointer.is_empty() { Some(node_args) } else { node_args.pointer(pointer) };
            pointed.and_then(Value::as_array).cloned().unwrap_or_default()
        }
        Foreach::Callable(name) => callables.foreach(name).map(|f| f(&ctx)).unwrap_or_default(),
    }
}

/// Convenience for building the parent-view argument `evaluate_condition`
/// and `expand_foreach` want, from a snapshot already holding its
/// `CompoundParent`.
pub fn parent_view(snapshot: &StateSnapshot) -> Option<Value> {
    parent_json(snapshot)
}

/// Public re-export used by higher-level callers that need a TaskId in
/// scope alongside the evaluator (keeps import lists tidy at call sites).
pub type ResultId = TaskId;
