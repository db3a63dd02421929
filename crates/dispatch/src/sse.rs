//! The System-State Engine — the heart of the dispatcher.
//!
//! `update()` executes one dispatcher wakeup: poll active nodes, harvest
//! sub-flow results, handle failures (fallbacks + retries), fire ready
//! edges (with foreach expansion and selective gating), commit the
//! transition, and decide whether the flow has terminated.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde_json::{json, Value};

use broker::TaskStatus;
use fdr::{Edge, NodeName, TaskId};
use trace::{FlowInfo, TraceEvent, TraceEventKind};

use crate::cfe::{evaluate_condition, expand_foreach, gather_results, parent_view};
use crate::deps::EngineDeps;
use crate::error::DispatcherError;
use crate::state::{ActiveNode, FailureFingerprint, StateSnapshot};

/// What one `update()` call decided.
#[derive(Debug)]
pub enum UpdateOutcome {
    Terminal(TerminalResult),
    /// Re-schedule this dispatcher after `countdown` seconds.
    Retry(u64),
}

#[derive(Debug, Clone)]
pub struct TerminalResult {
    pub finished_nodes: BTreeMap<NodeName, Vec<TaskId>>,
    pub failed_nodes: BTreeMap<NodeName, Vec<TaskId>>,
}

/// Harvested compound state the parent folds in from a finished/failed
/// sub-flow, read back from storage under the sub-flow node's own name.
#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
struct CompoundHarvest {
    #[serde(default)]
    finished_nodes: BTreeMap<NodeName, Vec<TaskId>>,
    #[serde(default)]
    failed_nodes: BTreeMap<NodeName, Vec<TaskId>>,
}

fn flow_info(flow_name: &str, dispatcher_id: &str, snapshot: &StateSnapshot) -> FlowInfo {
    FlowInfo {
        flow_name: flow_name.to_owned(),
        dispatcher_id: dispatcher_id.to_owned(),
        node_args: snapshot.node_args.clone(),
        retry: None,
        queue: String::new(),
        state: None,
        selective: snapshot.selective.as_ref().and_then(|s| serde_json::to_value(s).ok()),
        retried_count: 0,
        parent: snapshot.parent.as_ref().and_then(|p| serde_json::to_value(p).ok()),
    }
}

/// Execute one dispatcher wakeup against `snapshot`, mutating it in place.
pub async fn update(
    deps: &EngineDeps,
    flow_name: &str,
    dispatcher_id: &str,
    snapshot: &mut StateSnapshot,
) -> Result<UpdateOutcome, DispatcherError> {
    let policy = deps.registry.policy(flow_name)?.clone();
    let edges = deps.registry.edges(flow_name)?.to_vec();
    let failure_rules = deps.registry.failures(flow_name)?.to_vec();

    // ---- Step 1: poll active nodes -----------------------------------
    let previously_active = std::mem::take(&mut snapshot.active_nodes);
    let mut still_active: Vec<ActiveNode> = Vec::new();
    let mut newly_finished: Vec<ActiveNode> = Vec::new();
    let mut newly_failed: Vec<ActiveNode> = Vec::new();

    for node in previously_active {
        let status = deps.broker.status(&node.id).await?;
        match status {
            TaskStatus::Success => newly_finished.push(node),
            TaskStatus::Failure | TaskStatus::Revoked => newly_failed.push(node),
            TaskStatus::Pending | TaskStatus::Started => still_active.push(node),
        }
    }

    // Break ties among same-wakeup completions by task id, lexicographically.
    newly_finished.sort_by(|a, b| a.id.cmp(&b.id));
    newly_failed.sort_by(|a, b| a.id.cmp(&b.id));

    for node in &newly_finished {
        deps.trace.emit(TraceEvent::new(
            TraceEventKind::NodeSuccessful,
            flow_info(flow_name, dispatcher_id, snapshot),
        ));
        snapshot.finished_nodes.entry(node.name.clone()).or_default().push(node.id.clone());
    }
    for node in &newly_failed {
        deps.trace.emit(TraceEvent::new(
            TraceEventKind::NodeFailure,
            flow_info(flow_name, dispatcher_id, snapshot),
        ));
        snapshot.failed_nodes.entry(node.name.clone()).or_default().push(node.id.clone());
    }

    // ---- Step 2: sub-flow result harvest -----------------------------
    for node in newly_finished.iter().chain(newly_failed.iter()) {
        if !deps.registry.is_flow(&node.name) {
            continue;
        }
        let harvest: CompoundHarvest = deps
            .storage
            .get_result(&node.name, &node.id)
            .await
            .ok()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        if policy.propagate_compound_finished {
            for (name, ids) in harvest.finished_nodes {
                snapshot.finished_nodes.entry(name).or_default().extend(ids);
            }
        }
        if policy.propagate_compound_parent {
            for (name, ids) in harvest.failed_nodes {
                snapshot.failed_nodes.entry(name).or_default().extend(ids);
            }
        }
    }

    // ---- Step 3: failure handling -------------------------------------
    let newly_failed_names: BTreeSet<NodeName> = newly_failed.iter().map(|n| n.name.clone()).collect();

    // 3a: fallback matching, evaluated against the up-to-date failed set.
    for rule in &failure_rules {
        let fp = FailureFingerprint::from_set(&rule.key);
        if snapshot.triggered.contains(&fp) {
            continue;
        }
        if !rule.key.iter().all(|n| snapshot.failed_nodes.contains_key(n)) {
            continue;
        }
        let results = gather_results(deps.storage.as_ref(), snapshot, &rule.key.iter().cloned().collect::<Vec<_>>()).await;
        let parent = parent_view(snapshot);
        let fires = evaluate_condition(
            &rule.condition,
            deps.registry.callables(),
            &snapshot.node_args,
            &results,
            parent.as_ref(),
            &deps.trace,
            || flow_info(flow_name, dispatcher_id, snapshot),
        );
        if fires {
            let node_args = snapshot.node_args.clone();
            for fallback_node in &rule.nodes {
                start_node(deps, flow_name, dispatcher_id, snapshot, fallback_node, node_args.clone(), &policy, 0).await?;
            }
            snapshot.triggered.insert(fp);
            deps.trace.emit(TraceEvent::new(
                TraceEventKind::FallbackStart,
                flow_info(flow_name, dispatcher_id, snapshot),
            ));
        }
    }

    // 3b/3c: retry-or-fail each node that failed this wakeup.
    let mut pending_flow_error: Option<Value> = None;
    let mut max_task_countdown: u64 = 0;
    for node_name in &newly_failed_names {
        let meta = deps.registry.node_meta(flow_name, node_name)?;
        let covered = failure_rules.iter().any(|r| {
            r.key.contains(node_name) && snapshot.triggered.contains(&FailureFingerprint::from_set(&r.key))
        });

        if covered && policy.eager_failures.is_eager_for(node_name) {
            // Fallback already claimed it eagerly — no self-retry.
            continue;
        }

        let current = *snapshot.retried_nodes.get(node_name).unwrap_or(&0);
        if current < meta.max_retry {
            snapshot.retried_nodes.insert(node_name.clone(), current + 1);
            let node_args = snapshot.node_args.clone();
            max_task_countdown = max_task_countdown.max(meta.retry_countdown_secs);
            start_node(deps, flow_name, dispatcher_id, snapshot, node_name, node_args, &policy, meta.retry_countdown_secs)
                .await?;
            continue;
        }

        if !covered {
            let snapshot_json = serde_json::to_value(&*snapshot).unwrap_or(Value::Null);
            if policy.eager_failures.is_eager_for(node_name) {
                deps.trace.emit(TraceEvent::new(
                    TraceEventKind::FlowFailure,
                    flow_info(flow_name, dispatcher_id, snapshot),
                ));
                return Err(DispatcherError::flow_error(snapshot_json));
            }
            pending_flow_error = Some(snapshot_json);
        }
    }

    // ---- Step 4 & 5: edge firing + selective gating --------------------
    let mut selected: BTreeSet<NodeName> =
        snapshot.selective.as_ref().map(|s| s.task_names.clone()).unwrap_or_default();

    let waiting_indices: Vec<usize> = snapshot.waiting_edges_idx.waiting_indices().collect();
    for idx in waiting_indices {
        let edge = &edges[idx];
        if !edge_ready(edge, snapshot) {
            continue;
        }

        let results = gather_results(deps.storage.as_ref(), snapshot, &edge.from_set).await;
        let parent = parent_view(snapshot);
        let fires = evaluate_condition(
            &edge.condition,
            deps.registry.callables(),
            &snapshot.node_args,
            &results,
            parent.as_ref(),
            &deps.trace,
            || flow_info(flow_name, dispatcher_id, snapshot),
        );

        if !fires {
            deps.trace.emit(TraceEvent::new(
                TraceEventKind::ConditionFalse,
                flow_info(flow_name, dispatcher_id, snapshot),
            ));
            snapshot.waiting_edges_idx.mark_fired(idx);
            continue;
        }

        // run_subsequent: a selective run extends transitively through
        // outgoing edges from already-selected nodes. A starting edge
        // (empty from_set) never extends the set this way — only a
        // predecessor actually in `selected` does — so this edge's
        // targets become eligible for `Selective::allows` *before* the
        // gating check below runs, rather than only after they themselves
        // have already started.
        if !edge.from_set.is_empty()
            && snapshot.selective.as_ref().map(|s| s.run_subsequent).unwrap_or(false)
            && edge.from_set.iter().all(|n| selected.contains(n))
        {
            selected.extend(edge.to_set.iter().cloned());
        }

        if let Some(foreach) = &edge.foreach {
            let elements = expand_foreach(foreach, deps.registry.callables(), &snapshot.node_args, &results, parent.as_ref());
            deps.trace.emit(
                TraceEvent::new(TraceEventKind::ForeachExpand, flow_info(flow_name, dispatcher_id, snapshot))
                    .with_extra("count", elements.len() as u64),
            );
            for element in elements {
                let (child_args, attach) = if edge.foreach_propagate_result {
                    (element, None)
                } else {
                    (snapshot.node_args.clone(), Some(element))
                };
                for target in &edge.to_set {
                    maybe_start_gated(
                        deps, flow_name, dispatcher_id, snapshot, target, child_args.clone(), attach.clone(), &policy,
                        &edge.selective_run_function, &mut selected, 0,
                    )
                    .await?;
                }
            }
        } else {
            let node_args = snapshot.node_args.clone();
            for target in &edge.to_set {
                maybe_start_gated(
                    deps, flow_name, dispatcher_id, snapshot, target, node_args.clone(), None, &policy,
                    &edge.selective_run_function, &mut selected, 0,
                )
                .await?;
            }
        }

        snapshot.waiting_edges_idx.mark_fired(idx);
    }

    // ---- Step 6: commit (merge still-running + newly-started) ---------
    still_active.extend(std::mem::take(&mut snapshot.active_nodes));
    snapshot.active_nodes = still_active;

    #[cfg(debug_assertions)]
    snapshot.debug_check_partition_invariant();

    // ---- Step 7: termination decision ----------------------------------
    if snapshot.active_nodes.is_empty() {
        // A node that failed but later succeeded via retry is no longer a
        // blocker — only a node with no matching `finished_nodes` entry is
        // genuinely stuck.
        let mut stuck_failed = snapshot.failed_nodes.keys().filter(|n| !snapshot.finished_nodes.contains_key(*n));
        let covered_all = stuck_failed.all(|n| {
            failure_rules.iter().any(|r| r.key.contains(n) && snapshot.triggered.contains(&FailureFingerprint::from_set(&r.key)))
        });
        if covered_all {
            deps.trace.emit(TraceEvent::new(TraceEventKind::FlowEnd, flow_info(flow_name, dispatcher_id, snapshot)));
            return Ok(UpdateOutcome::Terminal(TerminalResult {
                finished_nodes: snapshot.finished_nodes.clone(),
                failed_nodes: BTreeMap::new(),
            }));
        }
        let snapshot_json = pending_flow_error.unwrap_or_else(|| serde_json::to_value(&*snapshot).unwrap_or(Value::Null));
        deps.trace.emit(TraceEvent::new(TraceEventKind::FlowFailure, flow_info(flow_name, dispatcher_id, snapshot)));
        return Err(DispatcherError::flow_error(snapshot_json));
    }

    let next_retry = compute_next_retry(&policy, max_task_countdown);
    Ok(UpdateOutcome::Retry(next_retry))
}

/// Derive the `parent_view` a newly-started child is handed, per
/// `propagate_parent`/`propagate_finished` (§4.3 "Starting a child").
/// `propagate_parent` forwards this flow's own compound-parent chain
/// unchanged; `propagate_finished` additionally exposes this flow's own
/// `finished_nodes` to the child under its own flow name, nested ahead of
/// whatever it's already forwarding. Neither flag set (the common case)
/// yields `None`, leaving a child's submitted payload exactly as before.
fn build_parent_view(policy: &fdr::FlowPolicy, flow_name: &str, snapshot: &StateSnapshot) -> Option<Value> {
    if !policy.propagate_parent && !policy.propagate_finished {
        return None;
    }
    let inherited = if policy.propagate_parent { snapshot.parent.clone() } else { None };
    if policy.propagate_finished {
        let compound = crate::state::CompoundParent {
            flow_name: flow_name.to_owned(),
            finished: snapshot.finished_nodes.clone(),
            parent: inherited.map(Box::new),
        };
        serde_json::to_value(&compound).ok()
    } else {
        inherited.and_then(|p| serde_json::to_value(&p).ok())
    }
}

fn edge_ready(edge: &Edge, snapshot: &StateSnapshot) -> bool {
    edge.from_set.iter().all(|n| snapshot.finished_nodes.contains_key(n))
}

/// `max(per-task retry countdowns, flow idle countdown, 0)`. Per-task
/// countdowns are also applied directly to each retried task's own
/// broker submission (see `maybe_start_gated`); `max_task_countdown` is
/// the largest one seen this wakeup, so the dispatcher doesn't wake up
/// again before the slowest retry it just queued is even due to run.
fn compute_next_retry(policy: &fdr::FlowPolicy, max_task_countdown: u64) -> u64 {
    policy.retry_countdown_secs.max(max_task_countdown)
}

#[allow(clippy::too_many_arguments)]
async fn start_node(
    deps: &EngineDeps,
    flow_name: &str,
    dispatcher_id: &str,
    snapshot: &mut StateSnapshot,
    node_name: &str,
    node_args: Value,
    policy: &fdr::FlowPolicy,
    countdown: u64,
) -> Result<(), DispatcherError> {
    maybe_start_gated(
        deps, flow_name, dispatcher_id, snapshot, node_name, node_args, None, policy, &None, &mut BTreeSet::new(),
        countdown,
    )
    .await
}

/// Start one child, honoring throttling, selective gating, and the
/// `nowait` set. `attach` is the foreach element value when
/// `foreach_propagate_result` is false (it rides alongside `node_args`
/// rather than replacing it). `countdown` delays the broker's execution
/// of the submitted task — nonzero only when this start is a per-task
/// retry (`NodeMeta::retry_countdown_secs`); a fresh edge-fired start is
/// always immediate.
#[allow(clippy::too_many_arguments)]
async fn maybe_start_gated(
    deps: &EngineDeps,
    flow_name: &str,
    dispatcher_id: &str,
    snapshot: &mut StateSnapshot,
    node_name: &str,
    node_args: Value,
    attach: Option<Value>,
    policy: &fdr::FlowPolicy,
    selective_run_function: &Option<String>,
    selected: &mut BTreeSet<NodeName>,
    countdown: u64,
) -> Result<(), DispatcherError> {
    if let Some(sel) = &snapshot.selective {
        let allowed = sel.allows(node_name, selected) || {
            // A registered selective_run_function can override containment
            // for this specific edge: normally no node is started whose
            // name is outside selective.task_names (plus transitively
            // required predecessors, when run_subsequent is set).
            match selective_run_function {
                Some(name) => deps
                    .registry
                    .callables()
                    .condition(name)
                    .map(|f| {
                        let results = BTreeMap::new();
                        let ctx = fdr::ConditionContext { node_args: &node_args, results: &results, parent: None };
                        f(&ctx)
                    })
                    .unwrap_or(false),
                None => false,
            }
        };
        if !allowed {
            deps.trace.emit(TraceEvent::new(
                TraceEventKind::SelectiveOmit,
                flow_info(flow_name, dispatcher_id, snapshot),
            ));
            return Ok(());
        }
    }

    if let Some(meta) = deps.registry.node_meta(flow_name, node_name).ok() {
        if let Some(throttle) = meta.throttling {
            if let Some(last) = snapshot.last_started.get(node_name) {
                let elapsed = Utc::now().signed_duration_since(*last);
                if elapsed.num_seconds() < throttle.window_secs as i64 {
                    // Deferred: leave it for the next wakeup, nothing to do now.
                    return Ok(());
                }
            }
        }
    }

    let nowait_set = deps.registry.nowait(flow_name)?;
    let is_nowait = nowait_set.contains(node_name);
    let queue = deps.registry.queue(flow_name, node_name)?;

    // A flow may opt out of handing its own node_args down to children —
    // only the foreach element (if any) still rides along.
    let effective_args = if policy.propagate_node_args { node_args } else { Value::Null };
    let parent_view = build_parent_view(policy, flow_name, snapshot);
    let submit_args = match (attach, parent_view) {
        (Some(element), Some(parent)) => {
            json!({ "node_args": effective_args, "foreach_element": element, "parent": parent })
        }
        (Some(element), None) => json!({ "node_args": effective_args, "foreach_element": element }),
        (None, Some(parent)) => json!({ "node_args": effective_args, "parent": parent }),
        (None, None) => effective_args,
    };

    let idempotency_key = snapshot.next_idempotency_key(dispatcher_id, node_name);
    let task_id = deps.broker.submit(&queue, submit_args, countdown, Some(&idempotency_key)).await?;

    snapshot.last_started.insert(node_name.to_owned(), Utc::now());
    selected.insert(node_name.to_owned());

    deps.trace.emit(TraceEvent::new(TraceEventKind::NodeStart, flow_info(flow_name, dispatcher_id, snapshot)));

    if !is_nowait {
        snapshot.active_nodes.push(ActiveNode { name: node_name.to_owned(), id: task_id, state: None });
    }

    Ok(())
}
