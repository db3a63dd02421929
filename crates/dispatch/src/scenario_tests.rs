//! End-to-end scenario tests (S1-S6) and a sample of the testable
//! properties, run against the in-memory broker/storage reference
//! implementations.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use broker::{BrokerAdapter, InMemoryBroker, InMemoryStorage, StorageAdapter, TaskStatus};
use fdr::{Condition, Edge, FailureRule, FlowDefinition, FlowPolicy, FlowRegistry, Foreach, NodeMeta};
use trace::NullSink;

use crate::deps::EngineDeps;
use crate::dispatcher::{Dispatcher, DispatcherOutcome};
use crate::payload::DispatcherPayload;
use crate::sse::{self, UpdateOutcome};
use crate::state::StateSnapshot;

fn base_policy() -> FlowPolicy {
    FlowPolicy {
        max_retry: 0,
        retry_countdown_secs: 0,
        queue: "dispatcher_queue".into(),
        nowait: Default::default(),
        eager_failures: Default::default(),
        propagate_node_args: true,
        propagate_parent: false,
        propagate_finished: false,
        propagate_compound_finished: false,
        propagate_compound_parent: false,
        cache_policies: Default::default(),
        cancel_on_retry: false,
    }
}

fn harness(def: FlowDefinition) -> (EngineDeps, Arc<InMemoryBroker>, Arc<InMemoryStorage>) {
    let registry = FlowRegistry::builder().add_flow(def).build();
    let broker = Arc::new(InMemoryBroker::new());
    let storage = Arc::new(InMemoryStorage::new());
    let broker_handle: Arc<dyn BrokerAdapter> = broker.clone();
    let storage_handle: Arc<dyn StorageAdapter> = storage.clone();
    let deps = EngineDeps::new(registry, broker_handle, storage_handle, Arc::new(NullSink));
    (deps, broker, storage)
}

// S1: foreach on a starting edge.
#[tokio::test]
async fn s1_foreach_start() {
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["Task1".to_string()].into_iter().collect(),
        edges: vec![Edge {
            from_set: vec![],
            to_set: vec!["Task1".into()],
            condition: Condition::Always,
            foreach: Some(Foreach::Range(20)),
            foreach_propagate_result: false,
            selective_run_function: None,
        }],
        failures: vec![],
        policy: base_policy(),
        node_meta: Default::default(),
    };
    let (deps, _broker, _storage) = harness(def);
    let node_args = json!({"seed": 1});
    let mut snapshot = StateSnapshot::fresh(1, node_args.clone(), None, None);

    let outcome = sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Retry(_)));
    assert_eq!(snapshot.active_nodes.len(), 20);
    assert!(snapshot.active_nodes.iter().all(|n| n.name == "Task1"));
    assert_eq!(snapshot.node_args, node_args);
    assert!(!snapshot.waiting_edges_idx.any_waiting());
}

// S2: foreach fires only after its from_set predecessor finishes.
#[tokio::test]
async fn s2_foreach_after_task1() {
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["Task1".to_string(), "Task2".to_string()].into_iter().collect(),
        edges: vec![
            Edge {
                from_set: vec![],
                to_set: vec!["Task1".into()],
                condition: Condition::Always,
                foreach: None,
                foreach_propagate_result: false,
                selective_run_function: None,
            },
            Edge {
                from_set: vec!["Task1".into()],
                to_set: vec!["Task2".into()],
                condition: Condition::Always,
                foreach: Some(Foreach::Range(20)),
                foreach_propagate_result: false,
                selective_run_function: None,
            },
        ],
        failures: vec![],
        policy: base_policy(),
        node_meta: Default::default(),
    };
    let (deps, broker, _storage) = harness(def);
    let mut snapshot = StateSnapshot::fresh(2, Value::Null, None, None);

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    assert_eq!(snapshot.active_nodes.len(), 1);
    assert_eq!(snapshot.active_nodes[0].name, "Task1");

    let task1_id = snapshot.active_nodes[0].id.clone();
    broker.set_status(&task1_id, TaskStatus::Success).await;

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    assert!(snapshot.finished_nodes.contains_key("Task1"));
    assert_eq!(snapshot.active_nodes.len(), 20);
    assert!(snapshot.active_nodes.iter().all(|n| n.name == "Task2"));
}

// S3: foreach propagating its element into a sub-flow's node_args.
#[tokio::test]
async fn s3_foreach_propagate_into_subflow() {
    let sub = FlowDefinition {
        name: "flow2".into(),
        nodes: BTreeSet::new(),
        edges: vec![],
        failures: vec![],
        policy: base_policy(),
        node_meta: Default::default(),
    };
    let parent = FlowDefinition {
        name: "F".into(),
        nodes: ["Task1".to_string()].into_iter().collect(),
        edges: vec![
            Edge {
                from_set: vec![],
                to_set: vec!["Task1".into()],
                condition: Condition::Always,
                foreach: None,
                foreach_propagate_result: false,
                selective_run_function: None,
            },
            Edge {
                from_set: vec!["Task1".into()],
                to_set: vec!["flow2".into()],
                condition: Condition::Always,
                foreach: Some(Foreach::Range(20)),
                foreach_propagate_result: true,
                selective_run_function: None,
            },
        ],
        failures: vec![],
        policy: base_policy(),
        node_meta: Default::default(),
    };

    let registry = FlowRegistry::builder().add_flow(parent).add_flow(sub).build();
    let broker = Arc::new(InMemoryBroker::new());
    let storage = Arc::new(InMemoryStorage::new());
    let broker_handle: Arc<dyn BrokerAdapter> = broker.clone();
    let storage_handle: Arc<dyn StorageAdapter> = storage.clone();
    let deps = EngineDeps::new(registry, broker_handle, storage_handle, Arc::new(NullSink));

    let mut snapshot = StateSnapshot::fresh(2, Value::Null, None, None);
    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    let task1_id = snapshot.active_nodes[0].id.clone();
    broker.set_status(&task1_id, TaskStatus::Success).await;

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    assert_eq!(snapshot.active_nodes.len(), 20);
    assert!(snapshot.active_nodes.iter().all(|n| n.name == "flow2"));

    let mut seen: Vec<i64> = Vec::new();
    for node in &snapshot.active_nodes {
        let payload = broker.payload_of(&node.id).await.unwrap();
        seen.push(payload.as_i64().expect("propagated element is a bare integer"));
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
}

// S4: a task that fails twice then succeeds still lets the flow terminate
// successfully, with its retry counter landing exactly at max_retry.
#[tokio::test]
async fn s4_retry_then_success() {
    let mut node_meta = std::collections::BTreeMap::new();
    node_meta.insert("T".to_string(), NodeMeta { max_retry: 2, ..Default::default() });
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["T".to_string()].into_iter().collect(),
        edges: vec![Edge {
            from_set: vec![],
            to_set: vec!["T".into()],
            condition: Condition::Always,
            foreach: None,
            foreach_propagate_result: false,
            selective_run_function: None,
        }],
        failures: vec![],
        policy: base_policy(),
        node_meta,
    };
    let (deps, broker, _storage) = harness(def);
    let mut snapshot = StateSnapshot::fresh(1, Value::Null, None, None);

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    assert_eq!(snapshot.active_nodes.len(), 1);

    for _ in 0..2 {
        let id = snapshot.active_nodes[0].id.clone();
        broker.set_status(&id, TaskStatus::Failure).await;
        sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
        assert_eq!(snapshot.active_nodes.len(), 1, "a fresh attempt must be resubmitted");
    }
    assert_eq!(snapshot.retried_nodes.get("T"), Some(&2));

    let id = snapshot.active_nodes[0].id.clone();
    broker.set_status(&id, TaskStatus::Success).await;
    let outcome = sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    match outcome {
        UpdateOutcome::Terminal(result) => {
            assert!(result.finished_nodes.contains_key("T"));
        }
        other => panic!("expected terminal success, got {other:?}"),
    }
}

// S5: no fallback covers a failure, the flow itself still has retries left.
#[tokio::test]
async fn s5_flow_level_retry() {
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["T".to_string()].into_iter().collect(),
        edges: vec![Edge {
            from_set: vec![],
            to_set: vec!["T".into()],
            condition: Condition::Always,
            foreach: None,
            foreach_propagate_result: false,
            selective_run_function: None,
        }],
        failures: vec![],
        policy: FlowPolicy { max_retry: 1, ..base_policy() },
        node_meta: Default::default(),
    };
    let (deps, broker, storage) = harness(def);
    let dispatcher = Dispatcher::new(deps);

    let payload = DispatcherPayload::fresh("F", Value::Null, None, None);
    let outcome = dispatcher.wakeup("disp-1", payload).await.unwrap();
    let task_id = match outcome {
        DispatcherOutcome::Rescheduled { task_id } => task_id,
        other => panic!("expected reschedule after fresh dispatch, got {other:?}"),
    };
    let rescheduled_payload: DispatcherPayload =
        serde_json::from_value(broker.payload_of(&task_id).await.unwrap()).unwrap();
    let inner_task_id = rescheduled_payload.state.as_ref().unwrap().active_nodes[0].id.clone();
    broker.set_status(&inner_task_id, TaskStatus::Failure).await;

    let outcome = dispatcher.wakeup("disp-1", rescheduled_payload).await.unwrap();
    let retry_task_id = match outcome {
        DispatcherOutcome::Rescheduled { task_id } => task_id,
        other => panic!("expected FLOW_RETRY reschedule, got {other:?}"),
    };
    let restarted: DispatcherPayload =
        serde_json::from_value(broker.payload_of(&retry_task_id).await.unwrap()).unwrap();
    assert!(restarted.is_fresh(), "flow-level retry must clear the snapshot");
    assert_eq!(restarted.retried_count, 1);
    let _ = storage;
}

// S6: eager_failures short-circuits straight to FLOW_FAILURE.
#[tokio::test]
async fn s6_eager_failure() {
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["T".to_string(), "Sibling".to_string()].into_iter().collect(),
        edges: vec![Edge {
            from_set: vec![],
            to_set: vec!["T".into(), "Sibling".into()],
            condition: Condition::Always,
            foreach: None,
            foreach_propagate_result: false,
            selective_run_function: None,
        }],
        failures: vec![],
        // max_retry: 0 isolates what S6 is actually about — immediacy of
        // the SSE-level failure relative to still-active siblings — from
        // the separate, already-covered-by-S5 question of flow-level
        // retry budget.
        policy: FlowPolicy { max_retry: 0, eager_failures: fdr::EagerFailures::All(true), ..base_policy() },
        node_meta: Default::default(),
    };
    let (deps, broker, _storage) = harness(def);
    let dispatcher = Dispatcher::new(deps);

    let payload = DispatcherPayload::fresh("F", Value::Null, None, None);
    let outcome = dispatcher.wakeup("disp-1", payload).await.unwrap();
    let task_id = match outcome {
        DispatcherOutcome::Rescheduled { task_id } => task_id,
        other => panic!("expected reschedule after fresh dispatch, got {other:?}"),
    };
    let rescheduled_payload: DispatcherPayload =
        serde_json::from_value(broker.payload_of(&task_id).await.unwrap()).unwrap();
    let active = &rescheduled_payload.state.as_ref().unwrap().active_nodes;
    assert_eq!(active.len(), 2, "Sibling is still active when T fails");
    let t_id = active.iter().find(|n| n.name == "T").unwrap().id.clone();
    broker.set_status(&t_id, TaskStatus::Failure).await;

    let outcome = dispatcher.wakeup("disp-1", rescheduled_payload).await.unwrap();
    match outcome {
        DispatcherOutcome::FlowFailed { .. } => {}
        other => panic!("expected immediate FLOW_FAILURE despite Sibling still active, got {other:?}"),
    }
}

// Property 7: a fallback rule, once triggered, never fires a second time
// even if its key set's failed_nodes membership is re-observed.
#[tokio::test]
async fn fallback_fires_at_most_once() {
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["T".to_string(), "Recover".to_string()].into_iter().collect(),
        edges: vec![Edge {
            from_set: vec![],
            to_set: vec!["T".into()],
            condition: Condition::Always,
            foreach: None,
            foreach_propagate_result: false,
            selective_run_function: None,
        }],
        failures: vec![FailureRule {
            key: ["T".to_string()].into_iter().collect(),
            nodes: vec!["Recover".into()],
            condition: Condition::Always,
        }],
        policy: base_policy(),
        node_meta: Default::default(),
    };
    let (deps, broker, _storage) = harness(def);
    let mut snapshot = StateSnapshot::fresh(1, Value::Null, None, None);

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    let id = snapshot.active_nodes[0].id.clone();
    broker.set_status(&id, TaskStatus::Failure).await;
    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    assert_eq!(snapshot.triggered.len(), 1);
    assert!(snapshot.active_nodes.iter().any(|n| n.name == "Recover"));

    // Re-running update with the fallback's key set still fully in
    // failed_nodes must not submit Recover a second time.
    let before = broker.len().await;
    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    assert_eq!(broker.len().await, before, "fallback must not re-fire");
}

// propagate_finished: a child started after Task1 finishes should see
// Task1's own finished_nodes exposed under the flow's own name, not just
// its raw node_args.
#[tokio::test]
async fn propagate_finished_exposes_own_finished_nodes_to_children() {
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["Task1".to_string(), "Task2".to_string()].into_iter().collect(),
        edges: vec![
            Edge {
                from_set: vec![],
                to_set: vec!["Task1".into()],
                condition: Condition::Always,
                foreach: None,
                foreach_propagate_result: false,
                selective_run_function: None,
            },
            Edge {
                from_set: vec!["Task1".into()],
                to_set: vec!["Task2".into()],
                condition: Condition::Always,
                foreach: None,
                foreach_propagate_result: false,
                selective_run_function: None,
            },
        ],
        failures: vec![],
        policy: FlowPolicy { propagate_finished: true, ..base_policy() },
        node_meta: Default::default(),
    };
    let (deps, broker, _storage) = harness(def);
    let mut snapshot = StateSnapshot::fresh(2, json!({"x": 1}), None, None);

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    let task1_id = snapshot.active_nodes[0].id.clone();
    broker.set_status(&task1_id, TaskStatus::Success).await;

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    let task2_id = snapshot.active_nodes.iter().find(|n| n.name == "Task2").unwrap().id.clone();
    let payload = broker.payload_of(&task2_id).await.unwrap();

    assert_eq!(payload["node_args"], json!({"x": 1}));
    let parent = &payload["parent"];
    assert_eq!(parent["flow_name"], json!("F"));
    assert!(parent["finished"]["Task1"].as_array().is_some(), "Task1 must appear in the forwarded parent view");
}

// Neither propagate_parent nor propagate_finished set (the common default)
// leaves a child's submitted payload exactly as before: no "parent" key.
#[tokio::test]
async fn no_propagation_flags_means_no_parent_key_in_payload() {
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["Task1".to_string()].into_iter().collect(),
        edges: vec![Edge {
            from_set: vec![],
            to_set: vec!["Task1".into()],
            condition: Condition::Always,
            foreach: None,
            foreach_propagate_result: false,
            selective_run_function: None,
        }],
        failures: vec![],
        policy: base_policy(),
        node_meta: Default::default(),
    };
    let (deps, broker, _storage) = harness(def);
    let mut snapshot = StateSnapshot::fresh(1, json!({"x": 1}), None, None);

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    let task1_id = snapshot.active_nodes[0].id.clone();
    let payload = broker.payload_of(&task1_id).await.unwrap();
    assert_eq!(payload, json!({"x": 1}), "plain node_args, no parent wrapper");
}

// run_subsequent: a selective run naming only Task1 must still let Task2
// start once Task1 finishes, because Task2 is reached transitively through
// an edge whose from_set is already selected.
#[tokio::test]
async fn selective_run_subsequent_admits_downstream_node() {
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["Task1".to_string(), "Task2".to_string()].into_iter().collect(),
        edges: vec![
            Edge {
                from_set: vec![],
                to_set: vec!["Task1".into()],
                condition: Condition::Always,
                foreach: None,
                foreach_propagate_result: false,
                selective_run_function: None,
            },
            Edge {
                from_set: vec!["Task1".into()],
                to_set: vec!["Task2".into()],
                condition: Condition::Always,
                foreach: None,
                foreach_propagate_result: false,
                selective_run_function: None,
            },
        ],
        failures: vec![],
        policy: base_policy(),
        node_meta: Default::default(),
    };
    let (deps, broker, _storage) = harness(def);
    let selective = crate::state::Selective {
        task_names: ["Task1".to_string()].into_iter().collect(),
        follow_subflows: false,
        run_subsequent: true,
    };
    let mut snapshot = StateSnapshot::fresh(2, Value::Null, Some(selective), None);

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    assert_eq!(snapshot.active_nodes.len(), 1);
    assert_eq!(snapshot.active_nodes[0].name, "Task1");
    let task1_id = snapshot.active_nodes[0].id.clone();
    broker.set_status(&task1_id, TaskStatus::Success).await;

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    assert!(
        snapshot.active_nodes.iter().any(|n| n.name == "Task2"),
        "Task2 must start under run_subsequent even though only Task1 was named"
    );
}

// Per-task retry countdown: a failed node with a configured
// retry_countdown_secs resubmits with that countdown, and the dispatcher's
// own next-retry delay is at least as long.
#[tokio::test]
async fn retry_countdown_is_applied_to_resubmission_and_next_retry() {
    let mut node_meta = std::collections::BTreeMap::new();
    node_meta.insert("T".to_string(), NodeMeta { max_retry: 1, retry_countdown_secs: 30, ..Default::default() });
    let def = FlowDefinition {
        name: "F".into(),
        nodes: ["T".to_string()].into_iter().collect(),
        edges: vec![Edge {
            from_set: vec![],
            to_set: vec!["T".into()],
            condition: Condition::Always,
            foreach: None,
            foreach_propagate_result: false,
            selective_run_function: None,
        }],
        failures: vec![],
        policy: base_policy(),
        node_meta,
    };
    let (deps, broker, _storage) = harness(def);
    let mut snapshot = StateSnapshot::fresh(1, Value::Null, None, None);

    sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    let id = snapshot.active_nodes[0].id.clone();
    broker.set_status(&id, TaskStatus::Failure).await;

    let outcome = sse::update(&deps, "F", "disp-1", &mut snapshot).await.unwrap();
    let retried_id = snapshot.active_nodes[0].id.clone();
    assert_eq!(broker.countdown_of(&retried_id).await.unwrap(), 30, "retried task must carry its configured countdown");
    match outcome {
        UpdateOutcome::Retry(next_retry) => {
            assert!(next_retry >= 30, "dispatcher's own next wakeup must not precede the retry it just queued");
        }
        other => panic!("expected Retry outcome, got {other:?}"),
    }
}
