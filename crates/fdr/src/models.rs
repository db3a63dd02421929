//! Flow, node, edge, and policy definitions — the data FDR serves.
//!
//! These types are the source of truth for what a flow looks like once
//! loaded; they are built once by [`crate::registry::FlowRegistryBuilder`]
//! and never mutated afterwards.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expr::{Condition, Foreach};
use crate::ids::NodeName;

/// A directed edge `from_set -> to_set`, optionally foreach-expanded.
///
/// `from_set` may be empty, meaning a *starting edge*: it fires once, at
/// flow birth, unconditionally checked for readiness (it is always ready).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from_set: Vec<NodeName>,
    pub to_set: Vec<NodeName>,
    #[serde(default)]
    pub condition: Condition,
    pub foreach: Option<Foreach>,
    #[serde(default)]
    pub foreach_propagate_result: bool,
    /// Name of a callable (resolved via [`crate::CallableTable`]) that
    /// decides whether this edge may fire under a selective run.
    pub selective_run_function: Option<String>,
}

/// A fallback rule: fires once all nodes in `key` have failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRule {
    /// The failure-key set this rule is watching.
    pub key: BTreeSet<NodeName>,
    /// Nodes to start when the rule fires.
    pub nodes: Vec<NodeName>,
    #[serde(default)]
    pub condition: Condition,
}

/// Preserves both shapes a flow's `eager_failures` policy can take: a
/// plain boolean ("any failure is eager") or a set of node names ("only
/// these nodes are eager").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EagerFailures {
    All(bool),
    Only(BTreeSet<NodeName>),
}

impl EagerFailures {
    pub fn is_eager_for(&self, node: &str) -> bool {
        match self {
            EagerFailures::All(b) => *b,
            EagerFailures::Only(set) => set.contains(node),
        }
    }
}

impl Default for EagerFailures {
    fn default() -> Self {
        EagerFailures::All(false)
    }
}

/// A node's throttling window: defer a start if the node was last started
/// less than `window_secs` ago.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThrottlingPolicy {
    pub window_secs: u64,
}

/// Per-task metadata, keyed by node name within a flow.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeMeta {
    /// Overrides the flow's queue for this node's executions, if set.
    pub queue: Option<String>,
    pub throttling: Option<ThrottlingPolicy>,
    /// Name of the storage adapter backing this node's results.
    pub storage: Option<String>,
    pub output_schema: Option<Value>,
    /// Per-task retry ceiling; `retried_nodes[n] <= max_retry(n)`.
    #[serde(default)]
    pub max_retry: u32,
    #[serde(default)]
    pub retry_countdown_secs: u64,
}

/// Per-flow policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowPolicy {
    /// Max number of whole-flow retries, consulted on `FlowError`.
    #[serde(default)]
    pub max_retry: u32,
    #[serde(default)]
    pub retry_countdown_secs: u64,
    pub queue: String,
    #[serde(default)]
    pub nowait: BTreeSet<NodeName>,
    #[serde(default)]
    pub eager_failures: EagerFailures,
    #[serde(default = "default_true")]
    pub propagate_node_args: bool,
    #[serde(default)]
    pub propagate_parent: bool,
    #[serde(default)]
    pub propagate_finished: bool,
    #[serde(default)]
    pub propagate_compound_finished: bool,
    #[serde(default)]
    pub propagate_compound_parent: bool,
    /// Opaque per-node cache policy hints. Not exercised by the core
    /// engine: a pluggable accessor layered under storage is free to
    /// interpret these however it likes.
    #[serde(default)]
    pub cache_policies: std::collections::BTreeMap<NodeName, Value>,
    /// Cancel in-flight children on a flow-level retry. Defaults to
    /// `false`: children continue, their results are discarded on the
    /// next (fresh) dispatch.
    #[serde(default)]
    pub cancel_on_retry: bool,
}

fn default_true() -> bool {
    true
}

/// A complete flow definition: nodes, edges, failures, and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    pub nodes: BTreeSet<NodeName>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub failures: Vec<FailureRule>,
    pub policy: FlowPolicy,
    #[serde(default)]
    pub node_meta: std::collections::BTreeMap<NodeName, NodeMeta>,
}

impl FlowDefinition {
    /// Whether `name` is itself a registered flow (i.e. a node that is a
    /// nested sub-flow rather than a leaf task). Resolved against the
    /// whole registry, not just this definition — see
    /// [`crate::FlowRegistry::is_flow`].
    pub fn meta_for(&self, node: &str) -> NodeMeta {
        self.node_meta.get(node).cloned().unwrap_or_default()
    }
}
