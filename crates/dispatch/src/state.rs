//! The State Snapshot — the serializable unit of dispatcher re-entry.
//!
//! Everything the System-State Engine needs to remember between wakeups
//! lives here. An implementation must resist any temptation to cache
//! derived data across wakeups outside this struct: anything not in the
//! snapshot does not exist next wakeup.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fdr::{NodeName, TaskId};

/// One entry in `active_nodes`. For a nested sub-flow, `state` carries its
/// own recursively-nested snapshot so a parent dispatcher can surface
/// compound finished/parent info without bouncing through the child's
/// dispatcher — though the child's *canonical* state still lives with the
/// child dispatcher; this is a read-only mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveNode {
    pub name: NodeName,
    pub id: TaskId,
    pub state: Option<Box<StateSnapshot>>,
}

/// The subset of a flow's nodes a user requested to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selective {
    pub task_names: BTreeSet<NodeName>,
    #[serde(default)]
    pub follow_subflows: bool,
    #[serde(default)]
    pub run_subsequent: bool,
}

impl Selective {
    /// Whether `node` may be started given what has already been selected
    /// (`selected` grows as `run_subsequent` extends the set transitively
    /// through fired edges — see [`crate::sse`]).
    pub fn allows(&self, node: &str, selected: &BTreeSet<NodeName>) -> bool {
        if self.task_names.contains(node) {
            return true;
        }
        self.run_subsequent && selected.contains(node)
    }
}

/// Links a flow instance to its parent flow instance, nested to arbitrary
/// depth. No back-pointers from child to parent snapshot — this is passed
/// explicitly in the dispatch payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundParent {
    pub flow_name: String,
    pub finished: BTreeMap<NodeName, Vec<TaskId>>,
    pub parent: Option<Box<CompoundParent>>,
}

/// Canonical encoding of a failure-key set (the set of node names that
/// must all be in `failed_nodes` for a fallback rule to fire), used to
/// record which fallback rules have already been consumed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailureFingerprint(String);

impl FailureFingerprint {
    pub fn from_set(nodes: &BTreeSet<NodeName>) -> Self {
        // BTreeSet iterates in sorted order already; join with a separator
        // that cannot appear in a node name to avoid ambiguous collisions.
        Self(nodes.iter().cloned().collect::<Vec<_>>().join("\u{1}"))
    }
}

/// A thin serializable wrapper around [`FixedBitSet`] marking, per edge
/// index in the flow's edge table, whether that edge has *not yet* fired.
/// Serialized as a plain `Vec<bool>` so the snapshot stays
/// JSON-round-trip-friendly without depending on `fixedbitset`'s own serde
/// support.
#[derive(Debug, Clone)]
pub struct WaitingEdges(FixedBitSet);

impl WaitingEdges {
    /// All edges start out waiting (unfired).
    pub fn all_waiting(edge_count: usize) -> Self {
        let mut bits = FixedBitSet::with_capacity(edge_count);
        bits.set_range(.., true);
        Self(bits)
    }

    pub fn is_waiting(&self, edge_index: usize) -> bool {
        self.0.contains(edge_index)
    }

    pub fn mark_fired(&mut self, edge_index: usize) {
        self.0.set(edge_index, false);
    }

    pub fn any_waiting(&self) -> bool {
        self.0.count_ones(..) > 0
    }

    pub fn waiting_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.ones()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }
}

impl Serialize for WaitingEdges {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bools: Vec<bool> = (0..self.0.len()).map(|i| self.0.contains(i)).collect();
        bools.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WaitingEdges {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bools = Vec::<bool>::deserialize(deserializer)?;
        let mut bits = FixedBitSet::with_capacity(bools.len());
        for (i, b) in bools.into_iter().enumerate() {
            bits.set(i, b);
        }
        Ok(WaitingEdges(bits))
    }
}

/// The serializable, in-flight state of one flow instance — the unit of
/// dispatcher re-entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub active_nodes: Vec<ActiveNode>,
    pub finished_nodes: BTreeMap<NodeName, Vec<TaskId>>,
    pub failed_nodes: BTreeMap<NodeName, Vec<TaskId>>,
    pub waiting_edges_idx: WaitingEdges,
    pub triggered: BTreeSet<FailureFingerprint>,
    pub retried_nodes: BTreeMap<NodeName, u32>,
    pub node_args: Value,
    pub selective: Option<Selective>,
    pub parent: Option<CompoundParent>,
    /// Last time each node was started, for throttling.
    #[serde(default)]
    pub last_started: BTreeMap<NodeName, DateTime<Utc>>,
    /// Monotonic counter used to derive deterministic child idempotency
    /// keys: `(flow_id, node_name, child_seq)`.
    #[serde(default)]
    pub child_seq: u64,
}

impl StateSnapshot {
    /// A brand-new snapshot for a flow with `edge_count` edges, born at
    /// flow dispatch with no progress yet.
    pub fn fresh(edge_count: usize, node_args: Value, selective: Option<Selective>, parent: Option<CompoundParent>) -> Self {
        Self {
            active_nodes: Vec::new(),
            finished_nodes: BTreeMap::new(),
            failed_nodes: BTreeMap::new(),
            waiting_edges_idx: WaitingEdges::all_waiting(edge_count),
            triggered: BTreeSet::new(),
            retried_nodes: BTreeMap::new(),
            node_args,
            selective,
            parent,
            last_started: BTreeMap::new(),
            child_seq: 0,
        }
    }

    /// Next deterministic idempotency key for a child start.
    pub fn next_idempotency_key(&mut self, flow_id: &str, node_name: &str) -> String {
        let key = format!("{flow_id}:{node_name}:{}", self.child_seq);
        self.child_seq += 1;
        key
    }

    /// A node name currently occupies at most one of the three buckets
    /// between wakeups. Debug-only sanity check.
    #[cfg(debug_assertions)]
    pub fn debug_check_partition_invariant(&self) {
        let active: BTreeSet<&str> = self.active_nodes.iter().map(|n| n.name.as_str()).collect();
        for name in self.finished_nodes.keys() {
            debug_assert!(!active.contains(name.as_str()), "node '{name}' is both active and finished");
        }
        for name in self.failed_nodes.keys() {
            debug_assert!(!active.contains(name.as_str()), "node '{name}' is both active and failed");
        }
    }
}
