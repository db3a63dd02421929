//! The immutable, process-wide Flow Definition Registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::expr::CallableTable;
use crate::ids::{FlowName, NodeName};
use crate::models::{Edge, FailureRule, FlowDefinition, FlowPolicy, NodeMeta};

/// Read-only lookups over every known flow. Cheap to clone (an `Arc`
/// internally) and safe to share across concurrently-running dispatchers —
/// nothing in here is ever mutated after [`FlowRegistryBuilder::build`].
#[derive(Clone)]
pub struct FlowRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    flows: BTreeMap<FlowName, FlowDefinition>,
    callables: CallableTable,
}

impl FlowRegistry {
    pub fn builder() -> FlowRegistryBuilder {
        FlowRegistryBuilder::default()
    }

    fn flow(&self, flow: &str) -> Result<&FlowDefinition, ConfigError> {
        self.inner
            .flows
            .get(flow)
            .ok_or_else(|| ConfigError::UnknownFlow(flow.to_owned()))
    }

    pub fn edges(&self, flow: &str) -> Result<&[Edge], ConfigError> {
        Ok(&self.flow(flow)?.edges)
    }

    pub fn failures(&self, flow: &str) -> Result<&[FailureRule], ConfigError> {
        Ok(&self.flow(flow)?.failures)
    }

    pub fn policy(&self, flow: &str) -> Result<&FlowPolicy, ConfigError> {
        Ok(&self.flow(flow)?.policy)
    }

    /// True if `name` is itself a registered flow (a nested sub-flow node
    /// rather than a leaf task).
    pub fn is_flow(&self, name: &str) -> bool {
        self.inner.flows.contains_key(name)
    }

    /// The queue a node's task executions should be submitted to: the
    /// node's own override if set, else the flow's default queue.
    pub fn queue(&self, flow: &str, node: &str) -> Result<String, ConfigError> {
        let def = self.flow(flow)?;
        Ok(def
            .node_meta
            .get(node)
            .and_then(|m| m.queue.clone())
            .unwrap_or_else(|| def.policy.queue.clone()))
    }

    /// The flow's nowait set — nodes started without ever entering
    /// `active_nodes`.
    pub fn nowait(&self, flow: &str) -> Result<&std::collections::BTreeSet<NodeName>, ConfigError> {
        Ok(&self.flow(flow)?.policy.nowait)
    }

    pub fn is_nowait(&self, flow: &str, node: &str) -> Result<bool, ConfigError> {
        Ok(self.flow(flow)?.policy.nowait.contains(node))
    }

    pub fn node_meta(&self, flow: &str, node: &str) -> Result<NodeMeta, ConfigError> {
        let def = self.flow(flow)?;
        if !def.nodes.contains(node) && !self.is_flow(node) {
            return Err(ConfigError::UnknownNode {
                flow: flow.to_owned(),
                node: node.to_owned(),
            });
        }
        Ok(def.meta_for(node))
    }

    pub fn callables(&self) -> &CallableTable {
        &self.inner.callables
    }

    pub fn flow_names(&self) -> impl Iterator<Item = &str> {
        self.inner.flows.keys().map(String::as_str)
    }
}

/// Builds a [`FlowRegistry`] from a set of flow definitions plus a
/// callable table. Construction is a separate concern from dispatch: a
/// process builds one registry at startup and hands a cheap-to-clone
/// handle to every dispatcher thereafter.
#[derive(Default)]
pub struct FlowRegistryBuilder {
    flows: BTreeMap<FlowName, FlowDefinition>,
    callables: CallableTable,
}

impl FlowRegistryBuilder {
    pub fn add_flow(mut self, def: FlowDefinition) -> Self {
        self.flows.insert(def.name.clone(), def);
        self
    }

    pub fn callables(mut self, callables: CallableTable) -> Self {
        self.callables = callables;
        self
    }

    pub fn build(self) -> FlowRegistry {
        tracing::info!(flow_count = self.flows.len(), "flow definition registry built");
        FlowRegistry { inner: Arc::new(Inner { flows: self.flows, callables: self.callables }) }
    }
}
