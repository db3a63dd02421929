//! Structural validation of a flow-registry file.
//!
//! Edges may legitimately re-fire across dispatcher wakeups (a node can
//! retry, a fallback can restart siblings), so full acyclicity is not
//! required. What still must hold, file-wide:
//! 1. No flow lists the same node name twice.
//! 2. Every edge endpoint names either a node of its own flow or another
//!    flow in the same file (a sub-flow reference).

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use serde::Deserialize;

use fdr::{Edge, FailureRule, FlowDefinition, FlowPolicy, FlowRegistry, NodeMeta};

use crate::error::CliError;

/// The on-disk shape of a flow-registry file: one JSON document listing
/// every flow a process should know about. Nodes are read as a `Vec`
/// rather than straight into `FlowDefinition`'s `BTreeSet` so a duplicate
/// entry survives long enough to be reported instead of silently
/// deduplicating.
#[derive(Debug, Deserialize)]
pub struct FlowFile {
    pub flows: Vec<RawFlow>,
}

#[derive(Debug, Deserialize)]
pub struct RawFlow {
    pub name: String,
    pub nodes: Vec<String>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub failures: Vec<FailureRule>,
    pub policy: FlowPolicy,
    #[serde(default)]
    pub node_meta: std::collections::BTreeMap<String, NodeMeta>,
}

pub fn load(path: &Path) -> Result<FlowFile, CliError> {
    let content = std::fs::read_to_string(path).map_err(|source| CliError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let file: FlowFile = serde_json::from_str(&content)?;
    Ok(file)
}

/// Structural integrity across the whole file. Returns every violation
/// found rather than bailing on the first, so an operator fixing a bad
/// file sees the full list in one pass.
pub fn check_structural_integrity(file: &FlowFile) -> Result<(), Vec<String>> {
    let mut problems = Vec::new();
    let flow_names: HashSet<&str> = file.flows.iter().map(|f| f.name.as_str()).collect();

    for flow in &file.flows {
        let mut seen = HashSet::new();
        for node in &flow.nodes {
            if !seen.insert(node.as_str()) {
                problems.push(format!("flow '{}': duplicate node name '{node}'", flow.name));
            }
        }
        let node_set: HashSet<&str> = flow.nodes.iter().map(String::as_str).collect();

        for (i, edge) in flow.edges.iter().enumerate() {
            for name in edge.from_set.iter().chain(edge.to_set.iter()) {
                if !node_set.contains(name.as_str()) && !flow_names.contains(name.as_str()) {
                    problems.push(format!(
                        "flow '{}': edge #{i} references unknown node/flow '{name}'",
                        flow.name
                    ));
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

/// Build a [`FlowRegistry`] from an already-validated file.
pub fn into_registry(file: FlowFile) -> FlowRegistry {
    let mut builder = FlowRegistry::builder();
    for raw in file.flows {
        let def = FlowDefinition {
            name: raw.name,
            nodes: raw.nodes.into_iter().collect::<BTreeSet<_>>(),
            edges: raw.edges,
            failures: raw.failures,
            policy: raw.policy,
            node_meta: raw.node_meta,
        };
        builder = builder.add_flow(def);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdr::Condition;

    fn policy() -> FlowPolicy {
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

    #[test]
    fn duplicate_node_name_is_rejected() {
        let file = FlowFile {
            flows: vec![RawFlow {
                name: "F".into(),
                nodes: vec!["A".into(), "A".into()],
                edges: vec![],
                failures: vec![],
                policy: policy(),
                node_meta: Default::default(),
            }],
        };
        let problems = check_structural_integrity(&file).unwrap_err();
        assert!(problems.iter().any(|p| p.contains("duplicate node name 'A'")));
    }

    #[test]
    fn dangling_edge_endpoint_is_rejected() {
        let file = FlowFile {
            flows: vec![RawFlow {
                name: "F".into(),
                nodes: vec!["A".into()],
                edges: vec![Edge {
                    from_set: vec!["A".into()],
                    to_set: vec!["ghost".into()],
                    condition: Condition::Always,
                    foreach: None,
                    foreach_propagate_result: false,
                    selective_run_function: None,
                }],
                failures: vec![],
                policy: policy(),
                node_meta: Default::default(),
            }],
        };
        let problems = check_structural_integrity(&file).unwrap_err();
        assert!(problems.iter().any(|p| p.contains("unknown node/flow 'ghost'")));
    }

    #[test]
    fn edge_into_a_sibling_flow_is_not_dangling() {
        let file = FlowFile {
            flows: vec![
                RawFlow {
                    name: "F".into(),
                    nodes: vec!["A".into()],
                    edges: vec![Edge {
                        from_set: vec!["A".into()],
                        to_set: vec!["G".into()],
                        condition: Condition::Always,
                        foreach: None,
                        foreach_propagate_result: false,
                        selective_run_function: None,
                    }],
                    failures: vec![],
                    policy: policy(),
                    node_meta: Default::default(),
                },
                RawFlow {
                    name: "G".into(),
                    nodes: vec![],
                    edges: vec![],
                    failures: vec![],
                    policy: policy(),
                    node_meta: Default::default(),
                },
            ],
        };
        assert!(check_structural_integrity(&file).is_ok());
    }
}
