//! `fdr` crate — the Flow Definition Registry.
//!
//! An immutable, process-wide structure built once at startup from the
//! (out-of-scope) config loader and held read-only for the lifetime of the
//! process. It owns every flow's node set, edge list, failure list, and
//! per-flow/per-task policies, plus the condition and foreach expression
//! carriers edges reference.

pub mod error;
pub mod expr;
pub mod ids;
pub mod models;
pub mod registry;

pub use error::ConfigError;
pub use expr::{CallableTable, Condition, ConditionContext, Expr, Foreach};
pub use ids::{FlowName, NodeName, TaskId};
pub use models::{
    EagerFailures, Edge, FailureRule, FlowDefinition, FlowPolicy, NodeMeta, ThrottlingPolicy,
};
pub use registry::{FlowRegistry, FlowRegistryBuilder};
