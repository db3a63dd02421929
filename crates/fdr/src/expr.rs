//! Condition and foreach expression carriers.
//!
//! Per the design notes, expressions are pure functions of
//! `(node_args, parent_view_with_result_accessor)`. We represent them two
//! ways, both shippable inside a [`crate::FlowDefinition`]:
//!
//! - [`Expr`] — a small AST interpreted at evaluation time. Suitable for a
//!   flow definition loaded from data (JSON/YAML) at runtime.
//! - A named [`Condition::Callable`] / [`Foreach::Callable`], resolved
//!   against a [`CallableTable`] of Rust closures linked into the binary.
//!   Suitable for an ahead-of-time, code-generated flow definition.
//!
//! Either carrier is evaluated against a [`ConditionContext`]: the
//! evaluator (in the `dispatch` crate) is responsible for resolving parent
//! task results via its storage accessor *before* constructing the
//! context, so `Expr`/callables stay pure and side-effect-free.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::NodeName;

/// Everything a condition or foreach expression needs to evaluate: the
/// flow's current `node_args`, the already-fetched results of the nodes
/// relevant to the edge being considered, and an optional view of the
/// compound parent.
pub struct ConditionContext<'a> {
    pub node_args: &'a Value,
    pub results: &'a BTreeMap<NodeName, Value>,
    pub parent: Option<&'a Value>,
}

/// A small, pure, side-effect-free expression tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expr {
    True,
    False,
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    /// True iff the JSON value at `pointer` within `node_args` is "truthy"
    /// (present, and not `false`/`null`/`0`/empty string).
    ArgsTruthy { pointer: String },
    /// True iff the JSON value at `pointer` within `node_args` equals `value`.
    ArgsEquals { pointer: String, value: Value },
    /// True iff `task`'s result is present and truthy at `pointer` (root
    /// pointer `""` checks the whole result value).
    ResultTruthy { task: NodeName, pointer: String },
    /// True iff `task`'s result at `pointer` equals `value`.
    ResultEquals { task: NodeName, pointer: String, value: Value },
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn pointer_value<'a>(root: &'a Value, pointer: &str) -> Option<&'a Value> {
    if pointer.is_empty() {
        Some(root)
    } else {
        root.pointer(pointer)
    }
}

impl Expr {
    /// Evaluate this expression against `ctx`. Never panics: any lookup
    /// that can't be resolved (missing task result, bad pointer) evaluates
    /// to `false` rather than raising — a condition that raises is treated
    /// as false.
    pub fn eval(&self, ctx: &ConditionContext) -> bool {
        match self {
            Expr::True => true,
            Expr::False => false,
            Expr::Not(inner) => !inner.eval(ctx),
            Expr::And(parts) => parts.iter().all(|e| e.eval(ctx)),
            Expr::Or(parts) => parts.iter().any(|e| e.eval(ctx)),
            Expr::ArgsTruthy { pointer } => {
                pointer_value(ctx.node_args, pointer).map(is_truthy).unwrap_or(false)
            }
            Expr::ArgsEquals { pointer, value } => {
                pointer_value(ctx.node_args, pointer) == Some(value)
            }
            Expr::ResultTruthy { task, pointer } => ctx
                .results
                .get(task)
                .and_then(|v| pointer_value(v, pointer))
                .map(is_truthy)
                .unwrap_or(false),
            Expr::ResultEquals { task, pointer, value } => ctx
                .results
                .get(task)
                .and_then(|v| pointer_value(v, pointer))
                .map(|v| v == value)
                .unwrap_or(false),
        }
    }
}

/// How an edge (or fallback, or selective run) decides whether it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Always true — the common case for unconditional edges.
    Always,
    Expr(Expr),
    /// Resolved against a [`CallableTable`] at evaluation time.
    Callable(String),
}

impl Default for Condition {
    fn default() -> Self {
        Condition::Always
    }
}

/// How an edge expands into a finite ordered sequence of child `node_args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Foreach {
    /// `range(0..n)` as integers — mirrors the literal fixture used by the
    /// original test suite (`lambda x, y: range(_FOREACH_COUNT)`).
    Range(usize),
    /// The JSON array found at `pointer` within `node_args`.
    ArgsArray { pointer: String },
    Callable(String),
}

pub type ConditionFn = dyn Fn(&ConditionContext) -> bool + Send + Sync;
pub type ForeachFn = dyn Fn(&ConditionContext) -> Vec<Value> + Send + Sync;

/// The ahead-of-time table of named callables a [`Condition::Callable`] or
/// [`Foreach::Callable`] resolves against. Built once at process start
/// alongside the rest of the registry and never mutated afterwards.
#[derive(Clone, Default)]
pub struct CallableTable {
    conditions: HashMap<String, Arc<ConditionFn>>,
    foreachs: HashMap<String, Arc<ForeachFn>>,
}

impl CallableTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_condition<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&ConditionContext) -> bool + Send + Sync + 'static,
    {
        self.conditions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn register_foreach<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&ConditionContext) -> Vec<Value> + Send + Sync + 'static,
    {
        self.foreachs.insert(name.into(), Arc::new(f));
        self
    }

    pub fn condition(&self, name: &str) -> Option<&Arc<ConditionFn>> {
        self.conditions.get(name)
    }

    pub fn foreach(&self, name: &str) -> Option<&Arc<ForeachFn>> {
        self.foreachs.get(name)
    }
}

impl std::fmt::Debug for CallableTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableTable")
            .field("conditions", &self.conditions.keys().collect::<Vec<_>>())
            .field("foreachs", &self.foreachs.keys().collect::<Vec<_>>())
            .finish()
    }
}
