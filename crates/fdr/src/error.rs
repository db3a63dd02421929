//! FDR-level error type.

use thiserror::Error;

/// Raised when a lookup against the registry names a flow or node that was
/// never registered. Always surfaced by the caller as a dispatcher defect
/// — it never triggers a retry, since an unknown flow/node name cannot
/// become known by waiting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown flow: '{0}'")]
    UnknownFlow(String),

    #[error("unknown node '{node}' in flow '{flow}'")]
    UnknownNode { flow: String, node: String },

    #[error("flow '{0}' references a condition callable that was never registered: '{1}'")]
    UnknownCallable(String, String),
}
