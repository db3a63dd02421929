//! Identifier types shared by every crate that talks about flows and tasks.

use serde::{Deserialize, Serialize};

/// Name of a flow, as it appears in the flow definition table.
pub type FlowName = String;

/// Name of a node (task or nested flow) within a flow.
pub type NodeName = String;

/// Opaque task identifier, owned by the broker. The dispatcher treats it as
/// an opaque, totally-ordered (lexicographically) string — the broker is
/// free to use whatever scheme it wants (UUID, Celery task id, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
