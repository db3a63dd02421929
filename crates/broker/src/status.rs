//! Task status as observed through the broker.

use serde::{Deserialize, Serialize};

/// The status of one task instance as the broker reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Revoked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TaskStatus::Failure | TaskStatus::Revoked)
    }
}
