//! Execution lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The execution is live and may still make progress.
    Running,
    /// The workflow returned a value.
    Completed,
    /// The workflow reached a terminal failure state.
    Failed,
    /// The execution was cancelled and stopped at a suspension point.
    Terminated,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl ExecutionStatus {
    /// Returns true if no further progress is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}
