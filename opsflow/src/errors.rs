//! Error taxonomy for the orchestration layer.
//!
//! Activity failures carry an [`ErrorKind`] classification; the owning
//! state machine alone decides whether a failure is retried,
//! compensated, or surfaced as a terminal outcome.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of an activity failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network faults, rate limits and similar; retried per policy.
    Transient,
    /// An attempt exceeded its timeout. Retriable unless the policy
    /// lists `Timeout` as non-retriable.
    Timeout,
    /// Deterministic faults: compile errors, failing tests, malformed
    /// input. Retrying cannot change the outcome.
    Deterministic,
    /// The operation failed after creating some of its resources;
    /// the owning workflow must compensate.
    Compensable,
    /// Requires manual intervention; never retried.
    Fatal,
    /// The execution was cancelled at a suspension point.
    Cancelled,
}

impl ErrorKind {
    /// Kinds that are never retried regardless of policy.
    #[must_use]
    pub fn is_intrinsically_terminal(self) -> bool {
        matches!(self, Self::Deterministic | Self::Fatal | Self::Cancelled)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Timeout => write!(f, "timeout"),
            Self::Deterministic => write!(f, "deterministic"),
            Self::Compensable => write!(f, "compensable"),
            Self::Fatal => write!(f, "fatal"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failed activity attempt.
///
/// Recorded in history and bubbled to the owning workflow unchanged, so
/// the same failure is observed on replay.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{activity}: {message}")]
pub struct ActivityError {
    /// The activity that failed.
    pub activity: String,
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Structured failure detail (diagnostics, partial-creation flags).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Creates a new activity error.
    #[must_use]
    pub fn new(activity: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(activity, ErrorKind::Transient, message)
    }

    /// Creates a deterministic (never retried) error.
    #[must_use]
    pub fn deterministic(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(activity, ErrorKind::Deterministic, message)
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(activity, ErrorKind::Fatal, message)
    }

    /// Creates a cancellation error for the named suspension point.
    #[must_use]
    pub fn cancelled(at: impl Into<String>) -> Self {
        Self::new(at, ErrorKind::Cancelled, "execution cancelled")
    }

    /// Attaches structured detail.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Reads a boolean flag from the structured detail, if present.
    #[must_use]
    pub fn detail_flag(&self, key: &str) -> Option<bool> {
        self.details.as_ref()?.get(key)?.as_bool()
    }
}

/// Compact failure report surfaced through `describe()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Classification of the underlying failure.
    pub kind: ErrorKind,
    /// The state or stage the execution ended in.
    pub state: String,
    /// Human-readable description.
    pub message: String,
}

impl ErrorSummary {
    /// Creates a new error summary.
    #[must_use]
    pub fn new(kind: ErrorKind, state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            state: state.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} (state: {})", self.kind, self.message, self.state)
    }
}

/// Terminal outcome of a workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The input could not be parsed; deterministic, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The execution was cancelled at a suspension point.
    #[error("execution cancelled")]
    Cancelled,

    /// The state machine reached a terminal failure state.
    #[error("{}", .summary.message)]
    Terminal {
        /// Structured report of the terminal state.
        summary: ErrorSummary,
    },
}

impl WorkflowError {
    /// The summary reported through `describe()`.
    #[must_use]
    pub fn summary(&self) -> ErrorSummary {
        match self {
            Self::InvalidInput(msg) => {
                ErrorSummary::new(ErrorKind::Deterministic, "input", msg.clone())
            }
            Self::Cancelled => {
                ErrorSummary::new(ErrorKind::Cancelled, "cancelled", "execution cancelled")
            }
            Self::Terminal { summary } => summary.clone(),
        }
    }
}

impl From<ActivityError> for WorkflowError {
    fn from(err: ActivityError) -> Self {
        if err.kind == ErrorKind::Cancelled {
            return Self::Cancelled;
        }
        let summary = ErrorSummary::new(err.kind, err.activity.clone(), err.to_string());
        Self::Terminal { summary }
    }
}

/// Errors returned by coordinator client calls.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The workflow type was never registered.
    #[error("workflow type not registered: {0}")]
    UnknownWorkflowType(String),

    /// No execution (or query) with this identity is known.
    #[error("not found: {0}")]
    NotFound(String),

    /// An execution with this id is already live.
    #[error("execution already running: {0}")]
    AlreadyRunning(String),

    /// The query is declared but its data is not available yet.
    /// Partial data is never returned.
    #[error("query '{name}' on execution '{execution}' is not ready")]
    NotReady {
        /// The execution id.
        execution: String,
        /// The query name.
        name: String,
    },

    /// A resumed history was recorded under a different workflow type.
    #[error("history for '{execution}' was recorded by '{recorded}', not '{requested}'")]
    TypeMismatch {
        /// The execution id.
        execution: String,
        /// The type found in the recorded history.
        recorded: String,
        /// The type requested by the caller.
        requested: String,
    },

    /// The target execution is not running.
    #[error("execution '{0}' is not running")]
    NotRunning(String),

    /// The execution was aborted (e.g. by shutdown) before completing.
    #[error("execution '{0}' was aborted before completing")]
    Aborted(String),

    /// The persisted history is unusable.
    #[error("corrupt history for '{execution}': {reason}")]
    CorruptHistory {
        /// The execution id.
        execution: String,
        /// What was wrong with the history.
        reason: String,
    },
}
