//! Durable history events.
//!
//! Every execution owns an append-only log of these events. An
//! execution's in-memory state is a pure deterministic function of
//! (initial input, ordered history); replay walks the log and returns
//! recorded outcomes instead of re-executing side effects.

use crate::errors::{ActivityError, ErrorSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single entry in an execution's event history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// The execution was started. The recorded input is authoritative
    /// on resume.
    Started {
        /// Registered workflow type.
        workflow_type: String,
        /// Initial input payload.
        input: Value,
    },

    /// An activity attempt was handed to a task queue.
    ActivityScheduled {
        /// Correlation id, assigned in deterministic call order.
        id: u64,
        /// Activity name.
        name: String,
        /// 0-indexed attempt number.
        attempt: u32,
        /// Digest of (name, input) identifying the invocation.
        invocation_key: String,
    },

    /// An activity attempt succeeded. The result is memoized against
    /// `id`; replay never re-invokes a completed attempt.
    ActivityCompleted {
        /// Correlation id.
        id: u64,
        /// Activity result payload.
        result: Value,
    },

    /// An activity attempt failed. Non-terminal failures carry the
    /// attempt counter forward so replay does not reset backoff.
    ActivityFailed {
        /// Correlation id.
        id: u64,
        /// 0-indexed attempt number that failed.
        attempt: u32,
        /// The failure.
        error: ActivityError,
        /// True when retries were exhausted or the kind is not
        /// retriable; the invocation is settled.
        terminal: bool,
    },

    /// A durable timer was created with an absolute deadline.
    TimerCreated {
        /// Correlation id.
        id: u64,
        /// Absolute deadline; after a restart the timer still fires at
        /// this instant, not `duration` from the restart.
        fire_at: DateTime<Utc>,
    },

    /// A durable timer fired.
    TimerFired {
        /// Correlation id.
        id: u64,
    },

    /// A signal was delivered into the execution's inbox.
    SignalReceived {
        /// Signal name.
        name: String,
        /// Signal payload.
        payload: Value,
    },

    /// A query was served. Audit only: replay ignores these, keeping
    /// reads free of any effect on reconstructed state.
    QueryReceived {
        /// Query name.
        name: String,
    },

    /// The execution reached a terminal status.
    Completed {
        /// How it ended.
        outcome: CompletionOutcome,
    },
}

impl HistoryEvent {
    /// Correlation id for id-bearing events.
    #[must_use]
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Self::ActivityScheduled { id, .. }
            | Self::ActivityCompleted { id, .. }
            | Self::ActivityFailed { id, .. }
            | Self::TimerCreated { id, .. }
            | Self::TimerFired { id } => Some(*id),
            _ => None,
        }
    }
}

/// Terminal outcome recorded with the `Completed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// The workflow returned a value.
    Success {
        /// The returned value.
        result: Value,
    },
    /// The workflow ended in a terminal failure or was terminated.
    Failure {
        /// Structured report of the failure.
        summary: ErrorSummary,
    },
}

impl CompletionOutcome {
    /// Returns true for a successful completion.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A history event with its position and wall-clock metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Position in the execution's history, starting at 0.
    pub seq: u64,
    /// Wall-clock time of the append (ISO 8601). Not read by replay.
    pub recorded_at: String,
    /// The event itself.
    pub event: HistoryEvent,
}
