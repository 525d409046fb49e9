//! Durable event history storage.

use crate::core::{HistoryEvent, RecordedEvent};
use crate::utils::iso_timestamp;
use std::collections::HashMap;
use std::sync::Arc;

/// Append-only storage for per-execution event histories.
///
/// A store shared across coordinator restarts is the durability
/// boundary: everything an execution needs to resume lives in its
/// history.
pub trait HistoryStore: Send + Sync {
    /// Appends an event to the execution's history and returns its
    /// sequence number.
    fn append(&self, execution: &str, event: HistoryEvent) -> u64;

    /// Loads the full recorded history for an execution, in order.
    /// Unknown executions load as empty.
    fn load(&self, execution: &str) -> Vec<RecordedEvent>;
}

/// In-memory history store.
///
/// Clones share the same underlying map, so a "restarted" coordinator
/// handed a clone sees the histories the previous one wrote.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistoryStore {
    histories: Arc<parking_lot::RwLock<HashMap<String, Vec<RecordedEvent>>>>,
}

impl InMemoryHistoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions with recorded history.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.histories.read().len()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, execution: &str, event: HistoryEvent) -> u64 {
        let mut histories = self.histories.write();
        let history = histories.entry(execution.to_string()).or_default();
        let seq = history.len() as u64;
        history.push(RecordedEvent {
            seq,
            recorded_at: iso_timestamp(),
            event,
        });
        seq
    }

    fn load(&self, execution: &str) -> Vec<RecordedEvent> {
        self.histories.read().get(execution).cloned().unwrap_or_default()
    }
}
