//! Live per-execution state.
//!
//! Everything here is reconstructible from the event history plus the
//! workflow code; it exists so signal delivery, queries and describe
//! calls can be served without replaying.

use crate::cancellation::CancelToken;
use crate::core::{CompletionOutcome, ExecutionStatus};
use crate::errors::{CoordinatorError, ErrorSummary};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// A signal waiting in an execution's inbox.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Signal name.
    pub name: String,
    /// Signal payload.
    pub payload: Value,
}

/// State of a declared query.
#[derive(Debug, Clone)]
pub enum QuerySlot {
    /// Declared but the data is not available yet.
    Pending,
    /// Data is available.
    Ready(Value),
}

/// Snapshot returned by `Coordinator::describe`.
#[derive(Debug, Clone, Serialize)]
pub struct DescribeResponse {
    /// The execution id.
    pub id: String,
    /// Registered workflow type.
    pub workflow_type: String,
    /// Lifecycle status.
    pub status: ExecutionStatus,
    /// Current stage label set by the workflow.
    pub stage: String,
    /// Failure report, present once the execution has failed.
    pub error: Option<ErrorSummary>,
}

/// Shared mutable state of one live execution.
#[derive(Debug)]
pub struct ExecutionState {
    /// The execution id.
    pub id: String,
    /// Registered workflow type.
    pub workflow_type: String,
    /// The task queue this execution's activities run on.
    pub task_queue: String,
    status: parking_lot::RwLock<ExecutionStatus>,
    stage: parking_lot::RwLock<String>,
    error: parking_lot::RwLock<Option<ErrorSummary>>,
    queries: parking_lot::RwLock<HashMap<String, QuerySlot>>,
    inbox: parking_lot::Mutex<VecDeque<Signal>>,
    signal_notify: Notify,
    /// Cancellation token observed by the execution at suspension
    /// points.
    pub cancel: CancelToken,
    outcome_tx: watch::Sender<Option<CompletionOutcome>>,
}

impl ExecutionState {
    /// Creates a fresh running execution.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
    ) -> Arc<Self> {
        let (outcome_tx, _) = watch::channel(None);
        Arc::new(Self {
            id: id.into(),
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            status: parking_lot::RwLock::new(ExecutionStatus::Running),
            stage: parking_lot::RwLock::new(String::from("pending")),
            error: parking_lot::RwLock::new(None),
            queries: parking_lot::RwLock::new(HashMap::new()),
            inbox: parking_lot::Mutex::new(VecDeque::new()),
            signal_notify: Notify::new(),
            cancel: CancelToken::new(),
            outcome_tx,
        })
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        *self.status.read()
    }

    /// Current stage label.
    #[must_use]
    pub fn stage(&self) -> String {
        self.stage.read().clone()
    }

    /// Updates the stage label.
    pub fn set_stage(&self, stage: impl Into<String>) {
        *self.stage.write() = stage.into();
    }

    /// Records a failure report.
    pub fn set_error(&self, summary: ErrorSummary) {
        *self.error.write() = Some(summary);
    }

    /// Builds a describe snapshot.
    #[must_use]
    pub fn describe(&self) -> DescribeResponse {
        DescribeResponse {
            id: self.id.clone(),
            workflow_type: self.workflow_type.clone(),
            status: self.status(),
            stage: self.stage(),
            error: self.error.read().clone(),
        }
    }

    /// Appends a signal to the inbox and wakes one waiter.
    pub fn push_signal(&self, signal: Signal) {
        self.inbox.lock().push_back(signal);
        // notify_one leaves a permit if nobody is waiting yet.
        self.signal_notify.notify_one();
    }

    /// Removes and returns the oldest signal with the given name.
    #[must_use]
    pub fn take_signal(&self, name: &str) -> Option<Signal> {
        let mut inbox = self.inbox.lock();
        let pos = inbox.iter().position(|s| s.name == name)?;
        inbox.remove(pos)
    }

    /// Resolves once a new signal may have arrived.
    pub async fn signal_arrived(&self) {
        self.signal_notify.notified().await;
    }

    /// Declares a query name, initially pending.
    pub fn declare_query(&self, name: impl Into<String>) {
        self.queries
            .write()
            .entry(name.into())
            .or_insert(QuerySlot::Pending);
    }

    /// Publishes data for a declared query.
    pub fn expose(&self, name: impl Into<String>, value: Value) {
        self.queries.write().insert(name.into(), QuerySlot::Ready(value));
    }

    /// Serves a query. Partial data is never returned: a declared but
    /// unpopulated query yields `NotReady`.
    pub fn query(&self, name: &str) -> Result<Value, CoordinatorError> {
        match self.queries.read().get(name) {
            Some(QuerySlot::Ready(value)) => Ok(value.clone()),
            Some(QuerySlot::Pending) => Err(CoordinatorError::NotReady {
                execution: self.id.clone(),
                name: name.to_string(),
            }),
            None => Err(CoordinatorError::NotFound(format!(
                "query '{name}' on execution '{}'",
                self.id
            ))),
        }
    }

    /// Marks the execution terminal and publishes its outcome.
    pub fn finish(&self, status: ExecutionStatus, outcome: CompletionOutcome) {
        *self.status.write() = status;
        let _ = self.outcome_tx.send(Some(outcome));
    }

    /// Subscribes to the terminal outcome.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<CompletionOutcome>> {
        self.outcome_tx.subscribe()
    }
}

/// Client handle to a started execution.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    state: Arc<ExecutionState>,
    outcome_rx: watch::Receiver<Option<CompletionOutcome>>,
}

impl WorkflowHandle {
    pub(crate) fn new(state: Arc<ExecutionState>) -> Self {
        let outcome_rx = state.subscribe();
        Self { state, outcome_rx }
    }

    /// The execution id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// Waits for the execution to reach a terminal outcome.
    ///
    /// Returns `Aborted` if the coordinator shut down before the
    /// execution completed.
    pub async fn outcome(&self) -> Result<CompletionOutcome, CoordinatorError> {
        let mut rx = self.outcome_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return Ok(outcome);
            }
            if rx.changed().await.is_err() {
                return Err(CoordinatorError::Aborted(self.state.id.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_inbox_fifo_by_name() {
        let state = ExecutionState::new("wf-1", "cicd_pipeline", "app-deployments");
        state.push_signal(Signal { name: "redeploy".into(), payload: json!(1) });
        state.push_signal(Signal { name: "other".into(), payload: json!(2) });
        state.push_signal(Signal { name: "redeploy".into(), payload: json!(3) });

        assert_eq!(state.take_signal("redeploy").unwrap().payload, json!(1));
        assert_eq!(state.take_signal("redeploy").unwrap().payload, json!(3));
        assert!(state.take_signal("redeploy").is_none());
        assert_eq!(state.take_signal("other").unwrap().payload, json!(2));
    }

    #[test]
    fn test_query_lifecycle() {
        let state = ExecutionState::new("wf-1", "infra_provisioning", "infra-platform");

        assert!(matches!(
            state.query("get_infra_output"),
            Err(CoordinatorError::NotFound(_))
        ));

        state.declare_query("get_infra_output");
        assert!(matches!(
            state.query("get_infra_output"),
            Err(CoordinatorError::NotReady { .. })
        ));

        state.expose("get_infra_output", json!({"vm_name": "vm-demo-dev"}));
        let value = state.query("get_infra_output").unwrap();
        assert_eq!(value["vm_name"], "vm-demo-dev");
    }

    #[tokio::test]
    async fn test_handle_resolves_on_finish() {
        let state = ExecutionState::new("wf-1", "infra_provisioning", "infra-platform");
        let handle = WorkflowHandle::new(Arc::clone(&state));

        state.finish(
            ExecutionStatus::Completed,
            CompletionOutcome::Success { result: json!({"ok": true}) },
        );
        let outcome = handle.outcome().await.unwrap();
        assert!(outcome.is_success());
        assert!(state.status().is_terminal());
    }
}
