//! The coordinator: registration, start/resume, signals, queries.
//!
//! Executions run as spawned tasks driving registered workflow
//! implementations. All durable state lives in the [`HistoryStore`];
//! handing the same store to a fresh coordinator and calling `start`
//! with a known execution id resumes it by replay.

pub mod context;
pub mod execution;
pub mod store;

pub use context::WorkflowContext;
pub use execution::{DescribeResponse, ExecutionState, QuerySlot, Signal, WorkflowHandle};
pub use store::{HistoryStore, InMemoryHistoryStore};

use crate::activity::TaskQueue;
use crate::core::{CompletionOutcome, ExecutionStatus, HistoryEvent};
use crate::errors::{CoordinatorError, ErrorKind, WorkflowError};
use crate::events::{EventSink, NoOpEventSink};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A workflow implementation registered under a type name.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Runs the workflow to a terminal outcome.
    ///
    /// Must be deterministic given the input and the context: all side
    /// effects, clocks and external data go through `ctx`.
    async fn run(&self, ctx: &WorkflowContext, input: Value) -> Result<Value, WorkflowError>;
}

struct Registration {
    workflow: Arc<dyn Workflow>,
    task_queue: String,
}

struct CoordinatorInner {
    store: Arc<dyn HistoryStore>,
    sink: Arc<dyn EventSink>,
    workflows: parking_lot::RwLock<HashMap<String, Registration>>,
    queues: DashMap<String, Arc<TaskQueue>>,
    executions: DashMap<String, Arc<ExecutionState>>,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl CoordinatorInner {
    fn execution(&self, id: &str) -> Result<Arc<ExecutionState>, CoordinatorError> {
        self.executions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoordinatorError::NotFound(format!("execution '{id}'")))
    }

    fn query(&self, execution: &str, name: &str) -> Result<Value, CoordinatorError> {
        let state = self.execution(execution)?;
        // Audit only: replay ignores query events.
        self.store.append(execution, HistoryEvent::QueryReceived { name: name.to_string() });
        state.query(name)
    }
}

/// Orchestrates workflow executions over a durable history store.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Creates a coordinator over the given store, with no event sink.
    #[must_use]
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self::with_sink(store, Arc::new(NoOpEventSink))
    }

    /// Creates a coordinator with an event sink.
    #[must_use]
    pub fn with_sink(store: Arc<dyn HistoryStore>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                sink,
                workflows: parking_lot::RwLock::new(HashMap::new()),
                queues: DashMap::new(),
                executions: DashMap::new(),
                tasks: DashMap::new(),
            }),
        }
    }

    /// Registers a workflow type on a task queue.
    pub fn register_workflow(
        &self,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        workflow: Arc<dyn Workflow>,
    ) {
        self.inner.workflows.write().insert(
            workflow_type.into(),
            Registration {
                workflow,
                task_queue: task_queue.into(),
            },
        );
    }

    /// Returns the named task queue, creating it if needed.
    ///
    /// Activities are registered here; workers are started with
    /// [`TaskQueue::start_workers`].
    #[must_use]
    pub fn task_queue(&self, name: &str) -> Arc<TaskQueue> {
        self.inner
            .queues
            .entry(name.to_string())
            .or_insert_with(|| TaskQueue::new(name))
            .clone()
    }

    /// A read-only handle for serving queries across executions.
    #[must_use]
    pub fn query_bridge(&self) -> QueryBridge {
        QueryBridge {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Starts an execution, or resumes it by replay if history exists.
    ///
    /// On resume the recorded input is authoritative and the `input`
    /// argument is ignored; the recorded workflow type must match.
    pub fn start(
        &self,
        workflow_type: &str,
        execution_id: &str,
        input: Value,
    ) -> Result<WorkflowHandle, CoordinatorError> {
        let (workflow, task_queue) = {
            let workflows = self.inner.workflows.read();
            let registration = workflows
                .get(workflow_type)
                .ok_or_else(|| CoordinatorError::UnknownWorkflowType(workflow_type.to_string()))?;
            (Arc::clone(&registration.workflow), registration.task_queue.clone())
        };

        // The check and the insert must be one atomic claim: the entry
        // guard is held until the new state is registered, so a second
        // concurrent start for the same id waits here and then observes
        // the live execution.
        let slot = match self.inner.executions.entry(execution_id.to_string()) {
            Entry::Occupied(existing) if existing.get().status() == ExecutionStatus::Running => {
                return Err(CoordinatorError::AlreadyRunning(execution_id.to_string()));
            }
            slot => slot,
        };

        let history = self.inner.store.load(execution_id);
        let input = if history.is_empty() {
            self.inner.store.append(
                execution_id,
                HistoryEvent::Started {
                    workflow_type: workflow_type.to_string(),
                    input: input.clone(),
                },
            );
            input
        } else {
            let recorded = history
                .iter()
                .find_map(|r| match &r.event {
                    HistoryEvent::Started { workflow_type, input } => {
                        Some((workflow_type.clone(), input.clone()))
                    }
                    _ => None,
                })
                .ok_or_else(|| CoordinatorError::CorruptHistory {
                    execution: execution_id.to_string(),
                    reason: "no start event".to_string(),
                })?;
            if recorded.0 != workflow_type {
                return Err(CoordinatorError::TypeMismatch {
                    execution: execution_id.to_string(),
                    recorded: recorded.0,
                    requested: workflow_type.to_string(),
                });
            }
            recorded.1
        };

        let state = ExecutionState::new(execution_id, workflow_type, task_queue.clone());
        for recorded in &history {
            if let HistoryEvent::SignalReceived { name, payload } = &recorded.event {
                state.push_signal(Signal {
                    name: name.clone(),
                    payload: payload.clone(),
                });
            }
        }

        // A terminated (cancelled) execution is restored as-is: its
        // cancellation point is not part of the deterministic history,
        // so re-running it could execute effects it never reached.
        // Completed and failed executions instead replay normally,
        // rebuilding their query state from memoized outcomes.
        let finished = history.iter().rev().find_map(|r| match &r.event {
            HistoryEvent::Completed { outcome } => Some(outcome.clone()),
            _ => None,
        });
        if let Some(outcome) = finished {
            if let CompletionOutcome::Failure { summary } = &outcome {
                if summary.kind == ErrorKind::Cancelled {
                    state.set_error(summary.clone());
                    state.set_stage(summary.state.clone());
                    state.finish(ExecutionStatus::Terminated, outcome);
                    let handle = WorkflowHandle::new(Arc::clone(&state));
                    slot.insert(state);
                    return Ok(handle);
                }
            }
        }

        let resumed = !history.is_empty();
        let ctx = WorkflowContext::new(
            Arc::clone(&state),
            Arc::clone(&self.inner.store),
            self.task_queue(&state.task_queue),
            Arc::clone(&self.inner.sink),
            history,
        );
        let handle = WorkflowHandle::new(Arc::clone(&state));
        slot.insert(Arc::clone(&state));

        info!(
            execution = %execution_id,
            workflow_type = %state.workflow_type,
            resumed,
            "starting execution"
        );
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            drive(inner, state, workflow, ctx, input).await;
        });
        self.inner.tasks.insert(execution_id.to_string(), task);

        Ok(handle)
    }

    /// Delivers a signal to a running execution.
    ///
    /// The signal is recorded before it is made visible, so a restart
    /// between delivery and consumption cannot lose it.
    pub fn signal(
        &self,
        execution: &str,
        name: &str,
        payload: Value,
    ) -> Result<(), CoordinatorError> {
        let state = self.inner.execution(execution)?;
        if state.status().is_terminal() {
            return Err(CoordinatorError::NotRunning(execution.to_string()));
        }
        self.inner.store.append(
            execution,
            HistoryEvent::SignalReceived {
                name: name.to_string(),
                payload: payload.clone(),
            },
        );
        state.push_signal(Signal {
            name: name.to_string(),
            payload,
        });
        Ok(())
    }

    /// Serves a named query against an execution.
    pub fn query(&self, execution: &str, name: &str) -> Result<Value, CoordinatorError> {
        self.inner.query(execution, name)
    }

    /// Describes an execution.
    pub fn describe(&self, execution: &str) -> Result<DescribeResponse, CoordinatorError> {
        Ok(self.inner.execution(execution)?.describe())
    }

    /// Requests cancellation of a running execution.
    ///
    /// Observed at the next suspension point; in-flight activity
    /// attempts are not forcibly aborted.
    pub fn cancel(&self, execution: &str) -> Result<(), CoordinatorError> {
        let state = self.inner.execution(execution)?;
        if state.status().is_terminal() {
            return Err(CoordinatorError::NotRunning(execution.to_string()));
        }
        info!(execution = %execution, "cancellation requested");
        state.cancel.cancel();
        Ok(())
    }

    /// Aborts all execution tasks and queue workers.
    ///
    /// The history store is untouched; a new coordinator over the same
    /// store resumes any execution that had not completed.
    pub fn shutdown(&self) {
        for entry in self.inner.tasks.iter() {
            entry.value().abort();
        }
        self.inner.tasks.clear();
        for entry in self.inner.queues.iter() {
            entry.value().shutdown();
        }
        self.inner.executions.clear();
    }
}

async fn drive(
    inner: Arc<CoordinatorInner>,
    state: Arc<ExecutionState>,
    workflow: Arc<dyn Workflow>,
    ctx: WorkflowContext,
    input: Value,
) {
    inner
        .sink
        .emit(
            "execution.started",
            Some(serde_json::json!({
                "execution": state.id,
                "workflow_type": state.workflow_type,
            })),
        )
        .await;

    let (status, outcome) = match workflow.run(&ctx, input).await {
        Ok(result) => (
            ExecutionStatus::Completed,
            CompletionOutcome::Success { result },
        ),
        Err(WorkflowError::Cancelled) => {
            let summary = WorkflowError::Cancelled.summary();
            state.set_error(summary.clone());
            (ExecutionStatus::Terminated, CompletionOutcome::Failure { summary })
        }
        Err(err) => {
            let summary = err.summary();
            error!(execution = %state.id, error = %summary, "execution failed");
            state.set_error(summary.clone());
            (ExecutionStatus::Failed, CompletionOutcome::Failure { summary })
        }
    };

    // A replayed execution that was already finished reaches the same
    // outcome again; the terminal event is recorded only once.
    let already_recorded = inner
        .store
        .load(&state.id)
        .iter()
        .any(|r| matches!(r.event, HistoryEvent::Completed { .. }));
    if !already_recorded {
        inner
            .store
            .append(&state.id, HistoryEvent::Completed { outcome: outcome.clone() });
    }
    inner
        .sink
        .emit(
            "execution.finished",
            Some(serde_json::json!({
                "execution": state.id,
                "status": status.to_string(),
            })),
        )
        .await;
    state.finish(status, outcome);
    inner.tasks.remove(&state.id);
}

/// Read-only handle for querying executions from outside workflow code,
/// typically wired into activities that look up another execution.
#[derive(Clone)]
pub struct QueryBridge {
    inner: Arc<CoordinatorInner>,
}

impl QueryBridge {
    /// Serves a named query against an execution.
    pub fn query(&self, execution: &str, name: &str) -> Result<Value, CoordinatorError> {
        self.inner.query(execution, name)
    }
}
