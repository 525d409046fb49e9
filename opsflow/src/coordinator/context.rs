//! Workflow execution context.
//!
//! The context is the only door between deterministic workflow code and
//! the outside world. Every effect (activity, timer, signal wait) is
//! assigned a correlation id in call order and checked against the
//! recorded history first; on resume the workflow function is re-run
//! from the top and recorded outcomes are returned without re-executing
//! the effect.

use crate::activity::{ActivityOptions, TaskQueue};
use crate::coordinator::execution::ExecutionState;
use crate::coordinator::store::HistoryStore;
use crate::core::{HistoryEvent, RecordedEvent};
use crate::errors::{ActivityError, ErrorKind};
use crate::events::EventSink;
use crate::retry::RetryDecision;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Digest identifying an invocation by activity name and input.
#[must_use]
pub fn invocation_key(name: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(input.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
struct ReplayCursor {
    history: Vec<RecordedEvent>,
    next_correlation: u64,
}

enum RecordedOutcome {
    /// A completed result is memoized; return it without re-executing.
    Completed(Value),
    /// A terminal failure is settled; surface it again.
    TerminalFailure(ActivityError),
    /// Not settled; resume at the attempt after the recorded failures.
    Fresh { failed_attempts: u32 },
}

/// Handle given to workflow code for all interaction with the runtime.
pub struct WorkflowContext {
    execution: Arc<ExecutionState>,
    store: Arc<dyn HistoryStore>,
    queue: Arc<TaskQueue>,
    sink: Arc<dyn EventSink>,
    replay: parking_lot::Mutex<ReplayCursor>,
}

impl WorkflowContext {
    pub(crate) fn new(
        execution: Arc<ExecutionState>,
        store: Arc<dyn HistoryStore>,
        queue: Arc<TaskQueue>,
        sink: Arc<dyn EventSink>,
        history: Vec<RecordedEvent>,
    ) -> Self {
        Self {
            execution,
            store,
            queue,
            sink,
            replay: parking_lot::Mutex::new(ReplayCursor {
                history,
                next_correlation: 0,
            }),
        }
    }

    /// The id of the owning execution.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution.id
    }

    /// Updates the stage label visible through `describe()`.
    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        info!(execution = %self.execution.id, stage = %stage, "stage transition");
        self.sink.try_emit(
            "execution.stage",
            Some(serde_json::json!({
                "execution": self.execution.id,
                "stage": stage,
            })),
        );
        self.execution.set_stage(stage);
    }

    /// Declares a query name for this execution, initially pending.
    pub fn declare_query(&self, name: impl Into<String>) {
        self.execution.declare_query(name);
    }

    /// Publishes data for a declared query.
    pub fn expose(&self, name: impl Into<String>, value: Value) {
        self.execution.expose(name, value);
    }

    /// Fails with a cancellation error if cancellation was requested.
    pub fn check_cancelled(&self, at: &str) -> Result<(), ActivityError> {
        if self.execution.cancel.is_cancelled() {
            return Err(ActivityError::cancelled(at));
        }
        Ok(())
    }

    fn next_correlation(&self) -> u64 {
        let mut cursor = self.replay.lock();
        let id = cursor.next_correlation;
        cursor.next_correlation += 1;
        id
    }

    fn append(&self, event: HistoryEvent) {
        self.store.append(&self.execution.id, event);
    }

    fn recorded_activity(&self, id: u64) -> RecordedOutcome {
        let cursor = self.replay.lock();
        let mut failed_attempts = 0;
        for recorded in &cursor.history {
            match &recorded.event {
                HistoryEvent::ActivityCompleted { id: eid, result } if *eid == id => {
                    return RecordedOutcome::Completed(result.clone());
                }
                HistoryEvent::ActivityFailed { id: eid, error, terminal, .. } if *eid == id => {
                    if *terminal {
                        return RecordedOutcome::TerminalFailure(error.clone());
                    }
                    failed_attempts += 1;
                }
                _ => {}
            }
        }
        RecordedOutcome::Fresh { failed_attempts }
    }

    fn recorded_timer(&self, id: u64) -> (Option<DateTime<Utc>>, bool) {
        let cursor = self.replay.lock();
        let mut fire_at = None;
        let mut fired = false;
        for recorded in &cursor.history {
            match recorded.event {
                HistoryEvent::TimerCreated { id: eid, fire_at: at } if eid == id => {
                    fire_at = Some(at);
                }
                HistoryEvent::TimerFired { id: eid } if eid == id => {
                    fired = true;
                }
                _ => {}
            }
        }
        (fire_at, fired)
    }

    /// Executes an activity with retries, memoized against history.
    ///
    /// A completed invocation returns its recorded result without
    /// touching the task queue. A settled terminal failure is returned
    /// again. An invocation with recorded non-terminal failures resumes
    /// at the next attempt, honoring the remaining backoff first.
    pub async fn execute_activity(
        &self,
        name: &str,
        input: Value,
        options: &ActivityOptions,
    ) -> Result<Value, ActivityError> {
        let id = self.next_correlation();
        let mut attempt = match self.recorded_activity(id) {
            RecordedOutcome::Completed(result) => return Ok(result),
            RecordedOutcome::TerminalFailure(error) => return Err(error),
            RecordedOutcome::Fresh { failed_attempts } => failed_attempts,
        };
        if attempt > 0 {
            // Resuming mid-backoff; the delay after the last recorded
            // failure is re-waited in full.
            self.backoff(name, options.retry.delay_for(attempt - 1)).await?;
        }

        let key = invocation_key(name, &input);
        loop {
            self.check_cancelled(name)?;
            self.append(HistoryEvent::ActivityScheduled {
                id,
                name: name.to_string(),
                attempt,
                invocation_key: key.clone(),
            });

            let reply = self.queue.dispatch(name, input.clone());
            let result = match tokio::time::timeout(options.timeout, reply).await {
                Err(_) => Err(ActivityError::new(
                    name,
                    ErrorKind::Timeout,
                    format!("attempt timed out after {:?}", options.timeout),
                )),
                Ok(Err(_)) => Err(ActivityError::transient(name, "worker dropped the attempt")),
                Ok(Ok(result)) => result,
            };

            match result {
                Ok(value) => {
                    self.append(HistoryEvent::ActivityCompleted {
                        id,
                        result: value.clone(),
                    });
                    return Ok(value);
                }
                Err(error) => match options.retry.decide(error.kind, attempt) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            execution = %self.execution.id,
                            activity = %name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "activity attempt failed, retrying"
                        );
                        self.append(HistoryEvent::ActivityFailed {
                            id,
                            attempt,
                            error,
                            terminal: false,
                        });
                        self.backoff(name, delay).await?;
                        attempt += 1;
                    }
                    RetryDecision::GiveUp | RetryDecision::NotRetriable => {
                        warn!(
                            execution = %self.execution.id,
                            activity = %name,
                            attempt,
                            error = %error,
                            "activity failed terminally"
                        );
                        self.append(HistoryEvent::ActivityFailed {
                            id,
                            attempt,
                            error: error.clone(),
                            terminal: true,
                        });
                        return Err(error);
                    }
                },
            }
        }
    }

    /// Durable timer.
    ///
    /// The absolute deadline is recorded on first execution; on resume
    /// the timer either fires at the original instant or, if it already
    /// fired, is skipped.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ActivityError> {
        let id = self.next_correlation();
        let (recorded_fire_at, fired) = self.recorded_timer(id);
        if fired {
            return Ok(());
        }

        let fire_at = match recorded_fire_at {
            Some(at) => at,
            None => {
                let at = Utc::now() + duration;
                self.append(HistoryEvent::TimerCreated { id, fire_at: at });
                at
            }
        };

        let remaining = (fire_at - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            () = tokio::time::sleep(remaining) => {
                self.append(HistoryEvent::TimerFired { id });
                Ok(())
            }
            () = self.execution.cancel.cancelled() => {
                Err(ActivityError::cancelled("timer"))
            }
        }
    }

    /// Waits for the next signal with the given name.
    ///
    /// Signals are consumed from the inbox in arrival order, so a
    /// resumed execution consumes exactly the signals it had not yet
    /// consumed before the restart.
    pub async fn wait_signal(&self, name: &str) -> Result<Value, ActivityError> {
        loop {
            if let Some(signal) = self.execution.take_signal(name) {
                return Ok(signal.payload);
            }
            tokio::select! {
                () = self.execution.signal_arrived() => {}
                () = self.execution.cancel.cancelled() => {
                    return Err(ActivityError::cancelled(format!("signal:{name}")));
                }
            }
        }
    }

    async fn backoff(&self, at: &str, delay: Duration) -> Result<(), ActivityError> {
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = self.execution.cancel.cancelled() => Err(ActivityError::cancelled(at)),
        }
    }
}
