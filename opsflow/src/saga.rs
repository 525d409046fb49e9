//! Saga-style compensation.
//!
//! As a workflow makes forward progress past side effects that must be
//! undone on failure, it pushes a compensation for each one. On a
//! compensable failure the stack unwinds in reverse order. Compensation
//! activities run through the same durable machinery as forward
//! activities, so a crash mid-unwind resumes where it stopped.

use crate::activity::ActivityOptions;
use crate::coordinator::context::WorkflowContext;
use crate::errors::ActivityError;
use serde_json::Value;
use tracing::info;

/// A single undo step.
#[derive(Debug, Clone)]
pub struct Compensation {
    /// The registered activity to invoke.
    pub activity: String,
    /// The payload the undo activity receives.
    pub input: Value,
    /// Timeout and retry policy for the undo.
    pub options: ActivityOptions,
}

impl Compensation {
    /// Creates a compensation step.
    #[must_use]
    pub fn new(activity: impl Into<String>, input: Value, options: ActivityOptions) -> Self {
        Self {
            activity: activity.into(),
            input,
            options,
        }
    }
}

/// A stack of undo steps, unwound in reverse push order.
#[derive(Debug, Default)]
pub struct CompensationStack {
    steps: Vec<Compensation>,
}

impl CompensationStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an undo step. Later pushes unwind first.
    pub fn push(&mut self, compensation: Compensation) {
        self.steps.push(compensation);
    }

    /// Number of pending undo steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true when no undo steps are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs all undo steps in reverse order.
    ///
    /// Each step retries per its own policy. The first step that
    /// exhausts its retries (or fails terminally) aborts the unwind and
    /// returns that failure; remaining steps are not attempted, since
    /// later resources may depend on earlier ones still being undone.
    pub async fn unwind(&mut self, ctx: &WorkflowContext) -> Result<(), ActivityError> {
        while let Some(step) = self.steps.pop() {
            info!(activity = %step.activity, "compensating");
            ctx.execute_activity(&step.activity, step.input.clone(), &step.options)
                .await?;
        }
        Ok(())
    }
}
