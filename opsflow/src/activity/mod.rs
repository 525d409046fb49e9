//! Activities and their execution options.
//!
//! An activity is a single side-effecting operation (run a command,
//! transfer a file, call an API). Activities receive and return JSON
//! payloads so their results can be persisted in history and replayed.

pub mod queue;

pub use queue::TaskQueue;

use crate::errors::ActivityError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// A side-effecting operation invoked by a workflow.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Executes the activity with the given input payload.
    async fn execute(&self, input: Value) -> Result<Value, ActivityError>;
}

/// Adapter turning an async closure into an [`Activity`].
pub struct FnActivity<F> {
    func: F,
}

impl<F, Fut> FnActivity<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
{
    /// Wraps an async closure.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
{
    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        (self.func)(input).await
    }
}

/// Per-invocation execution options.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    /// Wall-clock budget for a single attempt.
    pub timeout: Duration,
    /// Retry policy applied across attempts.
    pub retry: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl ActivityOptions {
    /// Creates options with the given per-attempt timeout and the
    /// default retry policy.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
