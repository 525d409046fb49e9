//! Scriptable tool implementations for tests.
//!
//! Each operation pops the next scripted call from its queue; an empty
//! queue means success with the simulated defaults. Call counters make
//! memoization observable: a replayed execution must not re-invoke a
//! completed operation.

use crate::errors::{ActivityError, ErrorKind};
use crate::tools::{BuildTool, InfraTool, SimulatedBuildTool, SimulatedInfraTool};
use crate::workflows::cicd::{BuildArtifact, CloneResult, TestReport};
use crate::workflows::infra::{InfraInput, InfraOutput, PlanSummary};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One scripted response for an operation.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// Succeed with the simulated default result.
    Succeed,
    /// Fail with the given classification.
    Fail {
        /// Failure classification.
        kind: ErrorKind,
        /// Failure message.
        message: String,
        /// Structured detail attached to the error.
        details: Option<Value>,
    },
    /// Block until the operation's gate is opened, then succeed.
    WaitForGate,
}

impl ScriptedCall {
    /// A failure with no structured detail.
    #[must_use]
    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Fail {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// A failure carrying structured detail.
    #[must_use]
    pub fn fail_with_details(kind: ErrorKind, message: impl Into<String>, details: Value) -> Self {
        Self::Fail {
            kind,
            message: message.into(),
            details: Some(details),
        }
    }
}

/// A gate a scripted call can block on until the test opens it.
#[derive(Debug, Default)]
pub struct Gate {
    open: AtomicBool,
    notify: Notify,
}

impl Gate {
    /// Opens the gate, releasing all waiters.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        loop {
            if self.open.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.notify.notified();
            if self.open.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    queues: parking_lot::Mutex<HashMap<String, VecDeque<ScriptedCall>>>,
    gates: parking_lot::Mutex<HashMap<String, Arc<Gate>>>,
    counts: parking_lot::Mutex<HashMap<String, usize>>,
}

impl Script {
    fn script(&self, op: &str, calls: Vec<ScriptedCall>) {
        self.queues
            .lock()
            .entry(op.to_string())
            .or_default()
            .extend(calls);
    }

    fn gate(&self, op: &str) -> Arc<Gate> {
        Arc::clone(
            self.gates
                .lock()
                .entry(op.to_string())
                .or_insert_with(|| Arc::new(Gate::default())),
        )
    }

    fn count(&self, op: &str) -> usize {
        self.counts.lock().get(op).copied().unwrap_or(0)
    }

    async fn next(&self, op: &str) -> Result<(), ActivityError> {
        *self.counts.lock().entry(op.to_string()).or_insert(0) += 1;
        let call = self
            .queues
            .lock()
            .get_mut(op)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedCall::Succeed);
        match call {
            ScriptedCall::Succeed => Ok(()),
            ScriptedCall::Fail { kind, message, details } => {
                let mut err = ActivityError::new(op, kind, message);
                if let Some(details) = details {
                    err = err.with_details(details);
                }
                Err(err)
            }
            ScriptedCall::WaitForGate => {
                let gate = self.gate(op);
                gate.wait().await;
                Ok(())
            }
        }
    }
}

/// Scriptable provisioner.
#[derive(Debug)]
pub struct ScriptedInfraTool {
    script: Script,
    defaults: SimulatedInfraTool,
    healthy: AtomicBool,
}

impl Default for ScriptedInfraTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInfraTool {
    /// Creates a tool that succeeds with simulated defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Script::default(),
            defaults: SimulatedInfraTool::new(),
            healthy: AtomicBool::new(true),
        }
    }

    /// Queues scripted calls for an operation.
    pub fn script(&self, op: &str, calls: Vec<ScriptedCall>) {
        self.script.script(op, calls);
    }

    /// The gate for an operation's `WaitForGate` calls.
    #[must_use]
    pub fn gate(&self, op: &str) -> Arc<Gate> {
        self.script.gate(op)
    }

    /// Number of times an operation was invoked.
    #[must_use]
    pub fn calls(&self, op: &str) -> usize {
        self.script.count(op)
    }

    /// Makes validate report an unhealthy deployment.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl InfraTool for ScriptedInfraTool {
    async fn init(&self, workspace: &str) -> Result<(), ActivityError> {
        self.script.next(crate::workflows::infra::ACT_INIT).await?;
        self.defaults.init(workspace).await
    }

    async fn plan(&self, input: &InfraInput) -> Result<PlanSummary, ActivityError> {
        self.script.next(crate::workflows::infra::ACT_PLAN).await?;
        self.defaults.plan(input).await
    }

    async fn apply(&self, input: &InfraInput, plan_id: &str) -> Result<InfraOutput, ActivityError> {
        self.script.next(crate::workflows::infra::ACT_APPLY).await?;
        self.defaults.apply(input, plan_id).await
    }

    async fn destroy(&self, workspace: &str) -> Result<(), ActivityError> {
        self.script.next(crate::workflows::infra::ACT_DESTROY).await?;
        self.defaults.destroy(workspace).await
    }

    async fn validate(&self, output: &InfraOutput) -> Result<bool, ActivityError> {
        self.script.next(crate::workflows::infra::ACT_VALIDATE).await?;
        if !self.healthy.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.defaults.validate(output).await
    }
}

/// Scriptable build toolchain.
#[derive(Debug, Default)]
pub struct ScriptedBuildTool {
    script: Script,
    defaults: SimulatedBuildTool,
    test_report: parking_lot::Mutex<Option<TestReport>>,
}

impl ScriptedBuildTool {
    /// Creates a tool that succeeds with simulated defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues scripted calls for an operation.
    pub fn script(&self, op: &str, calls: Vec<ScriptedCall>) {
        self.script.script(op, calls);
    }

    /// The gate for an operation's `WaitForGate` calls.
    #[must_use]
    pub fn gate(&self, op: &str) -> Arc<Gate> {
        self.script.gate(op)
    }

    /// Number of times an operation was invoked.
    #[must_use]
    pub fn calls(&self, op: &str) -> usize {
        self.script.count(op)
    }

    /// Overrides the report returned by the next and subsequent test
    /// runs.
    pub fn set_test_report(&self, report: TestReport) {
        *self.test_report.lock() = Some(report);
    }

    /// Clears any test report override.
    pub fn clear_test_report(&self) {
        *self.test_report.lock() = None;
    }
}

#[async_trait]
impl BuildTool for ScriptedBuildTool {
    async fn clone_repo(
        &self,
        repo_url: &str,
        reference: &str,
        commit: Option<&str>,
    ) -> Result<CloneResult, ActivityError> {
        self.script.next(crate::workflows::cicd::ACT_CLONE).await?;
        self.defaults.clone_repo(repo_url, reference, commit).await
    }

    async fn build(
        &self,
        workdir: &str,
        command: &str,
        commit: &str,
    ) -> Result<BuildArtifact, ActivityError> {
        self.script.next(crate::workflows::cicd::ACT_BUILD).await?;
        self.defaults.build(workdir, command, commit).await
    }

    async fn test(&self, workdir: &str, command: &str) -> Result<TestReport, ActivityError> {
        self.script.next(crate::workflows::cicd::ACT_TEST).await?;
        if let Some(report) = *self.test_report.lock() {
            return Ok(report);
        }
        self.defaults.test(workdir, command).await
    }

    async fn transfer(
        &self,
        artifact: &str,
        target: &str,
        username: &str,
    ) -> Result<(), ActivityError> {
        self.script.next(crate::workflows::cicd::ACT_TRANSFER).await?;
        self.defaults.transfer(artifact, target, username).await
    }

    async fn restart_service(&self, target: &str, username: &str) -> Result<(), ActivityError> {
        self.script.next(crate::workflows::cicd::ACT_RESTART).await?;
        self.defaults.restart_service(target, username).await
    }

    async fn notify(&self, message: &str) -> Result<(), ActivityError> {
        self.script.next(crate::workflows::cicd::ACT_NOTIFY).await?;
        self.defaults.notify(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_calls_pop_in_order() {
        let tool = ScriptedInfraTool::new();
        tool.script(
            crate::workflows::infra::ACT_PLAN,
            vec![
                ScriptedCall::fail(ErrorKind::Transient, "rate limited"),
                ScriptedCall::Succeed,
            ],
        );

        let input = InfraInput::default();
        let err = tool.plan(&input).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(tool.plan(&input).await.is_ok());
        assert!(tool.plan(&input).await.is_ok());
        assert_eq!(tool.calls(crate::workflows::infra::ACT_PLAN), 3);
    }

    #[tokio::test]
    async fn test_gate_blocks_until_opened() {
        let tool = Arc::new(ScriptedInfraTool::new());
        tool.script(
            crate::workflows::infra::ACT_APPLY,
            vec![ScriptedCall::WaitForGate],
        );
        let gate = tool.gate(crate::workflows::infra::ACT_APPLY);

        let worker = Arc::clone(&tool);
        let task = tokio::spawn(async move {
            worker
                .apply(&InfraInput::default(), "tfplan")
                .await
                .unwrap()
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        gate.open();
        let output = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.vm_name, "vm-demo-dev");
    }
}
