#![allow(dead_code)]

use opsflow::prelude::*;
use opsflow::testing::{ScriptedBuildTool, ScriptedInfraTool};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const INFRA_ID: &str = "infra-1";
pub const CICD_ID: &str = "deploy-1";

/// Millisecond-scale retry policy so retry paths run fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_initial_interval(Duration::from_millis(5))
        .with_backoff_coefficient(2.0)
        .with_max_interval(Duration::from_millis(40))
        .with_max_attempts(max_attempts)
}

pub fn infra_input(retry: &RetryPolicy) -> Value {
    json!({ "retry": retry })
}

pub fn deploy_input(infra_execution_id: &str, retry: &RetryPolicy) -> Value {
    json!({
        "repo_url": "https://example.com/org/demo-app.git",
        "infra_execution_id": infra_execution_id,
        "retry": retry,
    })
}

pub struct Harness {
    pub store: Arc<InMemoryHistoryStore>,
    pub coordinator: Coordinator,
    pub infra_tool: Arc<ScriptedInfraTool>,
    pub build_tool: Arc<ScriptedBuildTool>,
}

impl Harness {
    pub fn new() -> Self {
        opsflow::utils::init_tracing();
        let store = Arc::new(InMemoryHistoryStore::new());
        let infra_tool = Arc::new(ScriptedInfraTool::new());
        let build_tool = Arc::new(ScriptedBuildTool::new());
        let coordinator = boot(&store, &infra_tool, &build_tool);
        Self {
            store,
            coordinator,
            infra_tool,
            build_tool,
        }
    }

    /// Simulates a crash and restart: the old coordinator's tasks and
    /// workers are aborted, then a fresh coordinator is built over the
    /// same store and tools.
    pub fn restart(&mut self) {
        self.coordinator.shutdown();
        self.coordinator = boot(&self.store, &self.infra_tool, &self.build_tool);
    }
}

fn boot(
    store: &Arc<InMemoryHistoryStore>,
    infra_tool: &Arc<ScriptedInfraTool>,
    build_tool: &Arc<ScriptedBuildTool>,
) -> Coordinator {
    let coordinator = Coordinator::new(Arc::clone(store) as Arc<dyn HistoryStore>);

    let infra_queue = coordinator.task_queue(INFRA_TASK_QUEUE);
    InfraProvisioningWorkflow::register_activities(
        &infra_queue,
        Arc::clone(infra_tool) as Arc<dyn InfraTool>,
    );
    infra_queue.start_workers(2);

    let cicd_queue = coordinator.task_queue(CICD_TASK_QUEUE);
    CicdPipelineWorkflow::register_activities(
        &cicd_queue,
        coordinator.query_bridge(),
        Arc::clone(build_tool) as Arc<dyn BuildTool>,
    );
    cicd_queue.start_workers(2);

    coordinator.register_workflow(
        INFRA_WORKFLOW_TYPE,
        INFRA_TASK_QUEUE,
        Arc::new(InfraProvisioningWorkflow::new()),
    );
    coordinator.register_workflow(
        CICD_WORKFLOW_TYPE,
        CICD_TASK_QUEUE,
        Arc::new(CicdPipelineWorkflow::new()),
    );
    coordinator
}

/// Waits until an execution reports the given stage.
pub async fn wait_for_stage(coordinator: &Coordinator, execution: &str, stage: &str) {
    wait_until(|| {
        coordinator
            .describe(execution)
            .map(|d| d.stage == stage)
            .unwrap_or(false)
    })
    .await;
}

/// Polls a condition every few milliseconds, panicking after 5s.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Awaits a handle's terminal outcome with a test timeout.
pub async fn outcome_of(handle: &WorkflowHandle) -> CompletionOutcome {
    tokio::time::timeout(Duration::from_secs(5), handle.outcome())
        .await
        .expect("execution did not finish within 5s")
        .expect("execution aborted")
}

pub fn success_value(outcome: CompletionOutcome) -> Value {
    match outcome {
        CompletionOutcome::Success { result } => result,
        CompletionOutcome::Failure { summary } => {
            panic!("expected success, got failure: {summary}")
        }
    }
}

pub fn failure_summary(outcome: CompletionOutcome) -> ErrorSummary {
    match outcome {
        CompletionOutcome::Failure { summary } => summary,
        CompletionOutcome::Success { result } => {
            panic!("expected failure, got success: {result}")
        }
    }
}
