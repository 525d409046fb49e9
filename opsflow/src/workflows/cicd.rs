//! Build/test/deploy state machine.
//!
//! `Cloning → Building → Testing → Transferring → Restarting → Idle`,
//! re-entered from `Idle` by a `redeploy` signal. The deployment target
//! is resolved through a read-only query against the provisioning
//! workflow before each run; that query is the only coupling between
//! the two pipelines.

use crate::activity::{ActivityOptions, FnActivity, TaskQueue};
use crate::coordinator::{QueryBridge, Workflow, WorkflowContext};
use crate::errors::{ActivityError, CoordinatorError, ErrorKind, WorkflowError};
use crate::retry::RetryPolicy;
use crate::tools::BuildTool;
use crate::workflows::infra::{InfraOutput, INFRA_OUTPUT_QUERY};
use crate::workflows::to_payload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Resolves the deployment target from the provisioning workflow.
pub const ACT_LOOKUP: &str = "infra.lookup";
/// Clones the application repository.
pub const ACT_CLONE: &str = "repo.clone";
/// Builds the artifact.
pub const ACT_BUILD: &str = "app.build";
/// Runs the test suite.
pub const ACT_TEST: &str = "app.test";
/// Copies the artifact to the target host.
pub const ACT_TRANSFER: &str = "app.transfer";
/// Restarts the application service.
pub const ACT_RESTART: &str = "service.restart";
/// Sends a human-facing notification.
pub const ACT_NOTIFY: &str = "notify";

/// Signal that re-enters the pipeline from `Idle`.
pub const REDEPLOY_SIGNAL: &str = "redeploy";
/// Query returning the outcome of the last completed run.
pub const DEPLOY_DETAILS_QUERY: &str = "get_deploy_details";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);
const CLONE_TIMEOUT: Duration = Duration::from_secs(120);
const BUILD_TIMEOUT: Duration = Duration::from_secs(300);
const TEST_TIMEOUT: Duration = Duration::from_secs(600);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
const RESTART_TIMEOUT: Duration = Duration::from_secs(120);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Port the deployed application listens on.
pub const APPLICATION_PORT: u16 = 8080;

fn default_branch() -> String {
    "main".to_string()
}
fn default_build_command() -> String {
    "make build".to_string()
}
fn default_test_command() -> String {
    "make test".to_string()
}

/// Input to the pipeline workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployInput {
    /// Application repository.
    pub repo_url: String,
    /// Branch to deploy.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Pinned commit; resolved from the branch head when absent.
    #[serde(default)]
    pub commit: Option<String>,
    /// Build command.
    #[serde(default = "default_build_command")]
    pub build_command: String,
    /// Test command.
    #[serde(default = "default_test_command")]
    pub test_command: String,
    /// Execution id of the provisioning workflow to deploy onto.
    pub infra_execution_id: String,
    /// Retry policy applied to every pipeline activity.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Result of cloning the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneResult {
    /// Checked-out working directory.
    pub workdir: String,
    /// Resolved commit hash.
    pub commit: String,
}

/// A built, deployable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    /// Artifact file name.
    pub name: String,
    /// Commit it was built from.
    pub commit: String,
}

/// Test suite results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    /// Tests that passed.
    pub passed: u32,
    /// Tests that failed.
    pub failed: u32,
    /// Tests that were skipped.
    pub skipped: u32,
}

/// Outcome of one pipeline run, served through
/// [`DEPLOY_DETAILS_QUERY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOutcome {
    /// Whether the run deployed successfully.
    pub succeeded: bool,
    /// The last stage the run reached.
    pub stage_reached: String,
    /// Artifact name, when a build completed.
    pub artifact: Option<String>,
    /// Where the application is serving, on success.
    pub application_url: Option<String>,
    /// Failure description, on failure.
    pub error: Option<String>,
    /// 1-indexed run counter for this execution.
    pub run: u32,
}

/// Overrides carried by a `redeploy` signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeployRequest {
    /// Branch to switch to; clears any pinned commit.
    #[serde(default)]
    pub branch: Option<String>,
    /// Commit to pin.
    #[serde(default)]
    pub commit: Option<String>,
}

/// Pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Resolving the deployment target.
    ResolvingTarget,
    /// Cloning the repository.
    Cloning,
    /// Building the artifact.
    Building,
    /// Running the test suite.
    Testing,
    /// Copying the artifact to the target.
    Transferring,
    /// Restarting the application service.
    Restarting,
    /// Waiting for a `redeploy` signal.
    Idle,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ResolvingTarget => "resolving_target",
            Self::Cloning => "cloning",
            Self::Building => "building",
            Self::Testing => "testing",
            Self::Transferring => "transferring",
            Self::Restarting => "restarting",
            Self::Idle => "idle",
        };
        f.write_str(label)
    }
}

/// The build/test/deploy workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct CicdPipelineWorkflow;

impl CicdPipelineWorkflow {
    /// Creates the workflow.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Registers the pipeline activities on a task queue.
    ///
    /// The target lookup runs through `bridge` as an ordinary activity,
    /// so its result is memoized in history like any other effect.
    pub fn register_activities(queue: &TaskQueue, bridge: QueryBridge, tool: Arc<dyn BuildTool>) {
        queue.register(
            ACT_LOOKUP,
            Arc::new(FnActivity::new(move |input: Value| {
                let bridge = bridge.clone();
                async move {
                    let execution = input
                        .get("execution")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    match bridge.query(&execution, INFRA_OUTPUT_QUERY) {
                        Ok(value) => Ok(value),
                        Err(err @ CoordinatorError::NotReady { .. }) => {
                            Err(ActivityError::transient(ACT_LOOKUP, err.to_string()))
                        }
                        Err(err) => Err(ActivityError::deterministic(ACT_LOOKUP, err.to_string())),
                    }
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_CLONE,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let repo_url = string_field(&input, "repo_url");
                    let reference = string_field(&input, "reference");
                    let commit = input.get("commit").and_then(Value::as_str).map(ToString::to_string);
                    let cloned = tool.clone_repo(&repo_url, &reference, commit.as_deref()).await?;
                    to_payload(ACT_CLONE, &cloned)
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_BUILD,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let workdir = string_field(&input, "workdir");
                    let command = string_field(&input, "command");
                    let commit = string_field(&input, "commit");
                    let artifact = tool.build(&workdir, &command, &commit).await?;
                    to_payload(ACT_BUILD, &artifact)
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_TEST,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let workdir = string_field(&input, "workdir");
                    let command = string_field(&input, "command");
                    let report = tool.test(&workdir, &command).await?;
                    to_payload(ACT_TEST, &report)
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_TRANSFER,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let artifact = string_field(&input, "artifact");
                    let target = string_field(&input, "target");
                    let username = string_field(&input, "username");
                    tool.transfer(&artifact, &target, &username).await?;
                    Ok(json!({ "transferred": true }))
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_RESTART,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let target = string_field(&input, "target");
                    let username = string_field(&input, "username");
                    tool.restart_service(&target, &username).await?;
                    Ok(json!({ "restarted": true }))
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_NOTIFY,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let message = string_field(&input, "message");
                    tool.notify(&message).await?;
                    Ok(json!({ "notified": true }))
                }
            })),
        );
    }

    fn set_stage(ctx: &WorkflowContext, stage: PipelineStage) {
        ctx.set_stage(stage.to_string());
    }

    /// Sends a best-effort notification. A lost notification never
    /// fails a run; cancellation still propagates.
    async fn notify(
        ctx: &WorkflowContext,
        retry: &RetryPolicy,
        message: String,
    ) -> Result<(), WorkflowError> {
        let options = ActivityOptions::new(NOTIFY_TIMEOUT).with_retry(retry.clone());
        if let Err(err) = ctx
            .execute_activity(ACT_NOTIFY, json!({ "message": message }), &options)
            .await
        {
            if err.kind == ErrorKind::Cancelled {
                return Err(WorkflowError::Cancelled);
            }
            warn!(error = %err, "notification failed");
        }
        Ok(())
    }

    /// Records a failed run. Deterministic and exhausted failures end
    /// the run, not the execution: the workflow returns to `Idle` so a
    /// later `redeploy` can try again.
    async fn report_failure(
        ctx: &WorkflowContext,
        input: &DeployInput,
        stage: PipelineStage,
        err: ActivityError,
        run: u32,
    ) -> Result<DeployOutcome, WorkflowError> {
        if err.kind == ErrorKind::Cancelled {
            return Err(WorkflowError::Cancelled);
        }
        Self::notify(
            ctx,
            &input.retry,
            format!("deployment run {run} failed at {stage}: {err}"),
        )
        .await?;
        Ok(DeployOutcome {
            succeeded: false,
            stage_reached: stage.to_string(),
            artifact: None,
            application_url: None,
            error: Some(err.to_string()),
            run,
        })
    }

    async fn run_pipeline(
        ctx: &WorkflowContext,
        input: &DeployInput,
        run: u32,
    ) -> Result<DeployOutcome, WorkflowError> {
        let retry = &input.retry;

        Self::set_stage(ctx, PipelineStage::ResolvingTarget);
        let options = ActivityOptions::new(LOOKUP_TIMEOUT).with_retry(retry.clone());
        let payload = json!({ "execution": input.infra_execution_id });
        let target: InfraOutput = match ctx.execute_activity(ACT_LOOKUP, payload, &options).await {
            Ok(value) => serde_json::from_value(value)
                .map_err(|err| WorkflowError::InvalidInput(format!("bad target record: {err}")))?,
            Err(err) => {
                return Self::report_failure(ctx, input, PipelineStage::ResolvingTarget, err, run)
                    .await
            }
        };

        Self::set_stage(ctx, PipelineStage::Cloning);
        let options = ActivityOptions::new(CLONE_TIMEOUT).with_retry(retry.clone());
        let payload = json!({
            "repo_url": input.repo_url,
            "reference": input.branch,
            "commit": input.commit,
        });
        let cloned: CloneResult = match ctx.execute_activity(ACT_CLONE, payload, &options).await {
            Ok(value) => serde_json::from_value(value)
                .map_err(|err| WorkflowError::InvalidInput(format!("bad clone result: {err}")))?,
            Err(err) => {
                return Self::report_failure(ctx, input, PipelineStage::Cloning, err, run).await
            }
        };

        Self::set_stage(ctx, PipelineStage::Building);
        let options = ActivityOptions::new(BUILD_TIMEOUT).with_retry(retry.clone());
        let payload = json!({
            "workdir": cloned.workdir,
            "command": input.build_command,
            "commit": cloned.commit,
        });
        let artifact: BuildArtifact = match ctx.execute_activity(ACT_BUILD, payload, &options).await
        {
            Ok(value) => serde_json::from_value(value)
                .map_err(|err| WorkflowError::InvalidInput(format!("bad artifact: {err}")))?,
            Err(err) => {
                return Self::report_failure(ctx, input, PipelineStage::Building, err, run).await
            }
        };

        Self::set_stage(ctx, PipelineStage::Testing);
        let options = ActivityOptions::new(TEST_TIMEOUT).with_retry(retry.clone());
        let payload = json!({ "workdir": cloned.workdir, "command": input.test_command });
        match ctx.execute_activity(ACT_TEST, payload, &options).await {
            Ok(value) => {
                let report: TestReport = serde_json::from_value(value)
                    .map_err(|err| WorkflowError::InvalidInput(format!("bad test report: {err}")))?;
                if report.failed > 0 {
                    // Failing tests are a property of the commit, not
                    // of the infrastructure; retrying cannot help.
                    let err = ActivityError::deterministic(
                        ACT_TEST,
                        format!(
                            "{} of {} tests failed",
                            report.failed,
                            report.passed + report.failed + report.skipped
                        ),
                    );
                    return Self::report_failure(ctx, input, PipelineStage::Testing, err, run)
                        .await;
                }
            }
            Err(err) => {
                return Self::report_failure(ctx, input, PipelineStage::Testing, err, run).await
            }
        }

        Self::set_stage(ctx, PipelineStage::Transferring);
        let options = ActivityOptions::new(TRANSFER_TIMEOUT).with_retry(retry.clone());
        let payload = json!({
            "artifact": artifact.name,
            "target": target.public_ip_address,
            "username": target.admin_username,
        });
        if let Err(err) = ctx.execute_activity(ACT_TRANSFER, payload, &options).await {
            return Self::report_failure(ctx, input, PipelineStage::Transferring, err, run).await;
        }

        Self::set_stage(ctx, PipelineStage::Restarting);
        let options = ActivityOptions::new(RESTART_TIMEOUT).with_retry(retry.clone());
        let payload = json!({
            "target": target.public_ip_address,
            "username": target.admin_username,
        });
        if let Err(err) = ctx.execute_activity(ACT_RESTART, payload, &options).await {
            return Self::report_failure(ctx, input, PipelineStage::Restarting, err, run).await;
        }

        let application_url = format!("http://{}:{APPLICATION_PORT}", target.public_ip_address);
        Self::notify(
            ctx,
            retry,
            format!("deployment run {run} succeeded: {application_url}"),
        )
        .await?;

        Ok(DeployOutcome {
            succeeded: true,
            stage_reached: PipelineStage::Restarting.to_string(),
            artifact: Some(artifact.name),
            application_url: Some(application_url),
            error: None,
            run,
        })
    }
}

fn string_field(input: &Value, key: &str) -> String {
    input
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Workflow for CicdPipelineWorkflow {
    async fn run(&self, ctx: &WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
        let mut input: DeployInput = serde_json::from_value(input)
            .map_err(|err| WorkflowError::InvalidInput(err.to_string()))?;
        ctx.declare_query(DEPLOY_DETAILS_QUERY);

        let mut run = 1_u32;
        loop {
            let outcome = Self::run_pipeline(ctx, &input, run).await?;
            let outcome = serde_json::to_value(&outcome)
                .map_err(|err| WorkflowError::InvalidInput(err.to_string()))?;
            ctx.expose(DEPLOY_DETAILS_QUERY, outcome);

            // A redeploy that arrived mid-run is waiting in the inbox
            // and is consumed here, exactly once.
            Self::set_stage(ctx, PipelineStage::Idle);
            let payload = ctx.wait_signal(REDEPLOY_SIGNAL).await?;
            let request: RedeployRequest = serde_json::from_value(payload).unwrap_or_default();
            if let Some(branch) = request.branch {
                input.branch = branch;
                input.commit = None;
            }
            if let Some(commit) = request.commit {
                input.commit = Some(commit);
            }
            run += 1;
        }
    }
}
