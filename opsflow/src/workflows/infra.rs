//! Infrastructure provisioning state machine.
//!
//! `Init → Planning → Applying → Validating → Ready`, with saga
//! compensation (`Compensating → Destroyed`) once any resources exist.
//! A failure before anything is created ends in `Failed`; a destroy
//! that exhausts its retries ends in `FailedRequiresManualCleanup`
//! rather than retrying forever.

use crate::activity::{ActivityOptions, FnActivity, TaskQueue};
use crate::coordinator::{Workflow, WorkflowContext};
use crate::errors::{ActivityError, ErrorKind, ErrorSummary, WorkflowError};
use crate::retry::RetryPolicy;
use crate::saga::{Compensation, CompensationStack};
use crate::tools::InfraTool;
use crate::workflows::{parse_payload, to_payload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Initializes the provisioning workspace.
pub const ACT_INIT: &str = "terraform.init";
/// Computes the change plan.
pub const ACT_PLAN: &str = "terraform.plan";
/// Applies the plan.
pub const ACT_APPLY: &str = "terraform.apply";
/// Tears the workspace down. Idempotent.
pub const ACT_DESTROY: &str = "terraform.destroy";
/// Checks the provisioned stack is reachable.
pub const ACT_VALIDATE: &str = "infra.validate";

/// Query returning the populated [`InfraOutput`] once `Ready`.
pub const INFRA_OUTPUT_QUERY: &str = "get_infra_output";
/// Query returning the current provisioning state.
pub const INFRA_STATUS_QUERY: &str = "get_status";

const INIT_TIMEOUT: Duration = Duration::from_secs(120);
const PLAN_TIMEOUT: Duration = Duration::from_secs(300);
const APPLY_TIMEOUT: Duration = Duration::from_secs(600);
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(120);
const DESTROY_TIMEOUT: Duration = Duration::from_secs(300);

const PLACEHOLDER_SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";

fn default_project() -> String {
    "demo".to_string()
}
fn default_environment() -> String {
    "dev".to_string()
}
fn default_region() -> String {
    "uksouth".to_string()
}
fn default_vm_size() -> String {
    "Standard_B2s".to_string()
}
fn default_vnet_cidr() -> String {
    "10.0.0.0/16".to_string()
}
fn default_subnet_cidr() -> String {
    "10.0.1.0/24".to_string()
}
fn default_admin_username() -> String {
    "azureadmin".to_string()
}

/// Input to the provisioning workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraInput {
    /// Project slug, used in resource names.
    #[serde(default = "default_project")]
    pub project: String,
    /// Environment slug, used in resource names.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Target region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Machine size for the application host.
    #[serde(default = "default_vm_size")]
    pub vm_size: String,
    /// Address space for the virtual network.
    #[serde(default = "default_vnet_cidr")]
    pub vnet_cidr: String,
    /// Address space for the application subnet.
    #[serde(default = "default_subnet_cidr")]
    pub subnet_cidr: String,
    /// Administrator account on the application host.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Retry policy applied to every provisioning activity.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for InfraInput {
    fn default() -> Self {
        Self {
            project: default_project(),
            environment: default_environment(),
            region: default_region(),
            vm_size: default_vm_size(),
            vnet_cidr: default_vnet_cidr(),
            subnet_cidr: default_subnet_cidr(),
            admin_username: default_admin_username(),
            retry: RetryPolicy::default(),
        }
    }
}

impl InfraInput {
    /// Workspace identifier for this project and environment.
    #[must_use]
    pub fn workspace(&self) -> String {
        format!("{}-{}", self.project, self.environment)
    }
}

/// Summary of a computed change plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub add: u32,
    /// Resources to modify in place.
    pub change: u32,
    /// Resources to destroy.
    pub destroy: u32,
    /// Identifier of the saved plan, consumed by apply.
    pub plan_id: String,
}

/// Connection details for the provisioned stack.
///
/// Populated once the workflow reaches `Ready` and immutable
/// thereafter; served through [`INFRA_OUTPUT_QUERY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraOutput {
    /// Resource group name.
    pub resource_group_name: String,
    /// Virtual network name.
    pub vnet_name: String,
    /// Full resource id of the application subnet.
    pub subnet_id: String,
    /// Network security group name.
    pub nsg_name: String,
    /// Public address of the application host.
    pub public_ip_address: String,
    /// Application host name.
    pub vm_name: String,
    /// Full resource id of the application host.
    pub vm_id: String,
    /// Private address of the application host.
    pub private_ip_address: String,
    /// Administrator account on the application host.
    pub admin_username: String,
}

impl InfraOutput {
    /// Resolves the deterministic resource names for an input, with the
    /// addresses reported by the provisioner.
    #[must_use]
    pub fn resolve(input: &InfraInput, public_ip: &str, private_ip: &str) -> Self {
        let p = &input.project;
        let e = &input.environment;
        let resource_group_name = format!("rg-{p}-{e}");
        let vnet_name = format!("vnet-{p}-{e}");
        let vm_name = format!("vm-{p}-{e}");
        Self {
            subnet_id: format!(
                "/subscriptions/{PLACEHOLDER_SUBSCRIPTION}/resourceGroups/{resource_group_name}\
                 /providers/Microsoft.Network/virtualNetworks/{vnet_name}/subnets/snet-{p}-{e}"
            ),
            vm_id: format!(
                "/subscriptions/{PLACEHOLDER_SUBSCRIPTION}/resourceGroups/{resource_group_name}\
                 /providers/Microsoft.Compute/virtualMachines/{vm_name}"
            ),
            nsg_name: format!("nsg-{p}-{e}"),
            resource_group_name,
            vnet_name,
            public_ip_address: public_ip.to_string(),
            vm_name,
            private_ip_address: private_ip.to_string(),
            admin_username: input.admin_username.clone(),
        }
    }
}

/// Provisioning state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraState {
    /// Initializing the workspace.
    Init,
    /// Computing the change plan.
    Planning,
    /// Applying the plan.
    Applying,
    /// Checking the provisioned stack.
    Validating,
    /// Terminal success; the output query is populated.
    Ready,
    /// Unwinding partial resources after a failure.
    Compensating,
    /// Terminal; resources were torn down, the original failure is
    /// reported.
    Destroyed,
    /// Terminal; nothing was created.
    Failed,
    /// Terminal; teardown itself exhausted its retries and an operator
    /// must clean up.
    FailedRequiresManualCleanup,
}

impl fmt::Display for InfraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::Validating => "validating",
            Self::Ready => "ready",
            Self::Compensating => "compensating",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
            Self::FailedRequiresManualCleanup => "failed_requires_manual_cleanup",
        };
        f.write_str(label)
    }
}

/// The provisioning workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfraProvisioningWorkflow;

impl InfraProvisioningWorkflow {
    /// Creates the workflow.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Registers the provisioning activities on a task queue, backed by
    /// the given tool.
    pub fn register_activities(queue: &TaskQueue, tool: Arc<dyn InfraTool>) {
        let t = Arc::clone(&tool);
        queue.register(
            ACT_INIT,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let workspace = input
                        .get("workspace")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    tool.init(&workspace).await?;
                    Ok(json!({ "workspace": workspace, "initialized": true }))
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_PLAN,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let vars: InfraInput = parse_payload(ACT_PLAN, input)?;
                    let plan = tool.plan(&vars).await?;
                    to_payload(ACT_PLAN, &plan)
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_APPLY,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let vars: InfraInput =
                        parse_payload(ACT_APPLY, input.get("vars").cloned().unwrap_or(Value::Null))?;
                    let plan_id = input
                        .get("plan_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let output = tool.apply(&vars, &plan_id).await?;
                    to_payload(ACT_APPLY, &output)
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_DESTROY,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let workspace = input
                        .get("workspace")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    tool.destroy(&workspace).await?;
                    Ok(json!({ "workspace": workspace, "destroyed": true }))
                }
            })),
        );

        let t = Arc::clone(&tool);
        queue.register(
            ACT_VALIDATE,
            Arc::new(FnActivity::new(move |input: Value| {
                let tool = Arc::clone(&t);
                async move {
                    let output: InfraOutput = parse_payload(ACT_VALIDATE, input)?;
                    let healthy = tool.validate(&output).await?;
                    Ok(json!({ "healthy": healthy }))
                }
            })),
        );
    }

    fn set_state(ctx: &WorkflowContext, state: InfraState) {
        ctx.set_stage(state.to_string());
        ctx.expose(INFRA_STATUS_QUERY, json!(state));
    }

    /// Terminal failure with no resources to clean up.
    fn fail(ctx: &WorkflowContext, state: InfraState, err: &ActivityError) -> WorkflowError {
        if err.kind == ErrorKind::Cancelled {
            return WorkflowError::Cancelled;
        }
        Self::set_state(ctx, state);
        WorkflowError::Terminal {
            summary: ErrorSummary::new(err.kind, state.to_string(), err.to_string()),
        }
    }

    /// Unwinds the saga and reports the original failure, or escalates
    /// to manual cleanup if teardown itself gives up.
    async fn compensate(
        ctx: &WorkflowContext,
        saga: &mut CompensationStack,
        original: ActivityError,
    ) -> WorkflowError {
        if original.kind == ErrorKind::Cancelled {
            return WorkflowError::Cancelled;
        }
        Self::set_state(ctx, InfraState::Compensating);
        match saga.unwind(ctx).await {
            Ok(()) => {
                Self::set_state(ctx, InfraState::Destroyed);
                WorkflowError::Terminal {
                    summary: ErrorSummary::new(
                        original.kind,
                        InfraState::Destroyed.to_string(),
                        original.to_string(),
                    ),
                }
            }
            Err(undo_err) if undo_err.kind == ErrorKind::Cancelled => WorkflowError::Cancelled,
            Err(undo_err) => {
                Self::set_state(ctx, InfraState::FailedRequiresManualCleanup);
                WorkflowError::Terminal {
                    summary: ErrorSummary::new(
                        ErrorKind::Fatal,
                        InfraState::FailedRequiresManualCleanup.to_string(),
                        format!("teardown gave up ({undo_err}) after failure: {original}"),
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl Workflow for InfraProvisioningWorkflow {
    async fn run(&self, ctx: &WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
        let input: InfraInput = serde_json::from_value(input)
            .map_err(|err| WorkflowError::InvalidInput(err.to_string()))?;
        ctx.declare_query(INFRA_OUTPUT_QUERY);
        ctx.declare_query(INFRA_STATUS_QUERY);

        let workspace = input.workspace();
        let retry = input.retry.clone();
        let mut saga = CompensationStack::new();
        let destroy_step = Compensation::new(
            ACT_DESTROY,
            json!({ "workspace": workspace }),
            ActivityOptions::new(DESTROY_TIMEOUT).with_retry(retry.clone()),
        );

        Self::set_state(ctx, InfraState::Init);
        let options = ActivityOptions::new(INIT_TIMEOUT).with_retry(retry.clone());
        if let Err(err) = ctx
            .execute_activity(ACT_INIT, json!({ "workspace": workspace }), &options)
            .await
        {
            return Err(Self::fail(ctx, InfraState::Failed, &err));
        }

        Self::set_state(ctx, InfraState::Planning);
        let vars = serde_json::to_value(&input)
            .map_err(|err| WorkflowError::InvalidInput(err.to_string()))?;
        let options = ActivityOptions::new(PLAN_TIMEOUT).with_retry(retry.clone());
        let plan: PlanSummary = match ctx.execute_activity(ACT_PLAN, vars.clone(), &options).await {
            Ok(value) => serde_json::from_value(value)
                .map_err(|err| WorkflowError::InvalidInput(format!("bad plan summary: {err}")))?,
            Err(err) => return Err(Self::fail(ctx, InfraState::Failed, &err)),
        };

        Self::set_state(ctx, InfraState::Applying);
        let options = ActivityOptions::new(APPLY_TIMEOUT).with_retry(retry.clone());
        let payload = json!({ "vars": vars, "plan_id": plan.plan_id });
        let output: InfraOutput = match ctx.execute_activity(ACT_APPLY, payload, &options).await {
            Ok(value) => serde_json::from_value(value)
                .map_err(|err| WorkflowError::InvalidInput(format!("bad apply output: {err}")))?,
            Err(err) => {
                // Nothing to tear down if apply failed before creating
                // any resources.
                if err.detail_flag("resources_created") == Some(false) {
                    return Err(Self::fail(ctx, InfraState::Failed, &err));
                }
                saga.push(destroy_step);
                return Err(Self::compensate(ctx, &mut saga, err).await);
            }
        };
        saga.push(destroy_step);

        Self::set_state(ctx, InfraState::Validating);
        let options = ActivityOptions::new(VALIDATE_TIMEOUT).with_retry(retry);
        let payload = serde_json::to_value(&output)
            .map_err(|err| WorkflowError::InvalidInput(err.to_string()))?;
        match ctx.execute_activity(ACT_VALIDATE, payload, &options).await {
            Ok(value) if value.get("healthy").and_then(Value::as_bool) == Some(true) => {}
            Ok(_) => {
                let err = ActivityError::deterministic(
                    ACT_VALIDATE,
                    "validation reported an unhealthy deployment",
                );
                return Err(Self::compensate(ctx, &mut saga, err).await);
            }
            Err(err) => return Err(Self::compensate(ctx, &mut saga, err).await),
        }

        let result = serde_json::to_value(&output)
            .map_err(|err| WorkflowError::InvalidInput(err.to_string()))?;
        ctx.expose(INFRA_OUTPUT_QUERY, result.clone());
        Self::set_state(ctx, InfraState::Ready);
        Ok(result)
    }
}
