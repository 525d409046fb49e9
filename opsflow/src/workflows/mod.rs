//! The two pipeline state machines.

pub mod cicd;
pub mod infra;

pub use cicd::CicdPipelineWorkflow;
pub use infra::InfraProvisioningWorkflow;

/// Workflow type name for the provisioning state machine.
pub const INFRA_WORKFLOW_TYPE: &str = "infra_provisioning";
/// Workflow type name for the build/test/deploy state machine.
pub const CICD_WORKFLOW_TYPE: &str = "cicd_pipeline";

/// Task queue for provisioning activities.
pub const INFRA_TASK_QUEUE: &str = "infra-platform";
/// Task queue for build and deployment activities.
pub const CICD_TASK_QUEUE: &str = "app-deployments";

use crate::errors::ActivityError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub(crate) fn parse_payload<T: DeserializeOwned>(
    activity: &str,
    input: Value,
) -> Result<T, ActivityError> {
    serde_json::from_value(input)
        .map_err(|err| ActivityError::deterministic(activity, format!("malformed payload: {err}")))
}

pub(crate) fn to_payload<T: Serialize>(activity: &str, value: &T) -> Result<Value, ActivityError> {
    serde_json::to_value(value)
        .map_err(|err| ActivityError::deterministic(activity, format!("unencodable result: {err}")))
}
