//! # Opsflow
//!
//! A durable workflow orchestration layer coordinating an
//! infrastructure-provisioning pipeline and a build/test/deploy
//! pipeline.
//!
//! Opsflow provides:
//!
//! - **Durable execution**: every execution persists an append-only
//!   event history and is reconstructed by deterministic replay after a
//!   crash, never re-running a completed side effect
//! - **Saga compensation**: partially created resources are torn down
//!   in reverse order on failure, with escalation to manual cleanup
//!   when teardown itself gives up
//! - **Signals and queries**: queued inboxes consumed at suspension
//!   points and side-effect-free reads over reconstructed state
//! - **Retry policy**: deterministic exponential backoff with a failure
//!   taxonomy separating transient faults from deterministic ones
//! - **Task queues**: named isolation boundaries matching activities to
//!   authorized worker pools
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use opsflow::prelude::*;
//!
//! let store = Arc::new(InMemoryHistoryStore::new());
//! let coordinator = Coordinator::new(store);
//!
//! let queue = coordinator.task_queue(INFRA_TASK_QUEUE);
//! InfraProvisioningWorkflow::register_activities(&queue, Arc::new(SimulatedInfraTool::new()));
//! queue.start_workers(2);
//!
//! coordinator.register_workflow(
//!     INFRA_WORKFLOW_TYPE,
//!     INFRA_TASK_QUEUE,
//!     Arc::new(InfraProvisioningWorkflow::new()),
//! );
//! let handle = coordinator.start(INFRA_WORKFLOW_TYPE, "infra-1", serde_json::json!({}))?;
//! let outcome = handle.outcome().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod activity;
pub mod cancellation;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod events;
pub mod retry;
pub mod saga;
pub mod testing;
pub mod tools;
pub mod utils;
pub mod workflows;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityOptions, FnActivity, TaskQueue};
    pub use crate::cancellation::CancelToken;
    pub use crate::coordinator::{
        Coordinator, DescribeResponse, HistoryStore, InMemoryHistoryStore, QueryBridge, Workflow,
        WorkflowContext, WorkflowHandle,
    };
    pub use crate::core::{CompletionOutcome, ExecutionStatus, HistoryEvent, RecordedEvent};
    pub use crate::errors::{
        ActivityError, CoordinatorError, ErrorKind, ErrorSummary, WorkflowError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::retry::{RetryDecision, RetryPolicy};
    pub use crate::saga::{Compensation, CompensationStack};
    pub use crate::tools::{
        BuildTool, InfraTool, SimulatedBuildTool, SimulatedInfraTool, SIMULATED_PRIVATE_IP,
        SIMULATED_PUBLIC_IP,
    };
    pub use crate::workflows::cicd::{
        CicdPipelineWorkflow, DeployInput, DeployOutcome, RedeployRequest, DEPLOY_DETAILS_QUERY,
        REDEPLOY_SIGNAL,
    };
    pub use crate::workflows::infra::{
        InfraInput, InfraOutput, InfraProvisioningWorkflow, InfraState, INFRA_OUTPUT_QUERY,
        INFRA_STATUS_QUERY,
    };
    pub use crate::workflows::{
        CICD_TASK_QUEUE, CICD_WORKFLOW_TYPE, INFRA_TASK_QUEUE, INFRA_WORKFLOW_TYPE,
    };
}
