//! End-to-end tests for the provisioning state machine.

mod common;

use common::*;
use opsflow::prelude::*;
use opsflow::testing::ScriptedCall;
use opsflow::workflows::infra::{
    ACT_APPLY, ACT_DESTROY, ACT_INIT, ACT_PLAN, ACT_VALIDATE,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::net::Ipv4Addr;

#[tokio::test]
async fn test_provisioning_reaches_ready_with_full_output() {
    let harness = Harness::new();
    let retry = fast_retry(3);

    let handle = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap();
    let result = success_value(outcome_of(&handle).await);

    let output: InfraOutput = serde_json::from_value(result).unwrap();
    assert_eq!(output.resource_group_name, "rg-demo-dev");
    assert_eq!(output.vnet_name, "vnet-demo-dev");
    assert_eq!(output.nsg_name, "nsg-demo-dev");
    assert_eq!(output.vm_name, "vm-demo-dev");
    assert!(output.subnet_id.contains("rg-demo-dev"));
    assert!(!output.vm_id.is_empty());
    assert_eq!(output.admin_username, "azureadmin");
    assert_eq!(output.public_ip_address, SIMULATED_PUBLIC_IP);
    assert_eq!(output.private_ip_address, SIMULATED_PRIVATE_IP);
    output.public_ip_address.parse::<Ipv4Addr>().unwrap();
    output.private_ip_address.parse::<Ipv4Addr>().unwrap();

    let describe = harness.coordinator.describe(INFRA_ID).unwrap();
    assert_eq!(describe.status, ExecutionStatus::Completed);
    assert_eq!(describe.stage, "ready");

    let queried = harness.coordinator.query(INFRA_ID, INFRA_OUTPUT_QUERY).unwrap();
    let queried: InfraOutput = serde_json::from_value(queried).unwrap();
    assert_eq!(queried, output);
}

#[tokio::test]
async fn test_output_query_not_ready_before_ready() {
    let harness = Harness::new();
    harness
        .infra_tool
        .script(ACT_APPLY, vec![ScriptedCall::WaitForGate]);
    let gate = harness.infra_tool.gate(ACT_APPLY);
    let retry = fast_retry(3);

    let handle = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap();
    wait_for_stage(&harness.coordinator, INFRA_ID, "applying").await;

    let err = harness
        .coordinator
        .query(INFRA_ID, INFRA_OUTPUT_QUERY)
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NotReady { .. }));

    gate.open();
    success_value(outcome_of(&handle).await);
    assert!(harness.coordinator.query(INFRA_ID, INFRA_OUTPUT_QUERY).is_ok());
}

#[tokio::test]
async fn test_transient_plan_failures_are_retried() {
    let harness = Harness::new();
    harness.infra_tool.script(
        ACT_PLAN,
        vec![
            ScriptedCall::fail(ErrorKind::Transient, "rate limited"),
            ScriptedCall::fail(ErrorKind::Transient, "connection reset"),
            ScriptedCall::Succeed,
        ],
    );
    let retry = fast_retry(3);

    let handle = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap();
    success_value(outcome_of(&handle).await);
    assert_eq!(harness.infra_tool.calls(ACT_PLAN), 3);

    let history = harness.store.load(INFRA_ID);
    let plan_failures = history
        .iter()
        .filter(|r| {
            matches!(
                &r.event,
                HistoryEvent::ActivityFailed { error, terminal, .. }
                    if error.activity == ACT_PLAN && !terminal
            )
        })
        .count();
    assert_eq!(plan_failures, 2);
}

#[tokio::test]
async fn test_partial_apply_failure_compensates_to_destroyed() {
    let harness = Harness::new();
    harness.infra_tool.script(
        ACT_APPLY,
        vec![ScriptedCall::fail_with_details(
            ErrorKind::Compensable,
            "quota exceeded while creating the virtual machine",
            json!({ "resources_created": true }),
        )],
    );
    let retry = fast_retry(0);

    let handle = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap();
    let summary = failure_summary(outcome_of(&handle).await);

    assert_eq!(summary.kind, ErrorKind::Compensable);
    assert_eq!(summary.state, "destroyed");
    assert!(summary.message.contains("quota exceeded"));
    assert_eq!(harness.infra_tool.calls(ACT_DESTROY), 1);

    let describe = harness.coordinator.describe(INFRA_ID).unwrap();
    assert_eq!(describe.status, ExecutionStatus::Failed);
    assert_eq!(describe.stage, "destroyed");
}

#[tokio::test]
async fn test_validation_failure_compensates() {
    let harness = Harness::new();
    harness.infra_tool.set_healthy(false);
    let retry = fast_retry(0);

    let handle = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap();
    let summary = failure_summary(outcome_of(&handle).await);

    assert_eq!(summary.kind, ErrorKind::Deterministic);
    assert_eq!(summary.state, "destroyed");
    assert_eq!(harness.infra_tool.calls(ACT_VALIDATE), 1);
    assert_eq!(harness.infra_tool.calls(ACT_DESTROY), 1);
}

#[tokio::test]
async fn test_destroy_exhaustion_escalates_to_manual_cleanup() {
    let harness = Harness::new();
    harness.infra_tool.script(
        ACT_APPLY,
        vec![ScriptedCall::fail_with_details(
            ErrorKind::Compensable,
            "apply interrupted",
            json!({ "resources_created": true }),
        )],
    );
    harness.infra_tool.script(
        ACT_DESTROY,
        vec![
            ScriptedCall::fail(ErrorKind::Transient, "lock held"),
            ScriptedCall::fail(ErrorKind::Transient, "lock held"),
            ScriptedCall::fail(ErrorKind::Transient, "lock held"),
        ],
    );
    // Retries apply per activity: apply gives up immediately on the
    // compensable failure, destroy gets two retries then escalates.
    let retry = fast_retry(2).with_non_retriable(ErrorKind::Compensable);

    let handle = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap();
    let summary = failure_summary(outcome_of(&handle).await);

    assert_eq!(summary.kind, ErrorKind::Fatal);
    assert_eq!(summary.state, "failed_requires_manual_cleanup");
    assert!(summary.message.contains("apply interrupted"));
    assert_eq!(harness.infra_tool.calls(ACT_DESTROY), 3);

    let describe = harness.coordinator.describe(INFRA_ID).unwrap();
    assert_eq!(describe.stage, "failed_requires_manual_cleanup");
}

#[tokio::test]
async fn test_init_failure_fails_without_compensation() {
    let harness = Harness::new();
    harness.infra_tool.script(
        ACT_INIT,
        vec![ScriptedCall::fail(ErrorKind::Transient, "backend unreachable")],
    );
    let retry = fast_retry(0);

    let handle = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap();
    let summary = failure_summary(outcome_of(&handle).await);

    assert_eq!(summary.state, "failed");
    assert_eq!(harness.infra_tool.calls(ACT_DESTROY), 0);
}

#[tokio::test]
async fn test_fatal_failure_is_never_retried() {
    let harness = Harness::new();
    harness.infra_tool.script(
        ACT_INIT,
        vec![ScriptedCall::fail(
            ErrorKind::Fatal,
            "Authentication failed: invalid client secret",
        )],
    );
    // Generous retry budget that must not be spent on a fatal error.
    let retry = fast_retry(5);

    let handle = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap();
    let summary = failure_summary(outcome_of(&handle).await);

    assert_eq!(summary.kind, ErrorKind::Fatal);
    assert_eq!(harness.infra_tool.calls(ACT_INIT), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_admit_exactly_one_execution() {
    let harness = Harness::new();
    harness
        .infra_tool
        .script(ACT_APPLY, vec![ScriptedCall::WaitForGate]);
    let gate = harness.infra_tool.gate(ACT_APPLY);
    let retry = fast_retry(3);

    // All callers race the same id; the gated apply keeps the winner
    // live for the whole race.
    let mut attempts = Vec::new();
    for _ in 0..8 {
        let coordinator = harness.coordinator.clone();
        let input = infra_input(&retry);
        attempts.push(tokio::spawn(async move {
            coordinator.start(INFRA_WORKFLOW_TYPE, INFRA_ID, input)
        }));
    }

    let mut handle = None;
    let mut rejected = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(h) => {
                assert!(handle.is_none(), "two starts admitted the same id");
                handle = Some(h);
            }
            Err(CoordinatorError::AlreadyRunning(_)) => rejected += 1,
            Err(err) => panic!("unexpected start error: {err}"),
        }
    }
    assert_eq!(rejected, 7);

    // Only the winner touched the history.
    let starts = harness
        .store
        .load(INFRA_ID)
        .iter()
        .filter(|r| matches!(r.event, HistoryEvent::Started { .. }))
        .count();
    assert_eq!(starts, 1);

    gate.open();
    success_value(outcome_of(&handle.unwrap()).await);
}

#[tokio::test]
async fn test_duplicate_start_is_rejected() {
    let harness = Harness::new();
    harness
        .infra_tool
        .script(ACT_APPLY, vec![ScriptedCall::WaitForGate]);
    let gate = harness.infra_tool.gate(ACT_APPLY);
    let retry = fast_retry(3);

    let handle = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap();
    wait_for_stage(&harness.coordinator, INFRA_ID, "applying").await;

    let err = harness
        .coordinator
        .start(INFRA_WORKFLOW_TYPE, INFRA_ID, infra_input(&retry))
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::AlreadyRunning(_)));

    gate.open();
    success_value(outcome_of(&handle).await);
}
