//! External tool integrations.
//!
//! Workflows never shell out directly; they call activities backed by
//! these traits. The simulated implementations stand in for the real
//! provisioning and build toolchains and return the same shapes those
//! tools produce.

pub mod classify;

pub use classify::classify_command_failure;

use crate::errors::ActivityError;
use crate::workflows::cicd::{BuildArtifact, CloneResult, TestReport};
use crate::workflows::infra::{InfraInput, InfraOutput, PlanSummary};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::info;

/// Public address reported by the simulated provisioner.
pub const SIMULATED_PUBLIC_IP: &str = "20.185.72.14";
/// Private address reported by the simulated provisioner.
pub const SIMULATED_PRIVATE_IP: &str = "10.0.1.4";
/// Plan identifier produced by the simulated planner.
pub const SIMULATED_PLAN_ID: &str = "tfplan";

/// Captured result of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutcome {
    /// A successful outcome with the given stdout.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Returns true for exit code zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Converts into the captured stdout, or a classified error.
    pub fn into_result(self, activity: &str) -> Result<String, ActivityError> {
        if self.is_success() {
            return Ok(self.stdout);
        }
        let message = if self.stderr.trim().is_empty() {
            format!("command exited with code {}", self.exit_code)
        } else {
            self.stderr.trim().to_string()
        };
        let kind = classify_command_failure(&message);
        Err(ActivityError::new(activity, kind, message))
    }
}

/// Infrastructure provisioning operations.
#[async_trait]
pub trait InfraTool: Send + Sync {
    /// Initializes the working directory for the workspace.
    async fn init(&self, workspace: &str) -> Result<(), ActivityError>;

    /// Computes a change plan for the requested stack.
    async fn plan(&self, input: &InfraInput) -> Result<PlanSummary, ActivityError>;

    /// Applies a previously computed plan.
    async fn apply(&self, input: &InfraInput, plan_id: &str) -> Result<InfraOutput, ActivityError>;

    /// Tears down everything in the workspace. Idempotent.
    async fn destroy(&self, workspace: &str) -> Result<(), ActivityError>;

    /// Checks that the provisioned stack is actually reachable.
    async fn validate(&self, output: &InfraOutput) -> Result<bool, ActivityError>;
}

/// Build, test and deployment operations.
#[async_trait]
pub trait BuildTool: Send + Sync {
    /// Clones the repository at the given reference.
    async fn clone_repo(
        &self,
        repo_url: &str,
        reference: &str,
        commit: Option<&str>,
    ) -> Result<CloneResult, ActivityError>;

    /// Builds the checked-out tree into a deployable artifact.
    async fn build(
        &self,
        workdir: &str,
        command: &str,
        commit: &str,
    ) -> Result<BuildArtifact, ActivityError>;

    /// Runs the test suite.
    async fn test(&self, workdir: &str, command: &str) -> Result<TestReport, ActivityError>;

    /// Copies the artifact to the target host.
    async fn transfer(
        &self,
        artifact: &str,
        target: &str,
        username: &str,
    ) -> Result<(), ActivityError>;

    /// Restarts the application service on the target host.
    async fn restart_service(&self, target: &str, username: &str) -> Result<(), ActivityError>;

    /// Sends a human-facing notification.
    async fn notify(&self, message: &str) -> Result<(), ActivityError>;
}

/// Simulated provisioner.
///
/// Returns the shapes a real provisioning run would, with fixed
/// addresses, without touching any cloud account.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedInfraTool;

impl SimulatedInfraTool {
    /// Creates a simulated provisioner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InfraTool for SimulatedInfraTool {
    async fn init(&self, workspace: &str) -> Result<(), ActivityError> {
        info!(workspace = %workspace, "initializing workspace");
        CommandOutcome::success("Initialization complete").into_result("terraform.init")?;
        Ok(())
    }

    async fn plan(&self, input: &InfraInput) -> Result<PlanSummary, ActivityError> {
        info!(project = %input.project, environment = %input.environment, "planning");
        CommandOutcome::success("Plan: 7 to add, 0 to change, 0 to destroy")
            .into_result("terraform.plan")?;
        Ok(PlanSummary {
            add: 7,
            change: 0,
            destroy: 0,
            plan_id: SIMULATED_PLAN_ID.to_string(),
        })
    }

    async fn apply(&self, input: &InfraInput, plan_id: &str) -> Result<InfraOutput, ActivityError> {
        info!(plan_id = %plan_id, "applying plan");
        CommandOutcome::success("Apply complete").into_result("terraform.apply")?;
        Ok(InfraOutput::resolve(input, SIMULATED_PUBLIC_IP, SIMULATED_PRIVATE_IP))
    }

    async fn destroy(&self, workspace: &str) -> Result<(), ActivityError> {
        info!(workspace = %workspace, "destroying workspace");
        CommandOutcome::success("Destroy complete").into_result("terraform.destroy")?;
        Ok(())
    }

    async fn validate(&self, output: &InfraOutput) -> Result<bool, ActivityError> {
        info!(vm = %output.vm_name, "validating deployment");
        Ok(true)
    }
}

/// Simulated build toolchain.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedBuildTool;

impl SimulatedBuildTool {
    /// Creates a simulated build toolchain.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn fake_commit(repo_url: &str, reference: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(repo_url.as_bytes());
        hasher.update(reference.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..40].to_string()
    }
}

#[async_trait]
impl BuildTool for SimulatedBuildTool {
    async fn clone_repo(
        &self,
        repo_url: &str,
        reference: &str,
        commit: Option<&str>,
    ) -> Result<CloneResult, ActivityError> {
        info!(repo = %repo_url, reference = %reference, "cloning repository");
        let repo_name = repo_url
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or("app");
        Ok(CloneResult {
            workdir: format!("/tmp/builds/{repo_name}"),
            commit: commit
                .map_or_else(|| Self::fake_commit(repo_url, reference), ToString::to_string),
        })
    }

    async fn build(
        &self,
        workdir: &str,
        command: &str,
        commit: &str,
    ) -> Result<BuildArtifact, ActivityError> {
        info!(workdir = %workdir, command = %command, "building");
        CommandOutcome::success("Build succeeded").into_result("app.build")?;
        let short = commit.get(..7).unwrap_or(commit);
        Ok(BuildArtifact {
            name: format!("app-{short}.tar.gz"),
            commit: commit.to_string(),
        })
    }

    async fn test(&self, workdir: &str, command: &str) -> Result<TestReport, ActivityError> {
        info!(workdir = %workdir, command = %command, "running tests");
        Ok(TestReport {
            passed: 154,
            failed: 0,
            skipped: 2,
        })
    }

    async fn transfer(
        &self,
        artifact: &str,
        target: &str,
        username: &str,
    ) -> Result<(), ActivityError> {
        info!(artifact = %artifact, target = %target, user = %username, "transferring artifact");
        CommandOutcome::success("").into_result("app.transfer")?;
        Ok(())
    }

    async fn restart_service(&self, target: &str, username: &str) -> Result<(), ActivityError> {
        info!(target = %target, user = %username, "restarting service");
        CommandOutcome::success("").into_result("service.restart")?;
        Ok(())
    }

    async fn notify(&self, message: &str) -> Result<(), ActivityError> {
        info!(message = %message, "notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_command_outcome_success() {
        let out = CommandOutcome::success("done");
        assert!(out.is_success());
        assert_eq!(out.into_result("x").unwrap(), "done");
    }

    #[test]
    fn test_command_outcome_failure_classified() {
        let out = CommandOutcome {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Error: Authentication failed".to_string(),
        };
        let err = out.into_result("terraform.apply").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);

        let out = CommandOutcome {
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
        };
        let err = out.into_result("terraform.apply").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(err.message.contains("exit"));
    }

    #[tokio::test]
    async fn test_simulated_plan_shape() {
        let tool = SimulatedInfraTool::new();
        let plan = tool.plan(&InfraInput::default()).await.unwrap();
        assert_eq!(plan.add, 7);
        assert_eq!(plan.plan_id, SIMULATED_PLAN_ID);
    }

    #[tokio::test]
    async fn test_simulated_apply_uses_fixed_addresses() {
        let tool = SimulatedInfraTool::new();
        let input = InfraInput::default();
        let output = tool.apply(&input, SIMULATED_PLAN_ID).await.unwrap();
        assert_eq!(output.public_ip_address, SIMULATED_PUBLIC_IP);
        assert_eq!(output.private_ip_address, SIMULATED_PRIVATE_IP);
    }

    #[tokio::test]
    async fn test_simulated_clone_and_build() {
        let tool = SimulatedBuildTool::new();
        let cloned = tool
            .clone_repo("https://example.com/org/demo-app.git", "main", None)
            .await
            .unwrap();
        assert_eq!(cloned.workdir, "/tmp/builds/demo-app");
        assert_eq!(cloned.commit.len(), 40);

        let artifact = tool
            .build(&cloned.workdir, "make build", &cloned.commit)
            .await
            .unwrap();
        assert_eq!(artifact.name, format!("app-{}.tar.gz", &cloned.commit[..7]));
    }

    #[tokio::test]
    async fn test_simulated_test_report() {
        let tool = SimulatedBuildTool::new();
        let report = tool.test("/tmp/builds/demo-app", "make test").await.unwrap();
        assert_eq!((report.passed, report.failed, report.skipped), (154, 0, 2));
    }
}
