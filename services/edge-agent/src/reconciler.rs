//! Per-stack reconciliation passes.
//!
//! The worker hands each selected record to [`StackManager::perform_action`]
//! as a clone; every suspending call here runs with the registry mutex
//! released, and results flow back through the manager's epoch-guarded
//! write-back.

use std::sync::Arc;

use edge_deployer::{Deployer, DeployerOptions, EngineType, StatusResult, WorkloadStatus};
use tracing::{debug, error};

use crate::client::StatusKind;
use crate::manager::StackManager;
use crate::manifest;
use crate::stack::{EdgeStack, StackAction, StackStatus, MAX_RETRIES, PER_HOUR_RETRIES};

/// After the first hour of idle-cadence retries, attempt only once per
/// hour.
fn backpressure(count: u32) -> bool {
    count > PER_HOUR_RETRIES && count % PER_HOUR_RETRIES != 0
}

fn deployer_options(stack: &EdgeStack, working_dir: std::path::PathBuf) -> DeployerOptions {
    DeployerOptions {
        namespace: (!stack.namespace.is_empty()).then(|| stack.namespace.clone()),
        working_dir,
        env: stack.deployer_env(),
    }
}

impl StackManager {
    /// Run the reconciliation pass applicable to `stack`.
    pub(crate) async fn perform_action(
        &self,
        stack: EdgeStack,
        deployer: Arc<dyn Deployer>,
        engine: EngineType,
    ) {
        match stack.status {
            StackStatus::AwaitingDeployedStatus
            | StackStatus::AwaitingRemovedStatus
            | StackStatus::Deployed => {
                self.check_stack_status(stack, deployer, engine).await;
                return;
            }
            _ => {}
        }

        match stack.action {
            StackAction::Deploy | StackAction::Update => {
                self.deploy_pass(stack, deployer).await;
            }
            StackAction::Delete => {
                self.delete_pass(stack, deployer).await;
            }
            StackAction::Idle => {}
        }
    }

    /// Deploy/update pass: validate, pull, host copy, deploy.
    async fn deploy_pass(&self, mut stack: EdgeStack, deployer: Arc<dyn Deployer>) {
        let stack_name = stack.deploy_name();

        if !self.validate_stack(&mut stack, &deployer, &stack_name).await {
            return;
        }

        if !self.pull_images(&mut stack, &deployer, &stack_name).await {
            return;
        }

        if let Some(host_folder) = stack.host_folder() {
            if let Err(e) =
                manifest::copy_to_host(&stack.file_folder, &host_folder, stack.id, &stack_name)
            {
                error!(stack_id = stack.id, error = %e, "unable to copy the stack to host");

                stack.status = StackStatus::Error;
                self.commit(&stack).await;
                self.report(
                    stack.id,
                    StatusKind::Error,
                    stack.rollback_to,
                    &format!("failed to copy stack to host: {e}"),
                )
                .await;
                return;
            }
        }

        self.deploy_stack_files(stack, deployer, &stack_name).await;
    }

    /// Fail fast when the stack format is invalid; a validation failure
    /// is terminal.
    async fn validate_stack(
        &self,
        stack: &mut EdgeStack,
        deployer: &Arc<dyn Deployer>,
        stack_name: &str,
    ) -> bool {
        debug!(
            stack_id = stack.id,
            stack_name,
            namespace = %stack.namespace,
            "validating stack"
        );

        // Validation reads the live tree; relative-path stacks are only
        // materialized on the host later in the pass.
        let opts = deployer_options(stack, stack.file_folder.clone());
        let files = vec![stack.entry_file_location()];

        match deployer.validate(stack_name, &files, &opts).await {
            Ok(()) => {
                debug!(stack_id = stack.id, stack_version = stack.version, "stack validated");
                true
            }
            Err(e) => {
                error!(stack_id = stack.id, error = %e, "stack validation failed");

                stack.status = StackStatus::Error;
                self.commit(stack).await;
                self.report(
                    stack.id,
                    StatusKind::Error,
                    stack.rollback_to,
                    &format!("failed to validate stack: {e}"),
                )
                .await;
                false
            }
        }
    }

    /// Acquire images when any pull flag is set. Returns false when the
    /// pass must stop (skip, retry or terminal failure).
    async fn pull_images(
        &self,
        stack: &mut EdgeStack,
        deployer: &Arc<dyn Deployer>,
        stack_name: &str,
    ) -> bool {
        if stack.pull_finished || !stack.wants_pull() {
            return true;
        }

        stack.pull_count += 1;
        if backpressure(stack.pull_count) {
            self.commit(stack).await;
            return false;
        }

        debug!(stack_id = stack.id, pull_count = stack.pull_count, "pulling images");
        stack.status = StackStatus::Deploying;
        self.commit(stack).await;

        let opts = deployer_options(stack, stack.file_folder.clone());
        let files = vec![stack.entry_file_location()];

        if let Err(e) = deployer.pull(stack_name, &files, &opts).await {
            error!(
                stack_id = stack.id,
                pull_count = stack.pull_count,
                error = %e,
                "images pull failed"
            );

            if stack.pull_count < MAX_RETRIES {
                stack.status = StackStatus::Retry;
                self.commit(stack).await;
                return false;
            }

            stack.status = StackStatus::Error;
            self.commit(stack).await;
            self.report(
                stack.id,
                StatusKind::Error,
                stack.rollback_to,
                &format!("failed to pull images: {e}"),
            )
            .await;
            return false;
        }

        stack.pull_finished = true;
        self.commit(stack).await;

        debug!(stack_id = stack.id, stack_version = stack.version, "images pulled");
        self.report(stack.id, StatusKind::ImagesPulled, stack.rollback_to, "")
            .await;
        true
    }

    /// Converge the engine to the manifest and hand the record over to
    /// status observation.
    async fn deploy_stack_files(
        &self,
        mut stack: EdgeStack,
        deployer: Arc<dyn Deployer>,
        stack_name: &str,
    ) {
        stack.deploy_count += 1;
        if backpressure(stack.deploy_count) {
            stack.status = StackStatus::Retry;
            self.commit(&stack).await;
            return;
        }

        debug!(
            stack_id = stack.id,
            deploy_count = stack.deploy_count,
            retry_deploy = stack.retry_deploy,
            stack_name,
            namespace = %stack.namespace,
            "stack deployment"
        );

        self.report(stack.id, StatusKind::Deploying, stack.rollback_to, "")
            .await;
        stack.status = StackStatus::Deploying;
        self.commit(&stack).await;

        let opts = deployer_options(&stack, stack.deploy_folder());
        let files = vec![stack.deploy_folder().join(&stack.entry_file_name)];

        if let Err(e) = deployer.deploy(stack_name, &files, &opts).await {
            error!(
                stack_id = stack.id,
                deploy_count = stack.deploy_count,
                error = %e,
                "stack deployment failed"
            );

            if stack.retry_deploy && stack.deploy_count < MAX_RETRIES {
                stack.status = StackStatus::Retry;
                self.commit(&stack).await;
                return;
            }

            stack.status = StackStatus::Error;
            self.commit(&stack).await;
            self.report(
                stack.id,
                StatusKind::Error,
                stack.rollback_to,
                &format!("failed to deploy stack: {e}"),
            )
            .await;
            return;
        }

        debug!(stack_id = stack.id, stack_version = stack.version, "stack deployed");

        if let Err(e) = manifest::snapshot_success(&stack.file_folder) {
            error!(stack_id = stack.id, error = %e, "unable to snapshot successful stack");
        }

        self.report(
            stack.id,
            StatusKind::DeploymentReceived,
            stack.rollback_to,
            "",
        )
        .await;

        stack.action = StackAction::Idle;
        stack.status = StackStatus::AwaitingDeployedStatus;
        self.commit(&stack).await;
    }

    /// Remove pass. A failed remove leaves the record `Removing`; the
    /// next poll re-elevates it, so removal retries indefinitely with
    /// no ceiling.
    async fn delete_pass(&self, mut stack: EdgeStack, deployer: Arc<dyn Deployer>) {
        let stack_name = stack.deploy_name();
        debug!(stack_id = stack.id, "removing stack");

        stack.status = StackStatus::Removing;
        self.commit(&stack).await;

        // Remove against the last successfully deployed tree, so that
        // tear-down still works after the live tree has been rewritten.
        let success_folder = manifest::success_folder(&stack.file_folder);
        let opts = DeployerOptions {
            namespace: (!stack.namespace.is_empty()).then(|| stack.namespace.clone()),
            working_dir: success_folder.clone(),
            env: stack.deployer_env(),
        };
        let files = vec![success_folder.join(&stack.entry_file_name)];

        if let Err(e) = deployer.remove(&stack_name, &files, &opts).await {
            error!(stack_id = stack.id, error = %e, "unable to remove stack");
            return;
        }

        self.report(stack.id, StatusKind::Removing, stack.rollback_to, "")
            .await;

        manifest::remove_stack_dirs(&stack.file_folder);
        if let Some(host_folder) = stack.host_folder() {
            manifest::remove_from_host(&host_folder, stack.id, &stack_name);
        }

        stack.status = StackStatus::AwaitingRemovedStatus;
        self.commit(&stack).await;
    }

    /// Observe the workload and apply the resulting transition.
    async fn check_stack_status(
        &self,
        mut stack: EdgeStack,
        deployer: Arc<dyn Deployer>,
        engine: EngineType,
    ) {
        let stack_name = stack.deploy_name();
        debug!(stack_id = stack.id, stack_name = %stack_name, "checking stack status");

        let (required, deadline) = match stack.status {
            StackStatus::AwaitingDeployedStatus => {
                let required = if stack.edge_update_id != 0 {
                    WorkloadStatus::Completed
                } else {
                    WorkloadStatus::Running
                };
                (required, self.config.status_wait_timeout)
            }
            // No need to wait for a change of state here, just observe
            // whether completion has happened already.
            StackStatus::Deployed => (
                WorkloadStatus::Completed,
                self.config.completed_peek_timeout,
            ),
            StackStatus::AwaitingRemovedStatus => {
                (WorkloadStatus::Removed, self.config.status_wait_timeout)
            }
            _ => return,
        };

        let result = wait_for_status(&deployer, engine, &stack_name, required, deadline).await;

        if stack.status != StackStatus::Deployed {
            debug!(
                stack_id = stack.id,
                stack_name = %stack_name,
                required = %required,
                observed = %result.status,
                "stack status"
            );
        }

        // An already deployed stack only reports one-shot completion;
        // observation errors there mean "not completed yet".
        if stack.status == StackStatus::Deployed {
            if result.status == WorkloadStatus::Completed {
                stack.status = StackStatus::Completed;
                self.commit(&stack).await;
                self.report(stack.id, StatusKind::Completed, stack.rollback_to, "")
                    .await;
            }
            return;
        }

        match result.status {
            WorkloadStatus::Error => {
                stack.status = StackStatus::Error;
                self.commit(&stack).await;
                self.report(
                    stack.id,
                    StatusKind::Error,
                    stack.rollback_to,
                    result.error_message.as_deref().unwrap_or_default(),
                )
                .await;
            }
            WorkloadStatus::Running => {
                stack.status = StackStatus::Deployed;
                self.commit(&stack).await;
                self.report(stack.id, StatusKind::Running, stack.rollback_to, "")
                    .await;
            }
            WorkloadStatus::Completed => {
                stack.status = StackStatus::Completed;
                self.commit(&stack).await;
                self.report(stack.id, StatusKind::Completed, stack.rollback_to, "")
                    .await;
            }
            WorkloadStatus::Removed => {
                if self.remove_record(&stack).await {
                    self.report(stack.id, StatusKind::Removed, stack.rollback_to, "")
                        .await;
                }
            }
            WorkloadStatus::Unknown => {}
        }
    }
}

/// One status observation against the deployer.
///
/// The Kubernetes deployer cannot yet distinguish completion from
/// running, so a successful wait on that engine yields the required
/// status with Completed degraded to Running.
async fn wait_for_status(
    deployer: &Arc<dyn Deployer>,
    engine: EngineType,
    stack_name: &str,
    required: WorkloadStatus,
    deadline: std::time::Duration,
) -> StatusResult {
    let result = deployer.wait_for_status(stack_name, required, deadline).await;

    if result.error_message.is_some() {
        return StatusResult {
            status: WorkloadStatus::Error,
            error_message: result.error_message,
        };
    }

    if engine == EngineType::Kubernetes {
        let status = if required == WorkloadStatus::Completed {
            WorkloadStatus::Running
        } else {
            required
        };
        return StatusResult::ok(status);
    }

    result
}
