//! End-to-end tests for the stack reconciliation flow.
//!
//! Each test drives the public `StackManager` API the way the poll loop
//! and the control plane would, against a scriptable mock deployer and
//! a mock control plane, with millisecond-tuned intervals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use edge_agent::client::{DirEntry, MockControlPlane, StackPayload, StackSummary, StatusKind};
use edge_agent::config::ManagerConfig;
use edge_agent::manager::{StackManager, StackOverview};
use edge_agent::stack::{StackAction, StackStatus};
use edge_deployer::{EngineType, MockDeployer, StatusResult, WorkloadStatus};
use tempfile::TempDir;

// "services: {}\n" in base64.
const COMPOSE_BODY: &str = "c2VydmljZXM6IHt9Cg==";

struct Harness {
    manager: StackManager,
    client: Arc<MockControlPlane>,
    deployer: Arc<MockDeployer>,
    dir: TempDir,
}

async fn start_harness() -> Harness {
    start_harness_on(EngineType::DockerStandalone).await
}

async fn start_harness_on(engine: EngineType) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MockControlPlane::new());
    let deployer = Arc::new(MockDeployer::new());

    let config = ManagerConfig {
        idle_interval: Duration::from_millis(5),
        status_wait_timeout: Duration::from_millis(50),
        completed_peek_timeout: Duration::from_millis(5),
    };
    let manager = StackManager::new(
        client.clone(),
        dir.path().to_path_buf(),
        "edge-test".to_string(),
        config,
    );

    manager
        .set_engine_type_with(engine, deployer.clone())
        .await
        .unwrap();
    manager.start().await.unwrap();

    Harness {
        manager,
        client,
        deployer,
        dir,
    }
}

fn test_payload(id: i64, version: i64) -> StackPayload {
    StackPayload {
        id,
        name: format!("stack{id}"),
        version,
        entry_file_name: "docker-compose.yml".to_string(),
        dir_entries: vec![DirEntry {
            name: "docker-compose.yml".to_string(),
            content: COMPOSE_BODY.to_string(),
            is_file: true,
            permissions: 0o644,
        }],
        namespace: String::new(),
        pre_pull_image: false,
        re_pull_image: false,
        ready_re_pull_image: false,
        retry_deploy: false,
        support_relative_path: false,
        filesystem_path: String::new(),
        registry_credentials: Vec::new(),
        env_vars: Vec::new(),
        rollback_to: None,
        edge_update_id: 0,
    }
}

fn snapshot(entries: &[(i64, i64)]) -> HashMap<i64, StackSummary> {
    entries
        .iter()
        .map(|(id, version)| {
            (
                *id,
                StackSummary {
                    version: *version,
                    ready_re_pull_image: false,
                },
            )
        })
        .collect()
}

async fn wait_for_stack<F>(manager: &StackManager, id: i64, mut pred: F) -> StackOverview
where
    F: FnMut(&StackOverview) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(overview) = manager.stack_overview(id).await {
            if pred(&overview) {
                return overview;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stack {id} did not reach the expected state"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_gone(manager: &StackManager, id: i64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.stack_overview(id).await.is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "stack {id} was not removed from the registry"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn fresh_deploy_reaches_deployed() {
    let h = start_harness().await;
    h.client.insert_config(test_payload(42, 1));
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Running));

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();

    let overview = wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Deployed).await;
    assert_eq!(overview.action, StackAction::Idle);
    assert_eq!(overview.version, 1);

    assert_eq!(
        h.client.report_kinds(42),
        vec![
            StatusKind::Acknowledged,
            StatusKind::Deploying,
            StatusKind::DeploymentReceived,
            StatusKind::Running,
        ]
    );

    // Live tree deployed, success tree snapshotted.
    assert!(h.dir.path().join("stacks/42/docker-compose.yml").exists());
    assert!(h
        .dir
        .path()
        .join("stacks/42-success/docker-compose.yml")
        .exists());
}

#[tokio::test]
async fn version_bump_redeploys() {
    let h = start_harness().await;
    h.client.insert_config(test_payload(42, 1));
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Running));

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();
    wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Deployed).await;

    h.client.insert_config(test_payload(42, 2));
    h.manager
        .update_stacks_status(snapshot(&[(42, 2)]))
        .await
        .unwrap();

    // The redeploy parks awaiting observation, then comes up.
    wait_for_stack(&h.manager, 42, |o| {
        o.version == 2 && o.status == StackStatus::AwaitingDeployedStatus
    })
    .await;
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Running));
    wait_for_stack(&h.manager, 42, |o| {
        o.version == 2 && o.status == StackStatus::Deployed
    })
    .await;

    assert_eq!(
        h.client.report_kinds(42),
        vec![
            StatusKind::Acknowledged,
            StatusKind::Deploying,
            StatusKind::DeploymentReceived,
            StatusKind::Running,
            StatusKind::Acknowledged,
            StatusKind::Deploying,
            StatusKind::DeploymentReceived,
            StatusKind::Running,
        ]
    );
}

#[tokio::test]
async fn transient_pull_failure_then_success() {
    let h = start_harness().await;
    let mut payload = test_payload(42, 1);
    payload.pre_pull_image = true;
    h.client.insert_config(payload);

    h.deployer.fail_pulls(1);
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Running));

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();

    let overview = wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Deployed).await;
    assert_eq!(overview.pull_count, 2);
    assert!(overview.pull_finished);

    let kinds = h.client.report_kinds(42);
    assert_eq!(
        kinds.iter().filter(|k| **k == StatusKind::ImagesPulled).count(),
        1
    );
    assert_eq!(
        kinds,
        vec![
            StatusKind::Acknowledged,
            StatusKind::ImagesPulled,
            StatusKind::Deploying,
            StatusKind::DeploymentReceived,
            StatusKind::Running,
        ]
    );
}

#[tokio::test]
async fn deploy_failure_without_retry_is_terminal() {
    let h = start_harness().await;
    h.client.insert_config(test_payload(42, 1));
    h.deployer.fail_deploy();

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();

    let overview = wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Error).await;
    assert_eq!(overview.deploy_count, 1);

    // No further attempts once terminal.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.deployer.call_count("deploy"), 1);

    let kinds = h.client.report_kinds(42);
    assert_eq!(
        kinds,
        vec![
            StatusKind::Acknowledged,
            StatusKind::Deploying,
            StatusKind::Error,
        ]
    );
}

#[tokio::test]
async fn removal_deletes_record_and_directories() {
    let h = start_harness().await;
    h.client.insert_config(test_payload(42, 1));
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Running));

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();
    wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Deployed).await;

    h.manager.update_stacks_status(HashMap::new()).await.unwrap();
    wait_for_stack(&h.manager, 42, |o| {
        o.status == StackStatus::AwaitingRemovedStatus
    })
    .await;
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Removed));

    wait_for_gone(&h.manager, 42).await;
    assert!(h.manager.tracked_ids().await.is_empty());

    let kinds = h.client.report_kinds(42);
    assert_eq!(kinds[kinds.len() - 2..], [StatusKind::Removing, StatusKind::Removed]);

    // Both manifest trees are gone.
    assert!(!h.dir.path().join("stacks/42").exists());
    assert!(!h.dir.path().join("stacks/42-success").exists());

    // Removal ran against the success tree.
    let success_dir = h.dir.path().join("stacks/42-success");
    assert!(h
        .deployer
        .calls()
        .contains(&format!("remove:{}", success_dir.display())));
}

#[tokio::test]
async fn remove_failure_retries_on_next_poll() {
    let h = start_harness().await;
    h.client.insert_config(test_payload(42, 1));
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Running));

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();
    wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Deployed).await;

    h.deployer.fail_removes(1);
    h.manager.update_stacks_status(HashMap::new()).await.unwrap();

    // First attempt fails and the record parks in Removing.
    wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Removing).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.deployer.call_count("remove"), 1);

    // The next poll re-elevates it and the retry succeeds.
    h.manager.update_stacks_status(HashMap::new()).await.unwrap();
    wait_for_stack(&h.manager, 42, |o| {
        o.status == StackStatus::AwaitingRemovedStatus
    })
    .await;
    assert_eq!(h.deployer.call_count("remove"), 2);

    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Removed));
    wait_for_gone(&h.manager, 42).await;
}

#[tokio::test]
async fn one_shot_stack_completes() {
    let h = start_harness().await;
    let mut payload = test_payload(42, 1);
    payload.edge_update_id = 9;
    h.client.insert_config(payload);
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Completed));

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();

    wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Completed).await;

    // The record stays until a future poll drops the stack.
    assert_eq!(h.manager.tracked_ids().await, vec![42]);
    assert_eq!(
        h.client.report_kinds(42),
        vec![
            StatusKind::Acknowledged,
            StatusKind::Deploying,
            StatusKind::DeploymentReceived,
            StatusKind::Completed,
        ]
    );
}

#[tokio::test]
async fn kubernetes_observation_degrades_completed_to_running() {
    let h = start_harness_on(EngineType::Kubernetes).await;
    let mut payload = test_payload(42, 1);
    payload.edge_update_id = 9;
    h.client.insert_config(payload);

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();

    // The engine cannot report completion: the one-shot parks as
    // Deployed instead, with a Running report.
    let overview = wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Deployed).await;
    assert_eq!(overview.action, StackAction::Idle);
    assert!(h
        .client
        .report_kinds(42)
        .contains(&StatusKind::Running));
}

#[tokio::test]
async fn observation_error_is_reported() {
    let h = start_harness().await;
    h.client.insert_config(test_payload(42, 1));
    h.deployer.push_status(StatusResult::error("container crashed"));

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();

    wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Error).await;

    let reports = h.client.reports();
    let error_report = reports
        .iter()
        .find(|r| r.stack_id == 42 && r.kind == StatusKind::Error)
        .expect("an error report");
    assert_eq!(error_report.message, "container crashed");
}

#[tokio::test]
async fn pending_preempts_awaiting_observation() {
    let h = start_harness().await;

    // Stack 1 parks awaiting an observation that never resolves.
    h.client.insert_config(test_payload(1, 1));
    h.manager
        .update_stacks_status(snapshot(&[(1, 1)]))
        .await
        .unwrap();
    wait_for_stack(&h.manager, 1, |o| {
        o.status == StackStatus::AwaitingDeployedStatus
    })
    .await;

    // Stack 2 arrives and must still get deployed promptly.
    h.client.insert_config(test_payload(2, 1));
    h.manager
        .update_stacks_status(snapshot(&[(1, 1), (2, 1)]))
        .await
        .unwrap();
    wait_for_stack(&h.manager, 2, |o| {
        o.status == StackStatus::AwaitingDeployedStatus
    })
    .await;
    assert_eq!(h.deployer.call_count("deploy"), 2);
}

#[tokio::test]
async fn relative_path_stack_is_materialized_on_host() {
    let h = start_harness().await;
    let host_root = tempfile::tempdir().unwrap();

    let mut payload = test_payload(42, 1);
    payload.support_relative_path = true;
    payload.filesystem_path = host_root.path().display().to_string();
    h.client.insert_config(payload);
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Running));

    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();
    wait_for_stack(&h.manager, 42, |o| o.status == StackStatus::Deployed).await;

    let host_tree = host_root.path().join("compose/42");
    assert!(host_tree.join("docker-compose.yml").exists());

    // Removal tears the host tree down as well.
    h.manager.update_stacks_status(HashMap::new()).await.unwrap();
    wait_for_stack(&h.manager, 42, |o| {
        o.status == StackStatus::AwaitingRemovedStatus
    })
    .await;
    h.deployer.push_status(StatusResult::ok(WorkloadStatus::Removed));
    wait_for_gone(&h.manager, 42).await;
    assert!(!host_tree.exists());
}

#[tokio::test]
async fn stop_halts_the_worker() {
    let h = start_harness().await;
    h.manager.stop().await;
    // Give the worker a chance to observe the signal and exit.
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.client.insert_config(test_payload(42, 1));
    // Intake is disabled after stop, and no worker picks anything up.
    h.manager
        .update_stacks_status(snapshot(&[(42, 1)]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(h.manager.stack_overview(42).await.is_none());
    assert_eq!(h.deployer.call_count("validate"), 0);
}
