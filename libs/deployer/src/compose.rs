//! `docker compose` CLI deployer.
//!
//! Shells out to the compose plugin for each operation. Status
//! observation polls `docker compose ps` and classifies the aggregate
//! container state.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{Deployer, DeployerError, DeployerOptions, StatusResult, WorkloadStatus};

/// Interval between `ps` polls while waiting on a status.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Deployer backed by the `docker compose` CLI.
#[derive(Debug)]
pub struct DockerComposeDeployer {
    binary: String,
}

impl DockerComposeDeployer {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    fn base_command(&self, stack_name: &str, files: &[PathBuf], opts: &DeployerOptions) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("compose").arg("-p").arg(stack_name);
        for file in files {
            cmd.arg("-f").arg(file);
        }
        if !opts.working_dir.as_os_str().is_empty() {
            cmd.current_dir(&opts.working_dir);
        }
        for (name, value) in &opts.env {
            cmd.env(name, value);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(&self, mut cmd: Command, context: &str) -> Result<(), DeployerError> {
        let output = cmd.output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(DeployerError::CommandFailed {
            program: format!("docker compose {context}"),
            detail: stderr.trim().to_string(),
        })
    }

    /// Classify the aggregate state of a compose project.
    async fn observe(&self, stack_name: &str, opts: &DeployerOptions) -> StatusResult {
        let mut cmd = self.base_command(stack_name, &[], opts);
        cmd.args(["ps", "--all", "--format", "json"]);

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => return StatusResult::error(format!("docker compose ps: {e}")),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return StatusResult::error(format!("docker compose ps: {}", stderr.trim()));
        }

        // One JSON object per line since compose v2.21.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let containers: Vec<ComposeContainer> = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        classify(&containers)
    }
}

impl Default for DockerComposeDeployer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ComposeContainer {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: i64,
}

fn classify(containers: &[ComposeContainer]) -> StatusResult {
    if containers.is_empty() {
        return StatusResult::ok(WorkloadStatus::Removed);
    }

    let mut all_running = true;
    let mut all_exited_zero = true;

    for container in containers {
        match container.state.as_str() {
            "running" => all_exited_zero = false,
            "exited" if container.exit_code == 0 => all_running = false,
            "exited" | "dead" => {
                return StatusResult::error(format!(
                    "container {} exited with code {}",
                    container.name, container.exit_code
                ));
            }
            _ => {
                all_running = false;
                all_exited_zero = false;
            }
        }
    }

    if all_running {
        StatusResult::ok(WorkloadStatus::Running)
    } else if all_exited_zero {
        StatusResult::ok(WorkloadStatus::Completed)
    } else {
        StatusResult::ok(WorkloadStatus::Unknown)
    }
}

#[async_trait]
impl Deployer for DockerComposeDeployer {
    async fn validate(
        &self,
        stack_name: &str,
        files: &[PathBuf],
        opts: &DeployerOptions,
    ) -> Result<(), DeployerError> {
        debug!(stack_name, "validating compose stack");

        let mut cmd = self.base_command(stack_name, files, opts);
        cmd.args(["config", "--quiet"]);
        self.run(cmd, "config")
            .await
            .map_err(|e| DeployerError::Validation(e.to_string()))
    }

    async fn pull(
        &self,
        stack_name: &str,
        files: &[PathBuf],
        opts: &DeployerOptions,
    ) -> Result<(), DeployerError> {
        debug!(stack_name, "pulling compose stack images");

        let mut cmd = self.base_command(stack_name, files, opts);
        cmd.arg("pull");
        self.run(cmd, "pull").await
    }

    async fn deploy(
        &self,
        stack_name: &str,
        files: &[PathBuf],
        opts: &DeployerOptions,
    ) -> Result<(), DeployerError> {
        debug!(stack_name, "deploying compose stack");

        let mut cmd = self.base_command(stack_name, files, opts);
        cmd.args(["up", "-d", "--remove-orphans"]);
        self.run(cmd, "up").await
    }

    async fn remove(
        &self,
        stack_name: &str,
        files: &[PathBuf],
        opts: &DeployerOptions,
    ) -> Result<(), DeployerError> {
        debug!(stack_name, "removing compose stack");

        let mut cmd = self.base_command(stack_name, files, opts);
        cmd.args(["down", "--remove-orphans"]);
        self.run(cmd, "down").await
    }

    async fn wait_for_status(
        &self,
        stack_name: &str,
        required: WorkloadStatus,
        deadline: Duration,
    ) -> StatusResult {
        let started = tokio::time::Instant::now();

        loop {
            let last = self.observe(stack_name, &DeployerOptions::default()).await;
            if last.status == required || last.status == WorkloadStatus::Error {
                return last;
            }

            if started.elapsed() + STATUS_POLL_INTERVAL > deadline {
                warn!(
                    stack_name,
                    required = %required,
                    observed = %last.status,
                    "status wait deadline expired"
                );
                return last;
            }

            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }
}
