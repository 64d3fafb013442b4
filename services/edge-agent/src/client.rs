//! Control plane API client.
//!
//! Provides the two calls the reconciliation engine needs:
//! - Fetching the full manifest payload for a stack version
//! - Reporting stack status transitions
//!
//! plus the desired-state summary endpoint used by the poll loop.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::Config;

/// Status kinds reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Acknowledged,
    ImagesPulled,
    Deploying,
    DeploymentReceived,
    Error,
    Running,
    Completed,
    Removing,
    Removed,
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusKind::Acknowledged => "acknowledged",
            StatusKind::ImagesPulled => "images_pulled",
            StatusKind::Deploying => "deploying",
            StatusKind::DeploymentReceived => "deployment_received",
            StatusKind::Error => "error",
            StatusKind::Running => "running",
            StatusKind::Completed => "completed",
            StatusKind::Removing => "removing",
            StatusKind::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

/// Name/value environment pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvPair {
    pub name: String,
    pub value: String,
}

/// Registry credential attached to a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub server_url: String,
    pub username: String,
    pub secret: String,
}

/// One file or directory of a manifest tree. File content is
/// base64-encoded on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(default)]
    pub content: String,
    pub is_file: bool,
    #[serde(default)]
    pub permissions: u32,
}

/// Full manifest and metadata for one stack version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackPayload {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub entry_file_name: String,
    #[serde(default)]
    pub dir_entries: Vec<DirEntry>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pre_pull_image: bool,
    #[serde(default)]
    pub re_pull_image: bool,
    #[serde(default)]
    pub ready_re_pull_image: bool,
    #[serde(default)]
    pub retry_deploy: bool,
    #[serde(default)]
    pub support_relative_path: bool,
    #[serde(default)]
    pub filesystem_path: String,
    #[serde(default)]
    pub registry_credentials: Vec<RegistryCredential>,
    #[serde(default)]
    pub env_vars: Vec<EnvPair>,
    #[serde(default)]
    pub rollback_to: Option<i64>,
    #[serde(default)]
    pub edge_update_id: i64,
}

/// Desired-state digest for one stack, as published by the poll
/// endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StackSummary {
    pub version: i64,
    #[serde(default)]
    pub ready_re_pull_image: bool,
}

/// Control plane operations used by the engine.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Current desired set of stacks.
    async fn get_stack_summaries(&self) -> Result<HashMap<i64, StackSummary>>;

    /// Full manifest and metadata for a stack version.
    async fn get_edge_stack_config(&self, id: i64, version: i64) -> Result<StackPayload>;

    /// Idempotent status report.
    async fn set_edge_stack_status(
        &self,
        id: i64,
        kind: StatusKind,
        rollback_to: Option<i64>,
        message: &str,
    ) -> Result<()>;
}

/// HTTP implementation of [`ControlPlaneClient`].
pub struct HttpControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    edge_id: String,
}

impl HttpControlPlaneClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.control_plane_url.clone(),
            edge_id: config.edge_id.clone(),
        })
    }
}

#[derive(Debug, Serialize)]
struct StatusUpdateRequest<'a> {
    status: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    rollback_to: Option<i64>,
    #[serde(skip_serializing_if = "str::is_empty")]
    message: &'a str,
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn get_stack_summaries(&self) -> Result<HashMap<i64, StackSummary>> {
        let url = format!("{}/api/edge/{}/stacks", self.base_url, self.edge_id);
        debug!(url = %url, "fetching stack summaries");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("failed to fetch stack summaries: {status} - {body}");
        }

        Ok(response.json().await?)
    }

    async fn get_edge_stack_config(&self, id: i64, version: i64) -> Result<StackPayload> {
        let url = format!(
            "{}/api/edge/{}/stacks/{id}?version={version}",
            self.base_url, self.edge_id
        );
        debug!(stack_id = id, version, "fetching stack config");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(stack_id = id, status = %status, body = %body, "failed to fetch stack config");
            anyhow::bail!("failed to fetch stack config: {status} - {body}");
        }

        Ok(response.json().await?)
    }

    async fn set_edge_stack_status(
        &self,
        id: i64,
        kind: StatusKind,
        rollback_to: Option<i64>,
        message: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/api/edge/{}/stacks/{id}/status",
            self.base_url, self.edge_id
        );
        debug!(stack_id = id, status = %kind, "reporting stack status");

        let request = StatusUpdateRequest {
            status: kind,
            rollback_to,
            message,
        };

        let response = self.client.put(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("failed to report stack status: {status} - {body}");
        }

        Ok(())
    }
}

/// One recorded status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStatus {
    pub stack_id: i64,
    pub kind: StatusKind,
    pub rollback_to: Option<i64>,
    pub message: String,
}

/// Mock control plane for testing and development. Serves configs from
/// an in-memory map and records every status report.
#[derive(Default)]
pub struct MockControlPlane {
    configs: std::sync::Mutex<HashMap<i64, StackPayload>>,
    reports: std::sync::Mutex<Vec<RecordedStatus>>,
    fail_config: std::sync::atomic::AtomicBool,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_config(&self, payload: StackPayload) {
        self.configs.lock().unwrap().insert(payload.id, payload);
    }

    /// Make every config fetch fail.
    pub fn fail_configs(&self, fail: bool) {
        self.fail_config
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<RecordedStatus> {
        self.reports.lock().unwrap().clone()
    }

    /// Status kinds reported for one stack, in order.
    pub fn report_kinds(&self, stack_id: i64) -> Vec<StatusKind> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.stack_id == stack_id)
            .map(|r| r.kind)
            .collect()
    }
}

#[async_trait]
impl ControlPlaneClient for MockControlPlane {
    async fn get_stack_summaries(&self) -> Result<HashMap<i64, StackSummary>> {
        let configs = self.configs.lock().unwrap();
        Ok(configs
            .iter()
            .map(|(id, payload)| {
                (
                    *id,
                    StackSummary {
                        version: payload.version,
                        ready_re_pull_image: payload.ready_re_pull_image,
                    },
                )
            })
            .collect())
    }

    async fn get_edge_stack_config(&self, id: i64, _version: i64) -> Result<StackPayload> {
        if self.fail_config.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("mock config fetch failure");
        }

        self.configs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no config for stack {id}"))
    }

    async fn set_edge_stack_status(
        &self,
        id: i64,
        kind: StatusKind,
        rollback_to: Option<i64>,
        message: &str,
    ) -> Result<()> {
        self.reports.lock().unwrap().push(RecordedStatus {
            stack_id: id,
            kind,
            rollback_to,
            message: message.to_string(),
        });
        Ok(())
    }
}
