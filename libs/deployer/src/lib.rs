//! Engine-polymorphic stack deployment.
//!
//! A *stack* is a named, versioned bundle of manifests deployed as one
//! unit on a single orchestration engine. This library defines the
//! capability set an engine must provide to the edge agent:
//!
//! - `validate`: fail fast on malformed manifests
//! - `pull`: idempotent image acquisition
//! - `deploy`: idempotent convergence to the manifest
//! - `remove`: idempotent tear-down
//! - `wait_for_status`: observe the workload until a required status is
//!   reached or a deadline expires
//!
//! A `docker compose` CLI implementation lives in [`compose`]; a
//! scriptable mock for tests and development lives in [`mock`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod compose;
pub mod mock;

pub use compose::DockerComposeDeployer;
pub use mock::MockDeployer;

/// Errors from deployer operations.
#[derive(Debug, Error)]
pub enum DeployerError {
    /// Manifest failed engine-side validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An engine CLI invocation exited non-zero.
    #[error("{program} failed: {detail}")]
    CommandFailed { program: String, detail: String },

    /// The requested engine has no built-in deployer.
    #[error("unsupported engine: {0}")]
    UnsupportedEngine(EngineType),

    /// I/O error spawning or talking to the engine.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The target orchestrator that executes a stack's workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    DockerStandalone,
    DockerSwarm,
    Kubernetes,
    Nomad,
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineType::DockerStandalone => write!(f, "docker_standalone"),
            EngineType::DockerSwarm => write!(f, "docker_swarm"),
            EngineType::Kubernetes => write!(f, "kubernetes"),
            EngineType::Nomad => write!(f, "nomad"),
        }
    }
}

impl std::str::FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" | "docker_standalone" => Ok(EngineType::DockerStandalone),
            "swarm" | "docker_swarm" => Ok(EngineType::DockerSwarm),
            "kubernetes" => Ok(EngineType::Kubernetes),
            "nomad" => Ok(EngineType::Nomad),
            other => Err(format!("unknown engine type: {other}")),
        }
    }
}

/// Observed workload status for a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    /// All workloads are up and running.
    Running,
    /// All workloads ran to completion successfully.
    Completed,
    /// No workloads remain on the engine.
    Removed,
    /// At least one workload failed.
    Error,
    /// Not enough information to classify.
    Unknown,
}

impl std::fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadStatus::Running => write!(f, "running"),
            WorkloadStatus::Completed => write!(f, "completed"),
            WorkloadStatus::Removed => write!(f, "removed"),
            WorkloadStatus::Error => write!(f, "error"),
            WorkloadStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of a status observation.
#[derive(Debug, Clone)]
pub struct StatusResult {
    pub status: WorkloadStatus,
    /// Engine-side failure detail, set iff `status == Error`.
    pub error_message: Option<String>,
}

impl StatusResult {
    pub fn ok(status: WorkloadStatus) -> Self {
        Self {
            status,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: WorkloadStatus::Error,
            error_message: Some(message.into()),
        }
    }
}

/// Common options passed to every deployer operation.
#[derive(Debug, Clone, Default)]
pub struct DeployerOptions {
    /// Engine namespace, where the engine has such a concept.
    pub namespace: Option<String>,

    /// Directory the manifest files are resolved against.
    pub working_dir: PathBuf,

    /// Environment pairs made visible to the manifest interpolation.
    pub env: Vec<(String, String)>,
}

/// Engine-specific capability set used to realize a stack.
///
/// All operations are idempotent. Implementations must not retain
/// state between calls beyond what the engine itself holds.
#[async_trait]
pub trait Deployer: Send + Sync + std::fmt::Debug {
    /// Validate manifest files without touching the engine state.
    async fn validate(
        &self,
        stack_name: &str,
        files: &[PathBuf],
        opts: &DeployerOptions,
    ) -> Result<(), DeployerError>;

    /// Acquire the images the manifests reference.
    async fn pull(
        &self,
        stack_name: &str,
        files: &[PathBuf],
        opts: &DeployerOptions,
    ) -> Result<(), DeployerError>;

    /// Converge the engine to the manifests.
    async fn deploy(
        &self,
        stack_name: &str,
        files: &[PathBuf],
        opts: &DeployerOptions,
    ) -> Result<(), DeployerError>;

    /// Tear the stack down.
    async fn remove(
        &self,
        stack_name: &str,
        files: &[PathBuf],
        opts: &DeployerOptions,
    ) -> Result<(), DeployerError>;

    /// Observe the stack until `required` is reached or `deadline`
    /// expires, then return the last observed status. A deadline expiry
    /// is not an error: the result carries whatever was last seen.
    async fn wait_for_status(
        &self,
        stack_name: &str,
        required: WorkloadStatus,
        deadline: Duration,
    ) -> StatusResult;
}

/// Build the built-in deployer for an engine type.
///
/// Docker standalone ships in-tree; the remaining engines are provided
/// by external integrations and yield [`DeployerError::UnsupportedEngine`]
/// here.
pub fn build_deployer(
    engine: EngineType,
) -> Result<std::sync::Arc<dyn Deployer>, DeployerError> {
    match engine {
        EngineType::DockerStandalone => Ok(std::sync::Arc::new(DockerComposeDeployer::new())),
        other => Err(DeployerError::UnsupportedEngine(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_type_from_str() {
        assert_eq!(
            "docker".parse::<EngineType>().unwrap(),
            EngineType::DockerStandalone
        );
        assert_eq!(
            "docker_swarm".parse::<EngineType>().unwrap(),
            EngineType::DockerSwarm
        );
        assert_eq!(
            "kubernetes".parse::<EngineType>().unwrap(),
            EngineType::Kubernetes
        );
        assert!("podman".parse::<EngineType>().is_err());
    }

    #[test]
    fn engine_type_serialization() {
        let json = serde_json::to_string(&EngineType::DockerStandalone).unwrap();
        assert_eq!(json, "\"docker_standalone\"");
    }

    #[test]
    fn build_deployer_unsupported() {
        let err = build_deployer(EngineType::Nomad).unwrap_err();
        assert!(matches!(err, DeployerError::UnsupportedEngine(EngineType::Nomad)));
    }

    #[test]
    fn status_result_helpers() {
        let ok = StatusResult::ok(WorkloadStatus::Running);
        assert_eq!(ok.status, WorkloadStatus::Running);
        assert!(ok.error_message.is_none());

        let err = StatusResult::error("boom");
        assert_eq!(err.status, WorkloadStatus::Error);
        assert_eq!(err.error_message.as_deref(), Some("boom"));
    }
}
