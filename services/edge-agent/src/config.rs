//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use edge_deployer::EngineType;

use crate::stack::IDLE_INTERVAL;

#[derive(Debug, Clone)]
pub struct Config {
    /// Agent identity announced to the control plane and injected into
    /// every stack's deployment environment.
    pub edge_id: String,
    pub control_plane_url: String,
    /// Base directory for manifest trees.
    pub data_dir: PathBuf,
    pub engine: EngineType,
    pub poll_interval: Duration,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let edge_id = std::env::var("EDGE_AGENT_EDGE_ID").unwrap_or_else(|_| "edge".to_string());

        let control_plane_url = std::env::var("EDGE_AGENT_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9443".to_string());

        let data_dir = std::env::var("EDGE_AGENT_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/edge-agent".to_string())
            .into();

        let engine = std::env::var("EDGE_AGENT_ENGINE")
            .unwrap_or_else(|_| "docker".to_string())
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let poll_interval = std::env::var("EDGE_AGENT_POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let log_level = std::env::var("EDGE_AGENT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            edge_id,
            control_plane_url,
            data_dir,
            engine,
            poll_interval,
            log_level,
        })
    }
}

/// Tuning knobs for the stack manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Scheduler granularity while waiting on observations or no work.
    pub idle_interval: Duration,

    /// Deadline for a status wait after deploy or remove.
    pub status_wait_timeout: Duration,

    /// Deadline for the completion peek on an already deployed stack.
    pub completed_peek_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_interval: IDLE_INTERVAL,
            status_wait_timeout: Duration::from_secs(60),
            completed_peek_timeout: Duration::from_secs(1),
        }
    }
}
