//! Stack records tracked by the manager.
//!
//! A record is the manager's observed view of one stack: the manifest
//! metadata received from the control plane plus the lifecycle status,
//! the owed action, and the retry bookkeeping.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{EnvPair, RegistryCredential, StackPayload};

/// Scheduler granularity while waiting on observations or on no work.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(5);

/// Retries that fit in one hour at the idle cadence.
pub const PER_HOUR_RETRIES: u32 = 3600 / 5;

/// Retry for a maximum of one week.
pub const MAX_RETRIES: u32 = PER_HOUR_RETRIES * 24 * 7;

/// Subdirectory of the data dir holding live manifest trees.
pub const STACKS_DIR: &str = "stacks";

/// Subdirectory of a relative-path stack's filesystem path where the
/// manifest tree is materialized for the engine.
pub const COMPOSE_PATH_PREFIX: &str = "compose";

/// Observed lifecycle status of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
    /// Action owed; eligible for scheduling.
    Pending,
    /// Pull or deploy currently running against the deployer.
    Deploying,
    /// Last attempt failed transiently; re-elevated to Pending later.
    Retry,
    /// Deploy succeeded; waiting for the workload to come up.
    AwaitingDeployedStatus,
    /// Workload observed running.
    Deployed,
    /// One-shot workload observed completed.
    Completed,
    /// Remove call in progress.
    Removing,
    /// Remove succeeded; waiting for the workload to disappear.
    AwaitingRemovedStatus,
    /// Terminal failure.
    Error,
}

/// Action owed to a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAction {
    Deploy,
    Update,
    Delete,
    Idle,
}

/// One stack as tracked by the registry.
#[derive(Debug, Clone)]
pub struct EdgeStack {
    pub id: i64,
    pub version: i64,
    pub name: String,
    pub namespace: String,
    pub entry_file_name: String,
    /// Live manifest directory.
    pub file_folder: PathBuf,
    /// Host path root for relative-path stacks.
    pub filesystem_path: PathBuf,
    pub support_relative_path: bool,
    pub pre_pull_image: bool,
    pub re_pull_image: bool,
    pub ready_re_pull_image: bool,
    pub retry_deploy: bool,
    pub env_vars: Vec<EnvPair>,
    pub registry_credentials: Vec<RegistryCredential>,
    /// Opaque rollback tag forwarded in every status report.
    pub rollback_to: Option<i64>,
    /// Non-zero marks a one-shot updater stack.
    pub edge_update_id: i64,

    pub status: StackStatus,
    pub action: StackAction,

    pub pull_count: u32,
    pub pull_finished: bool,
    pub deploy_count: u32,

    /// Bumped on every intake rewrite; a worker write-back carrying a
    /// stale epoch is discarded.
    pub epoch: u64,
}

impl EdgeStack {
    /// Fresh record for a stack the registry has never seen.
    pub fn new(id: i64, version: i64, action: StackAction) -> Self {
        Self {
            id,
            version,
            name: String::new(),
            namespace: String::new(),
            entry_file_name: String::new(),
            file_folder: PathBuf::new(),
            filesystem_path: PathBuf::new(),
            support_relative_path: false,
            pre_pull_image: false,
            re_pull_image: false,
            ready_re_pull_image: false,
            retry_deploy: false,
            env_vars: Vec::new(),
            registry_credentials: Vec::new(),
            rollback_to: None,
            edge_update_id: 0,
            status: StackStatus::Pending,
            action,
            pull_count: 0,
            pull_finished: false,
            deploy_count: 0,
            epoch: 0,
        }
    }

    /// Absorb manifest metadata from a freshly fetched payload.
    pub fn apply_payload(&mut self, payload: &StackPayload, base_dir: &Path) {
        self.name = payload.name.clone();
        self.namespace = payload.namespace.clone();
        self.entry_file_name = payload.entry_file_name.clone();
        self.support_relative_path = payload.support_relative_path;
        self.filesystem_path = PathBuf::from(&payload.filesystem_path);
        self.pre_pull_image = payload.pre_pull_image;
        self.re_pull_image = payload.re_pull_image;
        self.retry_deploy = payload.retry_deploy;
        self.env_vars = payload.env_vars.clone();
        self.registry_credentials = payload.registry_credentials.clone();
        self.rollback_to = payload.rollback_to;
        self.edge_update_id = payload.edge_update_id;
        self.file_folder = stack_file_folder(base_dir, self.id);
    }

    /// Qualified name used on the engine.
    pub fn deploy_name(&self) -> String {
        format!("edge_{}", self.name)
    }

    /// Entry file inside the live manifest tree.
    pub fn entry_file_location(&self) -> PathBuf {
        self.file_folder.join(&self.entry_file_name)
    }

    /// Host-visible manifest directory for relative-path stacks.
    pub fn host_folder(&self) -> Option<PathBuf> {
        if !self.is_relative_path() {
            return None;
        }
        Some(
            self.filesystem_path
                .join(COMPOSE_PATH_PREFIX)
                .join(self.id.to_string()),
        )
    }

    /// Directory the engine resolves the manifest against: the host
    /// copy for relative-path stacks, the live tree otherwise.
    pub fn deploy_folder(&self) -> PathBuf {
        self.host_folder().unwrap_or_else(|| self.file_folder.clone())
    }

    /// Whether any image pulling is requested for this stack.
    pub fn wants_pull(&self) -> bool {
        self.pre_pull_image || self.re_pull_image || self.ready_re_pull_image
    }

    /// Relative-path stacks resolve their manifest tree against a
    /// host-visible filesystem path.
    pub fn is_relative_path(&self) -> bool {
        self.support_relative_path && !self.filesystem_path.as_os_str().is_empty()
    }

    /// Environment pairs in the form the deployer consumes.
    pub fn deployer_env(&self) -> Vec<(String, String)> {
        self.env_vars
            .iter()
            .map(|pair| (pair.name.clone(), pair.value.clone()))
            .collect()
    }
}

/// Live manifest directory for a stack.
pub fn stack_file_folder(base_dir: &Path, id: i64) -> PathBuf {
    base_dir.join(STACKS_DIR).join(id.to_string())
}
