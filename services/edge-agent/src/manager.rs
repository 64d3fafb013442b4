//! The stack manager: registry, intake paths, scheduler and worker.
//!
//! One mutex serializes every read and write of the record set, the
//! worker enable bit and the engine binding. The worker selects a
//! record under the mutex, clones it, releases the mutex across every
//! suspending call, and writes results back under the mutex again. A
//! record's `epoch` is bumped by every intake rewrite; write-backs
//! carrying a stale epoch are discarded so intake always wins.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use edge_deployer::{Deployer, EngineType};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::client::{ControlPlaneClient, EnvPair, StackPayload, StackSummary, StatusKind};
use crate::config::ManagerConfig;
use crate::manifest;
use crate::rewrite;
use crate::stack::{EdgeStack, StackAction, StackStatus};

/// Environment variable carrying the agent identity into every stack's
/// deployment environment.
pub const EDGE_ID_ENV_VAR: &str = "EDGE_ID";

struct Registry {
    stacks: BTreeMap<i64, EdgeStack>,
    engine_type: Option<EngineType>,
    deployer: Option<Arc<dyn Deployer>>,
    enabled: bool,
    stop_tx: Option<watch::Sender<bool>>,
    next_epoch: u64,
}

impl Registry {
    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

/// Condensed view of one record, for observability and tests.
#[derive(Debug, Clone)]
pub struct StackOverview {
    pub id: i64,
    pub version: i64,
    pub status: StackStatus,
    pub action: StackAction,
    pub pull_count: u32,
    pub pull_finished: bool,
    pub deploy_count: u32,
}

/// Outcome of one scheduler query.
enum Selection {
    /// A record owes an action; run it without sleeping first.
    Run(EdgeStack),
    /// A record is waiting on an observation; sleep the idle interval
    /// before acting to throttle the deployer's observation API.
    SleepThenRun(EdgeStack),
    /// Nothing actionable; sleep the idle interval.
    Idle,
}

/// Service reconciling the desired set of stacks against the engine.
#[derive(Clone)]
pub struct StackManager {
    inner: Arc<Mutex<Registry>>,
    client: Arc<dyn ControlPlaneClient>,
    pub(crate) config: ManagerConfig,
    base_dir: PathBuf,
    edge_id: String,
}

impl StackManager {
    pub fn new(
        client: Arc<dyn ControlPlaneClient>,
        base_dir: PathBuf,
        edge_id: String,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                stacks: BTreeMap::new(),
                engine_type: None,
                deployer: None,
                enabled: false,
                stop_tx: None,
                next_epoch: 0,
            })),
            client,
            config,
            base_dir,
            edge_id,
        }
    }

    /// Bind the built-in deployer for `engine`. A change of engine
    /// stops the worker; call [`StackManager::start`] again afterwards.
    pub async fn set_engine_type(&self, engine: EngineType) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.engine_type == Some(engine) {
                return Ok(());
            }
        }

        let deployer = edge_deployer::build_deployer(engine)?;
        self.set_engine_type_with(engine, deployer).await
    }

    /// Bind a caller-supplied deployer for `engine`. Stops the worker.
    pub async fn set_engine_type_with(
        &self,
        engine: EngineType,
        deployer: Arc<dyn Deployer>,
    ) -> Result<()> {
        self.stop().await;

        let mut inner = self.inner.lock().await;
        info!(engine = %engine, "binding stack deployer");
        inner.engine_type = Some(engine);
        inner.deployer = Some(deployer);
        Ok(())
    }

    /// Start the worker task. Idempotent while running.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.stop_tx.is_some() {
            return Ok(());
        }
        anyhow::ensure!(inner.deployer.is_some(), "no engine selected");

        inner.enabled = true;
        let (stop_tx, stop_rx) = watch::channel(false);
        inner.stop_tx = Some(stop_tx);

        let manager = self.clone();
        tokio::spawn(async move { manager.worker_loop(stop_rx).await });

        Ok(())
    }

    /// Signal the worker to exit. The in-flight pass completes first.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(stop_tx) = inner.stop_tx.take() {
            let _ = stop_tx.send(true);
            inner.enabled = false;
        }
    }

    pub async fn stack_overview(&self, id: i64) -> Option<StackOverview> {
        let inner = self.inner.lock().await;
        inner.stacks.get(&id).map(|stack| StackOverview {
            id: stack.id,
            version: stack.version,
            status: stack.status,
            action: stack.action,
            pull_count: stack.pull_count,
            pull_finished: stack.pull_finished,
            deploy_count: stack.deploy_count,
        })
    }

    pub async fn tracked_ids(&self) -> Vec<i64> {
        let inner = self.inner.lock().await;
        inner.stacks.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Poll intake
    // ------------------------------------------------------------------

    /// Merge a freshly received desired-state snapshot into the
    /// registry. Manifest fetching and persistence happen without the
    /// registry mutex; the merge itself is one critical section.
    pub async fn update_stacks_status(&self, snapshot: HashMap<i64, StackSummary>) -> Result<()> {
        let to_fetch = {
            let inner = self.inner.lock().await;
            if !inner.enabled {
                return Ok(());
            }

            let mut to_fetch = Vec::new();
            for (id, summary) in &snapshot {
                let changed = match inner.stacks.get(id) {
                    Some(existing) => needs_update(existing, summary),
                    None => true,
                };
                if changed {
                    to_fetch.push((*id, *summary));
                }
            }
            to_fetch
        };

        let mut prepared = Vec::new();
        for (id, summary) in to_fetch {
            let payload = self.client.get_edge_stack_config(id, summary.version).await?;
            let payload = self.prepare_manifest(payload, true).await?;

            // Acknowledge before the record becomes selectable, so the
            // report stays ahead of the worker's own reports.
            self.report(id, StatusKind::Acknowledged, payload.rollback_to, "")
                .await;
            prepared.push((summary, payload));
        }

        {
            let mut inner = self.inner.lock().await;

            for (summary, payload) in prepared {
                let id = payload.id;
                let mut stack = match inner.stacks.get(&id) {
                    Some(existing) => {
                        // Re-check under the lock: a command intake may
                        // have landed while the manifest was fetched.
                        if !needs_update(existing, &summary) {
                            continue;
                        }

                        debug!(stack_id = id, "marking stack for update");
                        let mut stack = existing.clone();
                        stack.action = StackAction::Update;
                        stack.status = StackStatus::Pending;
                        stack.version = summary.version;
                        stack.pull_count = 0;
                        stack.pull_finished = false;
                        stack.deploy_count = 0;
                        stack
                    }
                    None => {
                        debug!(stack_id = id, "marking stack for deployment");
                        EdgeStack::new(id, summary.version, StackAction::Deploy)
                    }
                };

                stack.apply_payload(&payload, &self.base_dir);
                stack.ready_re_pull_image = summary.ready_re_pull_image;
                stack.env_vars.push(EnvPair {
                    name: EDGE_ID_ENV_VAR.to_string(),
                    value: self.edge_id.clone(),
                });
                stack.epoch = inner.bump_epoch();

                debug!(
                    stack_id = id,
                    stack_name = %stack.name,
                    namespace = %stack.namespace,
                    "stack acknowledged"
                );
                inner.stacks.insert(id, stack);
            }

            // A stored re-pull trigger only fires again after the
            // control plane has cleared it once.
            for (id, summary) in &snapshot {
                if summary.ready_re_pull_image {
                    continue;
                }
                if let Some(stack) = inner.stacks.get_mut(id) {
                    stack.ready_re_pull_image = false;
                }
            }

            self.mark_removed_stacks(&mut inner, &snapshot);
        }

        Ok(())
    }

    /// Mark every record absent from the snapshot for deletion. Runs on
    /// each poll, which is also what re-elevates a record stuck in
    /// `Removing` after a failed remove.
    fn mark_removed_stacks(&self, inner: &mut Registry, snapshot: &HashMap<i64, StackSummary>) {
        let mut bumps = Vec::new();
        for (id, stack) in inner.stacks.iter_mut() {
            if snapshot.contains_key(id) {
                continue;
            }

            let status = if stack.status == StackStatus::AwaitingRemovedStatus {
                stack.status
            } else {
                StackStatus::Pending
            };

            if stack.action == StackAction::Delete && stack.status == status {
                continue;
            }

            debug!(stack_id = stack.id, "marking stack for deletion");
            stack.action = StackAction::Delete;
            stack.status = status;
            bumps.push(*id);
        }

        for id in bumps {
            let epoch = inner.bump_epoch();
            if let Some(stack) = inner.stacks.get_mut(&id) {
                stack.epoch = epoch;
            }
        }
    }

    // ------------------------------------------------------------------
    // Command intake
    // ------------------------------------------------------------------

    /// Imperative deploy, equivalent to a one-entry poll carrying the
    /// manifest inline.
    pub async fn deploy_stack(&self, payload: StackPayload) -> Result<()> {
        self.apply_command(payload, false).await
    }

    /// Imperative delete, equivalent to a one-entry poll that dropped
    /// the stack.
    pub async fn delete_stack(&self, payload: StackPayload) -> Result<()> {
        self.apply_command(payload, true).await
    }

    async fn apply_command(&self, payload: StackPayload, delete: bool) -> Result<()> {
        let payload = if delete {
            payload
        } else {
            self.prepare_manifest(payload, true).await?
        };

        let mut inner = self.inner.lock().await;
        let id = payload.id;

        let mut stack = match inner.stacks.get(&id) {
            Some(existing) => {
                let mut stack = existing.clone();
                if delete {
                    debug!(stack_id = id, "marking stack for removal");
                    stack.action = StackAction::Delete;
                } else {
                    let summary = StackSummary {
                        version: payload.version,
                        ready_re_pull_image: payload.ready_re_pull_image,
                    };
                    if !needs_update(existing, &summary) {
                        return Ok(());
                    }
                    debug!(stack_id = id, "marking stack for update");
                    stack.action = StackAction::Update;
                }
                stack
            }
            None => {
                let action = if delete {
                    debug!(stack_id = id, "marking stack for removal");
                    StackAction::Delete
                } else {
                    debug!(stack_id = id, "marking stack for deployment");
                    StackAction::Deploy
                };
                EdgeStack::new(id, payload.version, action)
            }
        };

        stack.status = StackStatus::Pending;
        stack.version = payload.version;
        stack.pull_count = 0;
        stack.pull_finished = false;
        stack.deploy_count = 0;
        stack.apply_payload(&payload, &self.base_dir);
        stack.ready_re_pull_image = payload.ready_re_pull_image;
        stack.epoch = inner.bump_epoch();
        inner.stacks.insert(id, stack);

        Ok(())
    }

    /// Decode the manifest tree, rewrite the entry file for registry
    /// credentials and persist the live directory. Nothing is committed
    /// to the registry here.
    async fn prepare_manifest(&self, mut payload: StackPayload, persist: bool) -> Result<StackPayload> {
        let engine = {
            let inner = self.inner.lock().await;
            inner.engine_type
        };

        manifest::decode_dir_entries(&mut payload.dir_entries)?;
        if let Some(engine) = engine {
            rewrite::add_registry_to_entry_file(&mut payload, engine)?;
        }

        if persist {
            let folder = crate::stack::stack_file_folder(&self.base_dir, payload.id);
            manifest::persist_dir(&folder, &payload.dir_entries)?;
        }

        Ok(payload)
    }

    // ------------------------------------------------------------------
    // Worker loop and scheduler
    // ------------------------------------------------------------------

    async fn worker_loop(&self, stop_rx: watch::Receiver<bool>) {
        loop {
            {
                let inner = self.inner.lock().await;
                if *stop_rx.borrow() || !inner.enabled {
                    debug!("shutting down stack worker");
                    return;
                }
            }

            self.run_pass().await;
        }
    }

    /// One worker iteration: ask the scheduler, run the applicable
    /// reconciliation pass.
    pub(crate) async fn run_pass(&self) {
        let (deployer, engine) = {
            let inner = self.inner.lock().await;
            match (inner.deployer.clone(), inner.engine_type) {
                (Some(deployer), Some(engine)) => (deployer, engine),
                _ => return,
            }
        };

        if let Some(stack) = self.select_next().await {
            self.perform_action(stack, deployer, engine).await;
        }
    }

    /// Scheduler: pick the next record under the priority ordering.
    /// Sleeps (with the mutex released) where the policy calls for it.
    async fn select_next(&self) -> Option<EdgeStack> {
        let selection = {
            let mut inner = self.inner.lock().await;
            Self::classify(&mut inner)
        };

        match selection {
            Selection::Run(stack) => Some(stack),
            Selection::SleepThenRun(stack) => {
                tokio::time::sleep(self.config.idle_interval).await;
                Some(stack)
            }
            Selection::Idle => {
                tokio::time::sleep(self.config.idle_interval).await;
                None
            }
        }
    }

    fn classify(inner: &mut Registry) -> Selection {
        for stack in inner.stacks.values() {
            if stack.status == StackStatus::Pending {
                return Selection::Run(stack.clone());
            }
        }

        for stack in inner.stacks.values() {
            if stack.status == StackStatus::AwaitingDeployedStatus
                || stack.status == StackStatus::AwaitingRemovedStatus
            {
                return Selection::SleepThenRun(stack.clone());
            }
        }

        // Re-elevate transient failures; the next pass picks them up
        // through the Pending branch after the idle sleep below.
        for stack in inner.stacks.values_mut() {
            if stack.status == StackStatus::Retry {
                debug!(stack_id = stack.id, "retrying stack");
                stack.status = StackStatus::Pending;
            }
        }

        for stack in inner.stacks.values() {
            if stack.status == StackStatus::Deployed {
                return Selection::SleepThenRun(stack.clone());
            }
        }

        Selection::Idle
    }

    // ------------------------------------------------------------------
    // Write-back
    // ------------------------------------------------------------------

    /// Merge the fields the worker owns back into the registry. A
    /// record rewritten by intake since the worker cloned it keeps the
    /// intake's state instead.
    pub(crate) async fn commit(&self, stack: &EdgeStack) {
        let mut inner = self.inner.lock().await;
        match inner.stacks.get_mut(&stack.id) {
            Some(current) if current.epoch == stack.epoch => {
                current.status = stack.status;
                current.action = stack.action;
                current.pull_count = stack.pull_count;
                current.pull_finished = stack.pull_finished;
                current.deploy_count = stack.deploy_count;
            }
            Some(_) => {
                debug!(
                    stack_id = stack.id,
                    "record rewritten during action, discarding result"
                );
            }
            None => {}
        }
    }

    /// Drop the record after the workload was observed removed. Returns
    /// false when intake resurrected the identity in the meantime.
    pub(crate) async fn remove_record(&self, stack: &EdgeStack) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.stacks.get(&stack.id) {
            Some(current) if current.epoch == stack.epoch => {
                inner.stacks.remove(&stack.id);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Status reporter
    // ------------------------------------------------------------------

    /// Fire-and-forget status report; failures are logged and the next
    /// poll re-converges.
    pub(crate) async fn report(
        &self,
        stack_id: i64,
        kind: StatusKind,
        rollback_to: Option<i64>,
        message: &str,
    ) {
        if let Err(e) = self
            .client
            .set_edge_stack_status(stack_id, kind, rollback_to, message)
            .await
        {
            error!(stack_id, status = %kind, error = %e, "unable to update stack status");
        }
    }
}

/// Whether a summary obliges an update of an existing record: a version
/// bump, or the re-pull trigger flipping on.
fn needs_update(existing: &EdgeStack, summary: &StackSummary) -> bool {
    summary.version > existing.version
        || (summary.ready_re_pull_image && !existing.ready_re_pull_image)
}
