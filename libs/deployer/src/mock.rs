//! Scriptable mock deployer for testing and development.
//!
//! Failures are armed per operation; status observations are served
//! from a queue. Every call is recorded so tests can assert on ordering
//! and on the working directory an operation ran against.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{Deployer, DeployerError, DeployerOptions, StatusResult, WorkloadStatus};

/// Mock deployer. All operations succeed unless armed otherwise.
#[derive(Default, Debug)]
pub struct MockDeployer {
    fail_validate: AtomicBool,
    fail_deploy: AtomicBool,
    /// Remaining pull calls that fail before pulls start succeeding.
    pull_failures: AtomicUsize,
    /// Remaining remove calls that fail before removes start succeeding.
    remove_failures: AtomicUsize,
    statuses: Mutex<VecDeque<StatusResult>>,
    calls: Mutex<Vec<String>>,
}

impl MockDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `validate` call fail.
    pub fn fail_validate(&self) {
        self.fail_validate.store(true, Ordering::SeqCst);
    }

    /// Make every `deploy` call fail.
    pub fn fail_deploy(&self) {
        self.fail_deploy.store(true, Ordering::SeqCst);
    }

    /// Make the next `count` pull calls fail.
    pub fn fail_pulls(&self, count: usize) {
        self.pull_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` remove calls fail.
    pub fn fail_removes(&self, count: usize) {
        self.remove_failures.store(count, Ordering::SeqCst);
    }

    /// Queue a status observation; served in FIFO order. An empty queue
    /// observes `Unknown`.
    pub fn push_status(&self, result: StatusResult) {
        self.statuses.lock().unwrap().push_back(result);
    }

    /// All recorded calls, in order, as `"<op>:<stack>"` entries
    /// (`remove` records the working directory instead of the stack).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    fn record(&self, entry: String) {
        debug!(call = %entry, "[MOCK] deployer call");
        self.calls.lock().unwrap().push(entry);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Deployer for MockDeployer {
    async fn validate(
        &self,
        stack_name: &str,
        _files: &[PathBuf],
        _opts: &DeployerOptions,
    ) -> Result<(), DeployerError> {
        self.record(format!("validate:{stack_name}"));

        if self.fail_validate.load(Ordering::SeqCst) {
            return Err(DeployerError::Validation("mock validation failure".into()));
        }
        Ok(())
    }

    async fn pull(
        &self,
        stack_name: &str,
        _files: &[PathBuf],
        _opts: &DeployerOptions,
    ) -> Result<(), DeployerError> {
        self.record(format!("pull:{stack_name}"));

        if Self::take_failure(&self.pull_failures) {
            return Err(DeployerError::CommandFailed {
                program: "mock pull".into(),
                detail: "armed pull failure".into(),
            });
        }
        Ok(())
    }

    async fn deploy(
        &self,
        stack_name: &str,
        _files: &[PathBuf],
        _opts: &DeployerOptions,
    ) -> Result<(), DeployerError> {
        self.record(format!("deploy:{stack_name}"));

        if self.fail_deploy.load(Ordering::SeqCst) {
            return Err(DeployerError::CommandFailed {
                program: "mock deploy".into(),
                detail: "armed deploy failure".into(),
            });
        }
        Ok(())
    }

    async fn remove(
        &self,
        _stack_name: &str,
        _files: &[PathBuf],
        opts: &DeployerOptions,
    ) -> Result<(), DeployerError> {
        self.record(format!("remove:{}", opts.working_dir.display()));

        if Self::take_failure(&self.remove_failures) {
            return Err(DeployerError::CommandFailed {
                program: "mock remove".into(),
                detail: "armed remove failure".into(),
            });
        }
        Ok(())
    }

    async fn wait_for_status(
        &self,
        stack_name: &str,
        required: WorkloadStatus,
        _deadline: Duration,
    ) -> StatusResult {
        self.record(format!("wait:{stack_name}:{required}"));

        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| StatusResult::ok(WorkloadStatus::Unknown))
    }
}
