//! Task execution.
//!
//! - [`az_expansion`] - replicate a VPC's subnet shape into a new AZ
//! - [`update_networking`] - wire route tables, gateways and the firewall
//! - [`worker`] - fixed-size pool draining the task queue
//!
//! [`perform_task`] is the glue around both handlers: it takes the lock set,
//! opens account access, runs the handler and records the outcome on the task.

pub mod az_expansion;
pub mod update_networking;
pub mod worker;

use crate::cloud::{AccountAccessProvider, CloudAccountAccess};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ipam::IpamClient;
use crate::lock::{LockManager, LockSet, LockTarget};
use crate::models::{Task, TaskConfig, TaskStatus};
use crate::store::ModelsManager;
use std::sync::Arc;
use tokio::sync::watch;

pub use worker::WorkerPool;

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct TaskEnvironment {
    pub config: Config,
    pub models: Arc<dyn ModelsManager>,
    pub ipam: Arc<dyn IpamClient>,
    pub accounts: Arc<dyn AccountAccessProvider>,
    pub locks: Arc<dyn LockManager>,
}

/// Raised on forced shutdown and checked between major steps.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        StopSignal { rx }
    }

    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        StopSignal { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fail with [`Error::Cancelled`] if the signal has been raised.
    pub fn check(&self, step: &str) -> Result<()> {
        if self.is_stopped() {
            Err(Error::Cancelled(format!("stopped before {step}")))
        } else {
            Ok(())
        }
    }

    /// Resolves once the signal is raised.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything a handler may touch while running one task.
pub struct TaskContext<'a> {
    pub task: &'a Task,
    pub config: &'a Config,
    pub models: &'a dyn ModelsManager,
    pub ipam: &'a dyn IpamClient,
    pub access: &'a CloudAccountAccess,
    pub lock_set: &'a LockSet,
    pub stop: &'a StopSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished(TaskStatus),
    /// Locks could not be taken; the task is Queued again.
    Requeue,
}

/// Locks a task must hold before it runs.
pub fn lock_targets(config: &TaskConfig) -> Vec<LockTarget> {
    match config {
        TaskConfig::AddAvailabilityZone(d) => {
            vec![LockTarget::Vpc(d.vpc_id.clone()), LockTarget::IpamWrite]
        }
        TaskConfig::UpdateNetworking(d) => vec![LockTarget::Vpc(d.vpc_id.clone())],
    }
}

async fn run(env: &TaskEnvironment, task: &Task, stop: &StopSignal) -> Result<()> {
    let region = task.config.region();
    let vpc_id = task.config.vpc_id();
    if region.is_empty() || vpc_id.is_empty() {
        return Err(Error::InvalidRequest(
            "task needs a region and a VPC id".to_string(),
        ));
    }

    let lock_set = env
        .locks
        .acquire(&lock_targets(&task.config), env.config.lock_timeout)
        .await?;
    task.set_status(TaskStatus::InProgress);
    task.log(task.config.description());
    stop.check("loading VPC")?;

    let vpc = env.models.get_vpc(region, vpc_id).await?;
    let access = env.accounts.access_account(&vpc.account_id, region).await?;
    let ctx = TaskContext {
        task,
        config: &env.config,
        models: env.models.as_ref(),
        ipam: env.ipam.as_ref(),
        access: &access,
        lock_set: &lock_set,
        stop,
    };
    match &task.config {
        TaskConfig::AddAvailabilityZone(data) => {
            az_expansion::add_availability_zone(&ctx, vpc, data).await
        }
        TaskConfig::UpdateNetworking(data) => {
            update_networking::update_networking(&ctx, vpc, data).await
        }
    }
}

/// Run one task to completion and record its status.
///
/// # Returns
/// * `TaskOutcome::Finished` - the task ended Successful or Failed
/// * `TaskOutcome::Requeue` - locks timed out, nothing was mutated
pub async fn perform_task(env: &TaskEnvironment, task: &Task, stop: &StopSignal) -> TaskOutcome {
    match run(env, task, stop).await {
        Ok(()) => {
            task.log("Done");
            task.set_status(TaskStatus::Successful);
            TaskOutcome::Finished(TaskStatus::Successful)
        }
        Err(e) if e.is_retryable() => {
            log::warn!("Task {} returned to queue: {e}", task.id);
            task.set_status(TaskStatus::Queued);
            TaskOutcome::Requeue
        }
        Err(e) => {
            log::error!("Task {} failed: {e}", task.id);
            task.log(format!("Error: {e}"));
            task.set_status(TaskStatus::Failed);
            TaskOutcome::Finished(TaskStatus::Failed)
        }
    }
}
