//! Lock set: VPC-scoped locks and the single IPAM writer lock.
//!
//! Targets are always taken in their `Ord` order (VPC locks first, then the
//! IPAM writer) so two tasks can never wait on each other. Locks are released
//! when the [`LockSet`] is dropped, on every exit path.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockTarget {
    Vpc(String),
    IpamWrite,
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockTarget::Vpc(id) => write!(f, "vpc_{id}"),
            LockTarget::IpamWrite => write!(f, "ipam_write"),
        }
    }
}

type Registry = Arc<Mutex<HashMap<LockTarget, Arc<tokio::sync::Mutex<()>>>>>;

/// Drop the registry entry for `target` once nobody holds or waits on it.
fn prune(registry: &Registry, target: &LockTarget) {
    let mut locks = registry.lock().unwrap_or_else(|e| e.into_inner());
    if locks.get(target).is_some_and(|m| Arc::strong_count(m) == 1) {
        locks.remove(target);
    }
}

/// Locks held by one task.
pub struct LockSet {
    held: Vec<(LockTarget, Option<OwnedMutexGuard<()>>)>,
    registry: Option<Registry>,
}

impl fmt::Debug for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.targets()).finish()
    }
}

impl LockSet {
    /// A set that claims `targets` without holding anything.
    pub fn fake(targets: &[LockTarget]) -> Self {
        LockSet {
            held: canonical(targets).into_iter().map(|t| (t, None)).collect(),
            registry: None,
        }
    }

    pub fn has_lock(&self, target: &LockTarget) -> bool {
        self.held.iter().any(|(t, _)| t == target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &LockTarget> {
        self.held.iter().map(|(t, _)| t)
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        for (target, guard) in self.held.drain(..) {
            drop(guard);
            log::debug!("Releasing lock {target}");
            if let Some(registry) = &self.registry {
                prune(registry, &target);
            }
        }
    }
}

fn canonical(targets: &[LockTarget]) -> Vec<LockTarget> {
    let mut sorted = targets.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire every target within `timeout`, or none of them.
    async fn acquire(&self, targets: &[LockTarget], timeout: Duration) -> Result<LockSet>;
}

/// Process-local locks, one tokio mutex per target.
///
/// A target's mutex lives in the registry only while some lock set holds it
/// or some task waits for it.
#[derive(Default)]
pub struct InMemoryLockManager {
    locks: Registry,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, target: &LockTarget) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(target.clone()).or_default().clone()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, targets: &[LockTarget], timeout: Duration) -> Result<LockSet> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut set = LockSet {
            held: Vec::new(),
            registry: Some(self.locks.clone()),
        };
        for target in canonical(targets) {
            let mutex = self.mutex_for(&target);
            match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
                Ok(guard) => {
                    log::debug!("Acquired lock {target}");
                    set.held.push((target, Some(guard)));
                }
                Err(_) => {
                    log::warn!("Timed out waiting for lock {target}");
                    prune(&self.locks, &target);
                    return Err(Error::LockTimeout { target });
                }
            }
        }
        Ok(set)
    }
}
