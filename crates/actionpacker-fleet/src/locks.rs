// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-runner mutual exclusion.
//!
//! Every lifecycle operation and every reconciliation step for a runner runs
//! under that runner's lock, so at most one of them is in flight per runner.
//! Unrelated runners never contend.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::record::RunnerId;

/// Guard held for the duration of one operation on a runner.
pub type RunnerGuard = OwnedMutexGuard<()>;

/// Lazily created mutex per runner id.
#[derive(Default)]
pub struct RunnerLocks {
    locks: DashMap<RunnerId, Arc<Mutex<()>>>,
}

impl RunnerLocks {
    /// Empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: RunnerId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    /// Wait up to `timeout` for the runner's lock.
    pub async fn acquire(&self, id: RunnerId, timeout: Duration) -> Result<RunnerGuard> {
        let lock = self.lock_for(id);
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| Error::Timeout(format!("waiting for lock on runner {}", id)))
    }

    /// Take the runner's lock only if nobody holds it.
    pub fn try_acquire(&self, id: RunnerId) -> Option<RunnerGuard> {
        self.lock_for(id).try_lock_owned().ok()
    }

    /// Drop the runner's entry unless someone holds or waits for it.
    pub fn release(&self, id: RunnerId) -> bool {
        self.locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
    }

    /// Drop every entry nobody holds or waits for.
    ///
    /// An idle mutex carries no state; the next caller creates a fresh one.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Number of runners with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no runner has a lock entry.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_runner_is_exclusive() {
        let locks = RunnerLocks::new();
        let id = RunnerId::new();

        let guard = locks.acquire(id, Duration::from_secs(1)).await.unwrap();
        assert!(locks.try_acquire(id).is_none());
        assert!(matches!(
            locks.acquire(id, Duration::from_millis(20)).await,
            Err(Error::Timeout(_))
        ));

        drop(guard);
        assert!(locks.try_acquire(id).is_some());
    }

    #[tokio::test]
    async fn test_release_keeps_held_locks() {
        let locks = RunnerLocks::new();
        let id = RunnerId::new();

        let guard = locks.acquire(id, Duration::from_secs(1)).await.unwrap();
        assert!(!locks.release(id));
        assert_eq!(locks.len(), 1);

        drop(guard);
        assert!(locks.release(id));
        assert!(locks.is_empty());
        assert!(!locks.release(id));
    }

    #[tokio::test]
    async fn test_prune_drops_only_idle_entries() {
        let locks = std::sync::Arc::new(RunnerLocks::new());
        let held = RunnerId::new();
        let idle = RunnerId::new();

        let guard = locks.acquire(held, Duration::from_secs(1)).await.unwrap();
        drop(locks.acquire(idle, Duration::from_secs(1)).await.unwrap());

        // A waiter keeps the entry alive as well
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(held, Duration::from_secs(5)).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        locks.prune();
        assert_eq!(locks.len(), 1);
        assert!(locks.try_acquire(idle).is_some());
        assert_eq!(locks.len(), 2);

        drop(guard);
        waiter.await.unwrap().unwrap();
        locks.prune();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_runners_do_not_contend() {
        let locks = RunnerLocks::new();
        let _a = locks.acquire(RunnerId::new(), Duration::from_secs(1)).await.unwrap();
        let _b = locks.acquire(RunnerId::new(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(locks.len(), 2);
    }
}
