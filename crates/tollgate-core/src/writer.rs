//! Per-trajectory exclusive writers.
//!
//! Every mutation of a trajectory (adjudicate, suspend, resume, finalize,
//! tag) runs while holding that trajectory's [`WriterGuard`]. Writers on
//! different trajectories never contend. Across processes the store's
//! compare-and-swap writes take over, surfacing as `WriterConflict`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tollgate_state::TrajectoryId;

use crate::config::WriterPolicy;
use crate::error::{HarnessError, HarnessResult};
use crate::metrics::METRICS;

type WriterLock = Arc<tokio::sync::Mutex<()>>;
type LockMap = Arc<Mutex<HashMap<String, WriterLock>>>;

/// Held for the duration of one mutation.
///
/// Dropping the last guard (with nobody waiting) removes the trajectory's
/// entry from the registry.
pub struct WriterGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        // Release the mutex first so its Arc no longer counts as a holder.
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Entries only the map still references have no holder and no waiter.
        // Sweeping all of them also collects entries left by cancelled waiters.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[derive(Default)]
pub struct WriterRegistry {
    policy: WriterPolicy,
    locks: LockMap,
}

impl WriterRegistry {
    pub fn new(policy: WriterPolicy) -> Self {
        Self {
            policy,
            locks: LockMap::default(),
        }
    }

    pub fn policy(&self) -> WriterPolicy {
        self.policy
    }

    fn lock_for(&self, id: &TrajectoryId) -> WriterLock {
        // The map only holds Arcs, so a poisoned guard is still consistent.
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(id.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Become the writer for `id`, waiting or failing per the policy.
    pub async fn acquire(&self, id: &TrajectoryId) -> HarnessResult<WriterGuard> {
        let lock = self.lock_for(id);
        let guard = match self.policy {
            WriterPolicy::Serialize => lock.lock_owned().await,
            WriterPolicy::Reject => lock.try_lock_owned().map_err(|_| {
                METRICS.inc_writer_conflicts();
                HarnessError::WriterConflict {
                    trajectory_id: id.to_string(),
                }
            })?,
        };
        Ok(WriterGuard {
            guard: Some(guard),
            locks: self.locks.clone(),
        })
    }

    /// Number of trajectories with an active or waiting writer.
    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}
