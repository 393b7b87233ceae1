//! Per-resource mutual exclusion with ttl-based expiry.
//!
//! A lock is live iff `now - acquired_at < ttl`. Expiry is never stored as
//! an absolute deadline; it is recomputed on every check, so a lock whose
//! ttl has elapsed is treated as absent even before [`LockManager::sweep`]
//! physically removes it.
//!
//! ```text
//!  acquire(R, A) ──► [R: A, t0, ttl] ──release(R, A)──► (free)
//!                         │
//!                         └── now - t0 >= ttl ──► expired ──sweep──► (free)
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{duration_ms, Millis};
use crate::{ActorId, ResourceId};

/// A mutual-exclusion claim over one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource: ResourceId,
    pub holder: ActorId,
    pub acquired_at: Millis,
    pub ttl: Duration,
}

impl ResourceLock {
    fn elapsed(&self, now: Millis) -> Millis {
        now.saturating_sub(self.acquired_at)
    }

    /// Whether the lock is still in force at `now`.
    pub fn is_live(&self, now: Millis) -> bool {
        self.elapsed(now) < duration_ms(self.ttl)
    }

    /// Time left before expiry, clamped at zero.
    pub fn remaining(&self, now: Millis) -> Duration {
        let left = duration_ms(self.ttl).saturating_sub(self.elapsed(now));
        Duration::from_millis(left)
    }
}

/// Successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    pub resource: ResourceId,
    pub holder: ActorId,
    pub acquired_at: Millis,
    pub ttl: Duration,
    /// The holder already had the lock and refreshed it.
    pub renewed: bool,
}

/// Contention result: someone else holds a live lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDenied {
    pub resource: ResourceId,
    pub holder: ActorId,
    pub remaining: Duration,
}

impl LockDenied {
    /// Remaining wait in whole seconds, rounded up.
    pub fn wait_secs(&self) -> u64 {
        let ms = duration_ms(self.remaining);
        ms.div_ceil(1000)
    }
}

/// Table of resource locks.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: HashMap<ResourceId, ResourceLock>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take (or refresh) the lock on `resource` for `actor`.
    ///
    /// Succeeds when there is no live lock or when `actor` already holds it.
    /// A denial leaves the table untouched.
    pub fn acquire(
        &mut self,
        resource: &str,
        actor: &str,
        ttl: Duration,
        now: Millis,
    ) -> Result<LockGrant, LockDenied> {
        let mut renewed = false;
        if let Some(existing) = self.locks.get(resource) {
            if existing.is_live(now) {
                if existing.holder != actor {
                    log::debug!(
                        "Lock on {resource} denied to {actor}: held by {}",
                        existing.holder
                    );
                    return Err(LockDenied {
                        resource: resource.to_string(),
                        holder: existing.holder.clone(),
                        remaining: existing.remaining(now),
                    });
                }
                renewed = true;
            }
        }

        self.locks.insert(
            resource.to_string(),
            ResourceLock {
                resource: resource.to_string(),
                holder: actor.to_string(),
                acquired_at: now,
                ttl,
            },
        );
        log::info!("{actor} acquired lock on {resource} for {}ms", ttl.as_millis());

        Ok(LockGrant {
            resource: resource.to_string(),
            holder: actor.to_string(),
            acquired_at: now,
            ttl,
            renewed,
        })
    }

    /// Release `resource` if `actor` is the recorded holder.
    pub fn release(&mut self, resource: &str, actor: &str) -> bool {
        match self.locks.get(resource) {
            Some(lock) if lock.holder == actor => {
                self.locks.remove(resource);
                log::info!("{actor} released lock on {resource}");
                true
            }
            _ => false,
        }
    }

    /// Remove every expired lock, returning the freed resource ids.
    pub fn sweep(&mut self, now: Millis) -> Vec<ResourceId> {
        let expired: Vec<ResourceId> = self
            .locks
            .values()
            .filter(|lock| !lock.is_live(now))
            .map(|lock| lock.resource.clone())
            .collect();
        for resource in &expired {
            self.locks.remove(resource);
            log::debug!("Swept expired lock on {resource}");
        }
        expired
    }

    /// The live lock on `resource`, if any.
    pub fn holder(&self, resource: &str, now: Millis) -> Option<&ResourceLock> {
        self.locks.get(resource).filter(|lock| lock.is_live(now))
    }

    /// All live locks, ordered by resource id.
    pub fn live_locks(&self, now: Millis) -> Vec<ResourceLock> {
        let mut live: Vec<ResourceLock> = self
            .locks
            .values()
            .filter(|lock| lock.is_live(now))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.resource.cmp(&b.resource));
        live
    }

    /// Number of recorded locks, expired-but-unswept included.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_second_actor_denied_before_expiry() {
        let mut locks = LockManager::new();
        locks.acquire("req-1", "alice", TTL, 1_000).unwrap();

        let denied = locks.acquire("req-1", "bob", TTL, 11_000).unwrap_err();
        assert_eq!(denied.holder, "alice");
        assert_eq!(denied.remaining, Duration::from_secs(20));
        assert_eq!(denied.wait_secs(), 20);

        // denial did not disturb the original lock
        let held = locks.holder("req-1", 11_000).unwrap();
        assert_eq!(held.holder, "alice");
        assert_eq!(held.acquired_at, 1_000);
    }

    #[test]
    fn test_wait_secs_rounds_up() {
        let mut locks = LockManager::new();
        locks.acquire("r", "alice", TTL, 0).unwrap();
        let denied = locks.acquire("r", "bob", TTL, 29_001).unwrap_err();
        assert_eq!(denied.remaining, Duration::from_millis(999));
        assert_eq!(denied.wait_secs(), 1);
    }

    #[test]
    fn test_reentry_refreshes_acquired_at() {
        let mut locks = LockManager::new();
        let first = locks.acquire("r", "alice", TTL, 0).unwrap();
        assert!(!first.renewed);

        let again = locks.acquire("r", "alice", TTL, 25_000).unwrap();
        assert!(again.renewed);
        assert_eq!(locks.holder("r", 50_000).unwrap().acquired_at, 25_000);
    }

    #[test]
    fn test_release_then_other_actor_acquires() {
        let mut locks = LockManager::new();
        locks.acquire("r", "alice", TTL, 0).unwrap();
        assert!(locks.release("r", "alice"));
        assert!(locks.acquire("r", "bob", TTL, 1).is_ok());
    }

    #[test]
    fn test_release_by_non_holder_is_noop() {
        let mut locks = LockManager::new();
        locks.acquire("r", "alice", TTL, 0).unwrap();
        assert!(!locks.release("r", "bob"));
        assert!(!locks.release("missing", "alice"));
        assert_eq!(locks.holder("r", 1).unwrap().holder, "alice");
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let mut locks = LockManager::new();
        locks.acquire("r", "alice", TTL, 0).unwrap();
        // exactly ttl elapsed: expired
        let grant = locks.acquire("r", "bob", TTL, 30_000).unwrap();
        assert_eq!(grant.holder, "bob");
        assert!(!grant.renewed);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let mut locks = LockManager::new();
        locks.acquire("old", "alice", TTL, 0).unwrap();
        locks.acquire("fresh", "bob", TTL, 20_000).unwrap();

        let freed = locks.sweep(30_000);
        assert_eq!(freed, vec!["old".to_string()]);
        assert_eq!(locks.len(), 1);
        assert!(locks.holder("fresh", 30_000).is_some());
    }

    #[test]
    fn test_expired_lock_not_reported_live() {
        let mut locks = LockManager::new();
        locks.acquire("r", "alice", Duration::from_millis(10), 0).unwrap();
        assert!(locks.holder("r", 10).is_none());
        assert!(locks.live_locks(10).is_empty());
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_clock_going_backwards_keeps_lock_live() {
        let mut locks = LockManager::new();
        locks.acquire("r", "alice", TTL, 5_000).unwrap();
        let denied = locks.acquire("r", "bob", TTL, 4_000).unwrap_err();
        assert_eq!(denied.remaining, TTL);
    }
}
