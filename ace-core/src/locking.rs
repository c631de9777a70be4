//! Named exclusive leases with deadlock detection.
//!
//! Lock identity is a plain string (`root:<uuid>` by convention) and owners
//! are opaque strings. Leases expire into an unlocked state, owners may
//! re-enter and renew, and acquisition that would form a wait-for cycle
//! fails with [`CoreError::Deadlock`] so the caller can release what it
//! holds and retry with backoff.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

const WAIT_SLICE: Duration = Duration::from_millis(100);
const CYCLE_SCAN_LIMIT: usize = 64;

#[derive(Debug, Clone)]
struct LockState {
    owner: String,
    expires_at: DateTime<Utc>,
    // re-entrant hold count for the owning owner string
    count: u32,
}

impl LockState {
    fn new(owner: &str, lease_secs: u64) -> Self {
        Self {
            owner: owner.to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(lease_secs as i64),
            count: 1,
        }
    }
}

/// Lease-based lock manager shared by every request processor.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<String, LockState>,
    // owner -> lock name that owner is currently blocked on
    waiters: DashMap<String, String>,
    released: Notify,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            waiters: DashMap::new(),
            released: Notify::new(),
        }
    }

    /// Acquire `name` for `owner`, waiting up to `wait_secs`.
    ///
    /// Returns `Ok(true)` on acquisition, `Ok(false)` on wait timeout, and
    /// `Err(Deadlock)` when granting the wait would form a cycle among
    /// current holders and pending acquirers.
    pub async fn acquire(
        &self,
        name: &str,
        owner: &str,
        lease_secs: u64,
        wait_secs: u64,
    ) -> CoreResult<bool> {
        if self.try_acquire(name, owner, lease_secs) {
            return Ok(true);
        }

        let deadline = Utc::now() + ChronoDuration::seconds(wait_secs as i64);
        self.waiters.insert(owner.to_string(), name.to_string());

        let result = loop {
            let notified = self.released.notified();

            if self.try_acquire(name, owner, lease_secs) {
                break Ok(true);
            }

            if self.would_deadlock(name, owner) {
                debug!(lock = name, owner, "acquisition would form a wait-for cycle");
                break Err(CoreError::deadlock(name, owner));
            }

            let remaining = deadline - Utc::now();
            if remaining <= ChronoDuration::zero() {
                break Ok(false);
            }

            // cap the wait so expired leases are reclaimed promptly
            let slice = remaining
                .to_std()
                .map_or(WAIT_SLICE, |r| r.min(WAIT_SLICE));
            let _ = tokio::time::timeout(slice, notified).await;
        };

        self.waiters.remove(owner);
        result
    }

    /// Non-blocking acquisition. Re-entrant for the current owner; an
    /// expired lease is reclaimed in place.
    pub fn try_acquire(&self, name: &str, owner: &str, lease_secs: u64) -> bool {
        let now = Utc::now();
        match self.locks.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(LockState::new(owner, lease_secs));
                true
            }
            Entry::Occupied(mut slot) => {
                let state = slot.get_mut();
                if state.owner == owner {
                    state.count += 1;
                    state.expires_at = now + ChronoDuration::seconds(lease_secs as i64);
                    true
                } else if now >= state.expires_at {
                    debug!(lock = name, expired_owner = %state.owner, "reclaiming expired lease");
                    *state = LockState::new(owner, lease_secs);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Release one hold on `name`. A no-op unless `owner` holds the lock.
    pub fn release(&self, name: &str, owner: &str) -> bool {
        let released = match self.locks.entry(name.to_string()) {
            Entry::Vacant(_) => false,
            Entry::Occupied(mut slot) => {
                let state = slot.get_mut();
                if state.owner != owner {
                    false
                } else if state.count > 1 {
                    state.count -= 1;
                    true
                } else {
                    slot.remove();
                    true
                }
            }
        };

        if released {
            self.released.notify_waiters();
        }
        released
    }

    /// Extend the lease on a held lock.
    pub fn renew(&self, name: &str, owner: &str, lease_secs: u64) -> bool {
        match self.locks.get_mut(name) {
            Some(mut state) if state.owner == owner => {
                state.expires_at = Utc::now() + ChronoDuration::seconds(lease_secs as i64);
                true
            }
            _ => false,
        }
    }

    /// Current holder of `name`, if the lease is live.
    #[must_use]
    pub fn holder(&self, name: &str) -> Option<String> {
        self.locks.get(name).and_then(|state| {
            if Utc::now() >= state.expires_at {
                None
            } else {
                Some(state.owner.clone())
            }
        })
    }

    /// Walk the wait-for chain starting at the holder of `name`. A path
    /// leading back to `owner` means granting this wait would close a
    /// cycle. Every waiter in the cycle observes it, so exactly one is
    /// picked as the victim: the owner sorting last. The rest keep waiting
    /// and unblock once the victim releases what it holds.
    fn would_deadlock(&self, name: &str, owner: &str) -> bool {
        let mut participants = vec![owner.to_string()];
        let mut current = match self.locks.get(name) {
            Some(state) => state.owner.clone(),
            None => return false,
        };

        for _ in 0..CYCLE_SCAN_LIMIT {
            if current == owner {
                return participants.iter().max().map(String::as_str) == Some(owner);
            }
            participants.push(current.clone());
            let next_lock = match self.waiters.get(&current) {
                Some(blocked_on) => blocked_on.clone(),
                None => return false,
            };
            current = match self.locks.get(&next_lock) {
                Some(state) => state.owner.clone(),
                None => return false,
            };
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn exclusive_and_reentrant() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("root:a", "owner-1", 30));
        assert!(locks.try_acquire("root:a", "owner-1", 30), "re-entrant");
        assert!(!locks.try_acquire("root:a", "owner-2", 30));

        assert!(locks.release("root:a", "owner-1"));
        assert!(!locks.try_acquire("root:a", "owner-2", 30), "still held once");
        assert!(locks.release("root:a", "owner-1"));
        assert!(locks.try_acquire("root:a", "owner-2", 30));
    }

    #[tokio::test]
    async fn release_is_noop_for_non_owner() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("root:a", "owner-1", 30));
        assert!(!locks.release("root:a", "owner-2"));
        assert_eq!(locks.holder("root:a"), Some("owner-1".to_string()));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("root:a", "owner-1", 0));
        assert!(locks.try_acquire("root:a", "owner-2", 30));
        assert_eq!(locks.holder("root:a"), Some("owner-2".to_string()));
    }

    #[tokio::test]
    async fn wait_timeout_returns_false() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("root:a", "owner-1", 600));
        let acquired = locks.acquire("root:a", "owner-2", 30, 0).await.unwrap();
        assert!(!acquired);
    }

    #[tokio::test]
    async fn opposite_order_acquisition_detects_deadlock() {
        let locks = Arc::new(LockManager::new());

        assert!(locks.try_acquire("root:a", "worker-1", 600));
        assert!(locks.try_acquire("root:b", "worker-2", 600));

        let locks_1 = Arc::clone(&locks);
        let first = tokio::spawn(async move {
            // worker-1 blocks on root:b
            locks_1.acquire("root:b", "worker-1", 600, 10).await
        });

        // give worker-1 a moment to register as a waiter
        tokio::time::sleep(Duration::from_millis(50)).await;

        // worker-2 closing the cycle must fail with a deadlock signal
        let second = locks.acquire("root:a", "worker-2", 600, 10).await;
        assert!(matches!(second, Err(CoreError::Deadlock { .. })));

        // per convention worker-2 releases what it holds, unblocking worker-1
        locks.release("root:b", "worker-2");
        let first = first.await.unwrap().unwrap();
        assert!(first, "worker-1 completes after worker-2 backs off");
    }
}
