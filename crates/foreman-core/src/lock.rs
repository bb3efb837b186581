//! Master-scoped and worker-scoped locks with counting/exclusive
//! modes and a strict FIFO waiter queue.
//!
//! The contract is deliberately narrow: `claim` is
//! non-blocking and may fail; `wait_until_maybe_available` only
//! promises the lock *might* now be claimable, so callers loop
//! `wait_until_maybe_available` -> `claim` until `claim` succeeds.
//! Because every operation here is serialized through one mutex and a
//! woken waiter is the only task that acts on a lock's state before
//! the next scheduling point, that loop always makes progress in
//! practice -- no external actor can steal a slot out from under a
//! waiter that was just woken for it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use foreman_types::{AccessMode, LockId};
use tokio::sync::{Mutex, Notify};

use crate::error::LockError;

pub type Owner = u64;

struct Waiter {
    owner: Owner,
    access: AccessMode,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct LockState {
    exclusive_holder: Option<Owner>,
    counting_holders: Vec<Owner>,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn is_available(&self, access: AccessMode, max_count: u32) -> bool {
        if self.exclusive_holder.is_some() {
            return false;
        }
        match access {
            AccessMode::Exclusive => self.counting_holders.is_empty(),
            AccessMode::Counting => (self.counting_holders.len() as u32) < max_count,
        }
    }
}

#[derive(Default)]
pub struct LockArbiter {
    locks: Mutex<HashMap<LockId, LockState>>,
}

impl LockArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_available(&self, lock: &LockId, access: AccessMode) -> bool {
        let locks = self.locks.lock().await;
        locks
            .get(lock)
            .map(|s| s.is_available(access, lock.max_count))
            .unwrap_or(true)
    }

    /// Non-blocking attempt to become a holder. Also removes this
    /// owner from the waiter queue if it was enqueued there, since a
    /// successful claim means its wait is over.
    pub async fn claim(&self, owner: Owner, lock: &LockId, access: AccessMode) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        let state = locks.entry(lock.clone()).or_default();
        if !state.is_available(access, lock.max_count) {
            return Err(LockError::WouldViolateInvariant(lock.clone()));
        }
        match access {
            AccessMode::Exclusive => state.exclusive_holder = Some(owner),
            AccessMode::Counting => state.counting_holders.push(owner),
        }
        state.waiters.retain(|w| !(w.owner == owner && w.access == access));
        Ok(())
    }

    /// Enqueue `owner` at the back of the FIFO waiter list and return a
    /// future that resolves once the lock *may* be claimable for this
    /// owner. The caller must re-attempt `claim` on wake.
    pub async fn wait_until_maybe_available(&self, owner: Owner, lock: &LockId, access: AccessMode) -> Arc<Notify> {
        let mut locks = self.locks.lock().await;
        let state = locks.entry(lock.clone()).or_default();
        let notify = Arc::new(Notify::new());
        state.waiters.push_back(Waiter {
            owner,
            access,
            notify: notify.clone(),
        });
        notify
    }

    /// Remove the holder matching `(owner, access)` and, if the new
    /// front waiter's access is now satisfiable, wake it. Does not
    /// grant the lock itself -- the woken waiter must call `claim`.
    pub async fn release(&self, owner: Owner, lock: &LockId, access: AccessMode) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        let state = locks.get_mut(lock).ok_or_else(|| LockError::NotHeld(lock.clone()))?;
        let removed = match access {
            AccessMode::Exclusive => {
                if state.exclusive_holder == Some(owner) {
                    state.exclusive_holder = None;
                    true
                } else {
                    false
                }
            }
            AccessMode::Counting => {
                if let Some(pos) = state.counting_holders.iter().position(|&o| o == owner) {
                    state.counting_holders.remove(pos);
                    true
                } else {
                    false
                }
            }
        };
        if !removed {
            return Err(LockError::NotHeld(lock.clone()));
        }
        if let Some(front) = state.waiters.front() {
            if state.is_available(front.access, lock.max_count) {
                front.notify.notify_one();
            }
        }
        Ok(())
    }

    /// Cancel a pending wait (build stopped while acquiring locks).
    pub async fn stop_waiting(&self, owner: Owner, lock: &LockId, access: AccessMode) {
        let mut locks = self.locks.lock().await;
        if let Some(state) = locks.get_mut(lock) {
            state.waiters.retain(|w| !(w.owner == owner && w.access == access));
        }
    }

    /// Convenience: claim now, or enqueue and wait until claimable,
    /// looping until `claim` succeeds. Used by the build runner's
    /// ACQUIRING_LOCKS phase, which needs a single cancellable future
    /// per lock rather than the raw two-step API.
    pub async fn acquire(&self, owner: Owner, lock: &LockId, access: AccessMode) -> Result<(), LockError> {
        if self.claim(owner, lock, access).await.is_ok() {
            return Ok(());
        }
        loop {
            let notify = self.wait_until_maybe_available(owner, lock, access).await;
            notify.notified().await;
            if self.claim(owner, lock, access).await.is_ok() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::LockScope;

    fn lock(max_count: u32) -> LockId {
        LockId {
            scope: LockScope::Master,
            name: "build-lock".to_string(),
            max_count,
        }
    }

    #[tokio::test]
    async fn exclusive_and_counting_are_mutually_exclusive() {
        let arbiter = LockArbiter::new();
        let l = lock(2);
        arbiter.claim(1, &l, AccessMode::Exclusive).await.unwrap();
        assert!(arbiter.claim(2, &l, AccessMode::Counting).await.is_err());
    }

    #[tokio::test]
    async fn counting_respects_max_count() {
        let arbiter = LockArbiter::new();
        let l = lock(2);
        arbiter.claim(1, &l, AccessMode::Counting).await.unwrap();
        arbiter.claim(2, &l, AccessMode::Counting).await.unwrap();
        assert!(arbiter.claim(3, &l, AccessMode::Counting).await.is_err());
    }

    /// Scenario 1 from the design's testable scenarios: an exclusive
    /// waiter must not be jumped by a later counting request even
    /// though counting capacity would otherwise allow it.
    #[tokio::test]
    async fn fifo_exclusive_waiter_is_not_starved_by_counting() {
        let arbiter = LockArbiter::new();
        let l = lock(2);

        // A holds counting.
        arbiter.claim(1, &l, AccessMode::Counting).await.unwrap();

        // B arrives wanting exclusive; can't claim yet, enqueues.
        assert!(arbiter.claim(2, &l, AccessMode::Exclusive).await.is_err());
        let b_notify = arbiter.wait_until_maybe_available(2, &l, AccessMode::Exclusive).await;

        // C arrives wanting counting; capacity would allow it (1 < 2)
        // but it must not jump ahead of B.
        assert!(arbiter.claim(3, &l, AccessMode::Counting).await.is_err());
        let c_notify = arbiter.wait_until_maybe_available(3, &l, AccessMode::Counting).await;

        // Release A: only B (front of queue) should be woken.
        arbiter.release(1, &l, AccessMode::Counting).await.unwrap();

        // B can now claim exclusively.
        tokio::time::timeout(std::time::Duration::from_millis(50), b_notify.notified())
            .await
            .expect("B should have been woken");
        arbiter.claim(2, &l, AccessMode::Exclusive).await.unwrap();

        // C must still be blocked -- exclusive holder present.
        assert!(arbiter.claim(3, &l, AccessMode::Counting).await.is_err());

        // Release B: now C can claim.
        arbiter.release(2, &l, AccessMode::Exclusive).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(50), c_notify.notified())
            .await
            .expect("C should have been woken");
        arbiter.claim(3, &l, AccessMode::Counting).await.unwrap();
    }

    #[tokio::test]
    async fn acquire_blocks_until_available_then_succeeds() {
        let arbiter = Arc::new(LockArbiter::new());
        let l = lock(1);
        arbiter.claim(1, &l, AccessMode::Exclusive).await.unwrap();

        let arbiter2 = arbiter.clone();
        let l2 = l.clone();
        let waiter = tokio::spawn(async move { arbiter2.acquire(2, &l2, AccessMode::Exclusive).await });

        tokio::task::yield_now().await;
        arbiter.release(1, &l, AccessMode::Exclusive).await.unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_waiting_cancels_pending_wait() {
        let arbiter = LockArbiter::new();
        let l = lock(1);
        arbiter.claim(1, &l, AccessMode::Exclusive).await.unwrap();
        let _notify = arbiter.wait_until_maybe_available(2, &l, AccessMode::Exclusive).await;
        arbiter.stop_waiting(2, &l, AccessMode::Exclusive).await;
        arbiter.release(1, &l, AccessMode::Exclusive).await.unwrap();
        // No panic / hang: the cancelled waiter is simply gone. A
        // fresh claim from someone else should now succeed.
        arbiter.claim(3, &l, AccessMode::Exclusive).await.unwrap();
    }
}
