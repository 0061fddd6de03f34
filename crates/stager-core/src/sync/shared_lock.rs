use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use crate::config::LockRetryPolicy;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::Pid;
use crate::{Result, StagerError};

const UNLOCKED: u32 = 0;

/// Record lock identified by the owning process id.
///
/// The lock state is a single owner word, so it can be stored in a table that outlives
/// the process holding it. A holder that died leaves its id behind; callers detect that
/// with a bounded trylock budget and must call [`SharedLock::force_reinitialize`]
/// explicitly. Dropping a guard releases only a lock the guard still owns.
#[derive(Debug, Default)]
pub struct SharedLock {
    owner: AtomicU32,
}

impl SharedLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(UNLOCKED),
        }
    }

    /// Rebuilds a lock from a persisted owner word.
    pub const fn with_owner(owner: u32) -> Self {
        Self {
            owner: AtomicU32::new(owner),
        }
    }

    pub fn try_lock(&self, owner: Pid) -> Option<SharedLockGuard<'_>> {
        debug_assert_ne!(owner, UNLOCKED);
        self.owner
            .compare_exchange(UNLOCKED, owner, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SharedLockGuard { lock: self, owner })
    }

    /// Tries the lock with exponential backoff, reporting the holder when the budget runs out.
    pub fn lock_with_retry(
        &self,
        owner: Pid,
        policy: &LockRetryPolicy,
    ) -> Result<SharedLockGuard<'_>> {
        for attempt in 0..policy.attempts {
            if let Some(guard) = self.try_lock(owner) {
                return Ok(guard);
            }
            if attempt + 1 < policy.attempts {
                thread::sleep(policy.backoff(attempt));
            }
        }
        match self.try_lock(owner) {
            Some(guard) => Ok(guard),
            None => Err(StagerError::LockAbandoned {
                holder: self.owner.load(Ordering::Acquire),
            }),
        }
    }

    /// Like [`lock_with_retry`](Self::lock_with_retry), but treats an exhausted budget
    /// as a dead holder: the lock is reinitialized and then taken.
    pub fn lock_or_recover(&self, owner: Pid, policy: &LockRetryPolicy) -> SharedLockGuard<'_> {
        loop {
            match self.lock_with_retry(owner, policy) {
                Ok(guard) => return guard,
                Err(_) => {
                    let previous = self.force_reinitialize();
                    telemetry::increment_counter(
                        tags::METRIC_WORKER_LOCK_REINIT_COUNT,
                        1,
                        &[("subsystem", "sync"), ("op", "reinit")],
                    );
                    tracing::warn!(
                        target: tags::TARGET_WORKER,
                        holder = previous.unwrap_or(UNLOCKED),
                        "lock abandoned, reinitialized"
                    );
                }
            }
        }
    }

    /// Clears the owner word and returns the abandoned holder, if any.
    pub fn force_reinitialize(&self) -> Option<Pid> {
        let previous = self.owner.swap(UNLOCKED, Ordering::AcqRel);
        (previous != UNLOCKED).then_some(previous)
    }

    pub fn holder(&self) -> Option<Pid> {
        let owner = self.owner.load(Ordering::Acquire);
        (owner != UNLOCKED).then_some(owner)
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }
}

/// Proof of ownership of a [`SharedLock`].
#[derive(Debug)]
pub struct SharedLockGuard<'a> {
    lock: &'a SharedLock,
    owner: Pid,
}

impl SharedLockGuard<'_> {
    pub fn owner(&self) -> Pid {
        self.owner
    }
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.owner.compare_exchange(
            self.owner,
            UNLOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
