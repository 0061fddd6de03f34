use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{lock_unpoisoned, wait_timeout_unpoisoned, wait_unpoisoned};

/// Binary ready/done signal: a mutex and condition variable guarding one boolean.
///
/// `post` raises the flag and wakes every waiter; a successful wait consumes the flag so
/// the next wait blocks until the next post.
#[derive(Debug, Default)]
pub struct Latch {
    ready: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut ready = lock_unpoisoned(&self.ready);
        *ready = true;
        self.condvar.notify_all();
    }

    pub fn wait(&self) {
        let mut ready = lock_unpoisoned(&self.ready);
        while !*ready {
            ready = wait_unpoisoned(&self.condvar, ready);
        }
        *ready = false;
    }

    /// Returns false when `timeout` elapsed without a post.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = lock_unpoisoned(&self.ready);
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = wait_timeout_unpoisoned(&self.condvar, ready, deadline - now);
            ready = guard;
        }
        *ready = false;
        true
    }

    pub fn is_posted(&self) -> bool {
        *lock_unpoisoned(&self.ready)
    }

    pub fn reset(&self) {
        *lock_unpoisoned(&self.ready) = false;
    }
}
