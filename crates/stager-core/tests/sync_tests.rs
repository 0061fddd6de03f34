use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stager_core::config::LockRetryPolicy;
use stager_core::sync::{CancellationToken, Latch, SharedLock};
use stager_core::{StageErrno, StagerError};

fn quick_policy() -> LockRetryPolicy {
    LockRetryPolicy {
        attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

#[test]
fn shared_lock_has_one_owner() {
    let lock = SharedLock::new();
    let guard = lock.try_lock(100).expect("free lock");
    assert_eq!(guard.owner(), 100);
    assert_eq!(lock.holder(), Some(100));
    assert!(lock.try_lock(200).is_none());

    drop(guard);
    assert!(!lock.is_locked());
    assert!(lock.try_lock(200).is_some());
}

#[test]
fn exhausted_budget_reports_the_holder() {
    let lock = SharedLock::with_owner(4321);
    match lock.lock_with_retry(1, &quick_policy()) {
        Err(StagerError::LockAbandoned { holder }) => assert_eq!(holder, 4321),
        other => panic!("expected an abandoned lock, got {other:?}"),
    }
    assert_eq!(
        StagerError::LockAbandoned { holder: 4321 }.errno(),
        StageErrno::NoSuchProcess
    );
}

#[test]
fn dead_holder_is_recovered_explicitly() {
    let lock = SharedLock::with_owner(4321);
    assert_eq!(lock.force_reinitialize(), Some(4321));
    assert_eq!(lock.force_reinitialize(), None);

    let stale = SharedLock::with_owner(77);
    let guard = stale.lock_or_recover(9, &quick_policy());
    assert_eq!(guard.owner(), 9);
    assert_eq!(stale.holder(), Some(9));
}

#[test]
fn reinitialized_lock_is_not_released_by_the_old_guard() {
    let lock = SharedLock::new();
    let old = lock.try_lock(1).expect("free lock");
    lock.force_reinitialize();
    let new = lock.try_lock(2).expect("reinitialized lock");
    drop(old);
    assert_eq!(lock.holder(), Some(2));
    drop(new);
    assert_eq!(lock.holder(), None);
}

#[test]
fn contended_lock_is_taken_after_release() {
    let lock = Arc::new(SharedLock::new());
    let guard = lock.try_lock(1).expect("free lock");
    let waiter = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let policy = LockRetryPolicy {
                attempts: 50,
                initial_backoff: Duration::from_millis(2),
                max_backoff: Duration::from_millis(10),
            };
            lock.lock_with_retry(2, &policy).map(|guard| guard.owner()).ok()
        })
    };
    thread::sleep(Duration::from_millis(20));
    drop(guard);
    assert_eq!(waiter.join().expect("waiter panicked"), Some(2));
}

#[test]
fn latch_post_is_consumed_by_one_wait() {
    let latch = Latch::new();
    assert!(!latch.wait_timeout(Duration::from_millis(5)));
    latch.post();
    assert!(latch.is_posted());
    assert!(latch.wait_timeout(Duration::from_millis(5)));
    assert!(!latch.is_posted());

    latch.post();
    latch.reset();
    assert!(!latch.wait_timeout(Duration::from_millis(5)));
}

#[test]
fn latch_wakes_a_waiting_thread() {
    let latch = Arc::new(Latch::new());
    let waiter = {
        let latch = Arc::clone(&latch);
        thread::spawn(move || {
            let started = Instant::now();
            latch.wait();
            started.elapsed()
        })
    };
    thread::sleep(Duration::from_millis(20));
    latch.post();
    let waited = waiter.join().expect("waiter panicked");
    assert!(waited >= Duration::from_millis(10));
}

#[test]
fn cancellation_is_shared_between_clones() {
    let token = CancellationToken::new();
    let observer = token.clone();
    assert!(!observer.is_canceled());
    token.cancel();
    assert!(observer.is_canceled());
    observer.reset();
    assert!(!token.is_canceled());
}
