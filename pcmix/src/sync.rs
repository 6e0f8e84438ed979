//! Lock helpers that recover the guard from a poisoned lock.
//!
//! A panic on a user thread while holding a player or mixer lock must not take
//! the audio loop down with it, so poisoning is ignored.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait_timeout<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match cond.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

/// One-shot signal: fired once, observed many times.
#[derive(Debug, Default)]
pub(crate) struct OneShot {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl OneShot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        let mut fired = lock(&self.fired);
        if !*fired {
            *fired = true;
            self.cond.notify_all();
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        *lock(&self.fired)
    }

    /// Wait until fired or `timeout` elapses; returns whether it fired.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut fired = lock(&self.fired);
        while !*fired {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            fired = wait_timeout(&self.cond, fired, deadline - now);
        }
        true
    }
}
