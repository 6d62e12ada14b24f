//! # Condition variable.
//!
//! A [`Condition`] lets a thread holding a [`Lock`] sleep until another
//! thread announces that the state it waits for may have changed. Wake-ups
//! follow Mesa semantics: a woken thread re-acquires the lock and must check
//! its predicate again, since the state may have changed once more before
//! it ran. [`Condition::wait_while`] packages that loop.
//!
//! The condition counts its sleepers under an internal semaphore and puts them
//! to sleep on a second semaphore that starts at zero. [`Condition::signal`]
//! and [`Condition::broadcast`] hand the caller's lock back for the duration
//! of the wake step and take it again before returning, so a caller must not
//! assume that the protected state is unchanged across a signal.
//!
//! Every operation must be called with the lock held, and returns with the
//! lock held.

use super::{Lock, MutexGuard, Semaphore};
use crossbeam_utils::atomic::AtomicCell;

/// A Mesa-style condition variable.
pub struct Condition {
    waiting: AtomicCell<usize>,
    sleep: Semaphore,
    mutex: Semaphore,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    /// Creates a condition nobody waits on.
    pub fn new() -> Self {
        Self {
            waiting: AtomicCell::new(0),
            sleep: Semaphore::new(0),
            mutex: Semaphore::new(1),
        }
    }

    /// Number of threads asleep on this condition and not yet woken.
    pub fn waiting(&self) -> usize {
        self.waiting.load()
    }

    /// Releases `lock`, sleeps until woken, then re-acquires `lock`.
    pub fn wait(&self, lock: &Lock) {
        self.mutex.p();
        self.waiting.fetch_add(1);
        lock.release();
        self.mutex.v();

        self.sleep.p();
        lock.acquire();
    }

    /// Wakes one sleeper, if any.
    pub fn signal(&self, lock: &Lock) {
        self.wake(lock, |waiting| waiting.min(1));
    }

    /// Wakes every thread asleep at the time of the call.
    pub fn broadcast(&self, lock: &Lock) {
        self.wake(lock, |waiting| waiting);
    }

    fn wake(&self, lock: &Lock, count: impl FnOnce(usize) -> usize) {
        self.mutex.p();
        let n = count(self.waiting.load());
        if n == 0 {
            self.mutex.v();
            return;
        }
        self.waiting.fetch_sub(n);
        lock.release();
        for _ in 0..n {
            self.sleep.v();
        }
        // Drop the internal mutex first: a woken sleeper that waits again
        // needs it while holding `lock`.
        self.mutex.v();
        lock.acquire();
    }

    /// Waits once on the lock held by `guard`.
    pub fn wait_locked<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait(&guard.mutex.lock);
        guard
    }

    /// Blocks while `condition` holds for the data behind `guard`.
    pub fn wait_while<'a, T>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        while condition(&mut *guard) {
            guard = self.wait_locked(guard);
        }
        guard
    }

    /// [`Condition::signal`] for the lock held by `guard`.
    pub fn signal_locked<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.signal(&guard.mutex.lock);
    }

    /// [`Condition::broadcast`] for the lock held by `guard`.
    pub fn broadcast_locked<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.broadcast(&guard.mutex.lock);
    }
}
