//! # Lock and Mutex.
//!
//! A [`Lock`] admits one holder at a time and remembers who that holder is.
//! It is assembled from two semaphores: an *entry* semaphore of capacity one
//! that threads queue on, and an internal semaphore guarding the owner
//! field. Only the owner may release a lock; a release by anyone else does
//! nothing at all, so unbalanced releases are harmless but go unnoticed.
//!
//! [`Mutex`] pairs a [`Lock`] with the data it protects. The data is only
//! reachable through the [`MutexGuard`] returned by [`Mutex::lock`], and the
//! guard releases the lock when dropped. Kernel structures that must only be
//! mutated under a lock are kept inside a [`Mutex`], so the rule is checked
//! by the compiler instead of by convention.

use super::Semaphore;
use crossbeam_utils::atomic::AtomicCell;
use mtos::thread::Current;
use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

/// A mutual-exclusion lock that tracks its owner.
pub struct Lock {
    name: &'static str,
    owner: AtomicCell<Option<u64>>,
    entry: Semaphore,
    mutex: Semaphore,
}

impl Lock {
    /// Creates a new, free lock.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            owner: AtomicCell::new(None),
            entry: Semaphore::new(1),
            mutex: Semaphore::new(1),
        }
    }

    /// Name given at creation.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Blocks until the lock is free, then takes it.
    pub fn acquire(&self) {
        self.entry.p();
        self.mutex.p();
        let owner = self.owner.load();
        // Unreachable while the entry semaphore admits one thread at a time.
        debug_assert!(
            owner.is_none(),
            "lock `{}` entered while owned by {owner:?}",
            self.name
        );
        if owner.is_none() {
            self.owner.store(Some(Current::get_tid()));
        } else {
            self.entry.v();
        }
        self.mutex.v();
    }

    /// Releases the lock if the current thread holds it; otherwise does
    /// nothing.
    pub fn release(&self) {
        self.mutex.p();
        if self.owner.load() == Some(Current::get_tid()) {
            self.owner.store(None);
            self.entry.v();
        }
        self.mutex.v();
    }

    /// Whether the current thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load() == Some(Current::get_tid())
    }

    /// Thread id of the holder, if any.
    pub fn owner(&self) -> Option<u64> {
        self.owner.load()
    }
}

/// A [`Lock`] protecting a value of type `T`.
pub struct Mutex<T> {
    pub(crate) lock: Lock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(name: &'static str, t: T) -> Self {
        Self {
            lock: Lock::new(name),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.acquire();
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Scoped access to the data of a [`Mutex`].
///
/// The lock is released when the guard is dropped.
pub struct MutexGuard<'a, T> {
    pub(crate) mutex: &'a Mutex<T>,
    // The lock is owned by the thread that acquired it.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T> MutexGuard<'_, T> {
    /// Releases the underlying [`Mutex`].
    pub fn unlock(self) {
        drop(self)
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}
