//! # Semaphore.
//!
//! A **semaphore** maintains a count of available units of some resource.
//! [`Semaphore::p`] takes one unit, blocking while none is available, and
//! [`Semaphore::v`] gives one back.
//!
//! The semaphore is the only primitive in mtos that can put a thread to
//! sleep. Its value and wait queue live behind a [`SpinLock`], which plays the
//! role of disabling interrupts: every check-and-mutate sequence on them is
//! atomic, and nothing inside that section ever blocks on another kernel
//! primitive.
//!
//! Waiters are woken in FIFO order, but [`Semaphore::v`] does not hand its unit
//! to the woken thread. The unit is added to the count and the woken thread
//! competes for it like everyone else, re-checking the count when it runs. A
//! thread arriving between the wake-up and the re-check may therefore take the
//! unit first, in which case the woken thread parks again.

use mtos::{
    sync::SpinLock,
    thread::{Current, ParkHandle},
};
use std::collections::VecDeque;

struct SemaphoreState {
    value: usize,
    waiters: VecDeque<ParkHandle>,
}

/// A counting semaphore with a FIFO wait queue.
pub struct Semaphore {
    state: SpinLock<SemaphoreState>,
}

impl Semaphore {
    /// Creates a new semaphore holding `value` units.
    pub fn new(value: usize) -> Self {
        Self {
            state: SpinLock::new(SemaphoreState {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Takes one unit, parking the current thread until one is available.
    #[doc(alias = "wait")]
    pub fn p(&self) {
        loop {
            let mut state = self.state.lock();
            if state.value > 0 {
                state.value -= 1;
                return;
            }
            Current::park_with(move |handle| {
                state.waiters.push_back(handle);
                state.unlock();
            });
        }
    }

    /// Returns one unit, waking the longest waiting thread if there is one.
    #[doc(alias = "signal")]
    pub fn v(&self) {
        let mut state = self.state.lock();
        let waiter = state.waiters.pop_front();
        state.value += 1;
        state.unlock();

        if let Some(waiter) = waiter {
            waiter.unpark();
        }
    }

    /// Current number of units.
    pub fn value(&self) -> usize {
        self.state.lock().value
    }

    /// Number of threads parked on this semaphore.
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }
}
