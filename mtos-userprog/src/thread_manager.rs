//! Thread lifecycle of one address space.
//!
//! Every address space tracks the user threads running in it:
//!
//! - the ids of live threads, in creation order;
//! - a counter handing out thread ids, never reusing one;
//! - a join condition per live thread, broadcast when that thread leaves;
//! - an exit condition, broadcast whenever any thread leaves;
//! - a bitmap of stack slots.
//!
//! The thread table lives in a [`Mutex`], and operations that change it take
//! the [`MutexGuard`] as proof that the caller holds the table lock.
//!
//! ## Stack layout
//!
//! The stack region sits at the top of the address space and is cut into
//! blocks of `thread_stack_size` bytes. The topmost block is the default stack
//! of the initial thread. The remaining blocks are the stack slots: slot `s`
//! starts at `stack_top - (s + 1) * thread_stack_size` and grows down from
//! there. An address space therefore runs at most
//! `user_stack_size / thread_stack_size - 1` threads besides the initial one.

use crate::{
    bitmap::BitMap,
    sync::{Condition, Mutex, MutexGuard},
};
use std::{collections::BTreeMap, sync::Arc};

/// Thread id of the initial thread of every address space.
pub const MAIN_THREAD_ID: u64 = 1;

/// Live threads of an address space.
pub struct ThreadTable {
    live: Vec<u64>,
    next_id: u64,
    join_conditions: BTreeMap<u64, Arc<Condition>>,
}

impl ThreadTable {
    /// Number of live threads, the initial thread included.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no thread is left.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Whether `id` is live.
    pub fn has_thread(&self, id: u64) -> bool {
        self.live.contains(&id)
    }

    /// Ids of live threads, oldest first.
    pub fn live(&self) -> &[u64] {
        &self.live
    }

    /// Hands out a fresh thread id.
    pub fn next_thread_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Registers `id` as live. Adding a live id changes nothing.
    pub fn add_thread(&mut self, id: u64) {
        if !self.has_thread(id) {
            self.live.push(id);
            self.join_conditions.insert(id, Arc::new(Condition::new()));
        }
    }

    fn join_condition(&self, id: u64) -> Option<Arc<Condition>> {
        self.join_conditions.get(&id).cloned()
    }
}

/// Thread bookkeeping of one address space.
pub struct ThreadManager {
    table: Mutex<ThreadTable>,
    stacks: Mutex<BitMap>,
    exit_condition: Condition,
    stack_top: usize,
    thread_stack_size: usize,
}

impl ThreadManager {
    /// Creates the bookkeeping for a stack region of `user_stack_size` bytes
    /// ending at `stack_top`, with the initial thread as the sole live thread.
    pub fn new(stack_top: usize, user_stack_size: usize, thread_stack_size: usize) -> Self {
        let max_threads = (user_stack_size / thread_stack_size).saturating_sub(1);
        let mut table = ThreadTable {
            live: Vec::with_capacity(max_threads + 1),
            next_id: MAIN_THREAD_ID + 1,
            join_conditions: BTreeMap::new(),
        };
        table.add_thread(MAIN_THREAD_ID);
        Self {
            table: Mutex::new("thread table", table),
            stacks: Mutex::new("thread stacks", BitMap::new(max_threads)),
            exit_condition: Condition::new(),
            stack_top,
            thread_stack_size,
        }
    }

    /// Threads that may run besides the initial one.
    pub fn max_threads(&self) -> usize {
        self.stacks.lock().len()
    }

    /// Acquires the thread table lock.
    pub fn lock_table(&self) -> MutexGuard<'_, ThreadTable> {
        self.table.lock()
    }

    /// Number of live threads.
    pub fn num_threads(&self) -> usize {
        self.lock_table().len()
    }

    /// Removes `id` from the live threads and wakes its joiners and every
    /// thread waiting for a thread to leave.
    ///
    /// Returns the number of threads left right after the removal, or `None`
    /// if `id` was not live. The table lock is released while the waiters are
    /// woken, so the table may have changed again by the time this returns;
    /// only the returned count tells whether `id` was the last thread.
    pub fn remove_thread(
        &self,
        table: &mut MutexGuard<'_, ThreadTable>,
        id: u64,
    ) -> Option<usize> {
        let position = table.live.iter().position(|live| *live == id)?;
        table.live.remove(position);
        let left = table.live.len();
        if let Some(joiners) = table.join_conditions.remove(&id) {
            joiners.broadcast_locked(table);
        }
        self.exit_condition.broadcast_locked(table);
        Some(left)
    }

    /// Blocks until `id` is no longer live.
    ///
    /// Returns `None` without blocking if `id` is not live to begin with.
    pub fn join<'a>(
        &self,
        table: MutexGuard<'a, ThreadTable>,
        id: u64,
    ) -> Option<MutexGuard<'a, ThreadTable>> {
        let joiners = table.join_condition(id)?;
        Some(joiners.wait_while(table, |table| table.has_thread(id)))
    }

    /// Blocks until no more than `n` threads are live.
    pub fn wait_until_at_most<'a>(
        &self,
        table: MutexGuard<'a, ThreadTable>,
        n: usize,
    ) -> MutexGuard<'a, ThreadTable> {
        self.exit_condition.wait_while(table, |table| table.len() > n)
    }

    /// Reserves a stack slot and returns the initial stack pointer of it.
    pub fn get_stack_pointer(&self) -> Option<usize> {
        let slot = self.stacks.lock().find()?;
        Some(self.stack_top - (slot + 1) * self.thread_stack_size)
    }

    /// Frees the stack slot whose initial stack pointer is `sp`.
    pub fn remove_stack_pointer(&self, sp: usize) {
        let offset = self.stack_top.wrapping_sub(sp);
        if sp > self.stack_top || offset % self.thread_stack_size != 0 {
            log::warn!("{sp:#x} is not a thread stack");
            return;
        }
        let mut stacks = self.stacks.lock();
        match (offset / self.thread_stack_size).checked_sub(1) {
            Some(slot) if slot < stacks.len() => stacks.clear(slot),
            _ => log::warn!("{sp:#x} is not a thread stack"),
        }
    }

    /// Number of stack slots in use.
    pub fn stacks_in_use(&self) -> usize {
        self.stacks.lock().num_set()
    }
}
