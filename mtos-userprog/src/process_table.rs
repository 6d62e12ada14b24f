//! Process lifecycle table.
//!
//! A fixed number of slots, one per process that may exist at a time. A slot
//! is claimed when an address space is built and released when its process
//! ends. Each slot owns a condition that is broadcast on release, which is
//! what [`ProcessTable::wait`] sleeps on.
//!
//! The table also counts processes that have started and not yet finished.
//! When that count drops to zero the machine is done.

use crate::sync::{Condition, Mutex};
use mtos::KernelError;

/// Process identifier. Slot `i` carries pid `i + 1`.
pub type Pid = u64;

struct ProcessSlot {
    active: Mutex<bool>,
    exited: Condition,
}

/// Fixed-capacity table of processes.
pub struct ProcessTable {
    slots: Box<[ProcessSlot]>,
    running: Mutex<usize>,
}

impl ProcessTable {
    /// Creates a table of `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| ProcessSlot {
                    active: Mutex::new("process slot", false),
                    exited: Condition::new(),
                })
                .collect(),
            running: Mutex::new("process count", 0),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, pid: Pid) -> Option<&ProcessSlot> {
        let index = usize::try_from(pid).ok()?.checked_sub(1)?;
        self.slots.get(index)
    }

    /// Claims the first free slot.
    pub fn claim(&self) -> Result<Pid, KernelError> {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut active = slot.active.lock();
            if !*active {
                *active = true;
                return Ok(index as Pid + 1);
            }
        }
        log::warn!("process table is full ({} slots)", self.slots.len());
        Err(KernelError::TooManyProcesses)
    }

    /// Frees the slot of `pid` and wakes everyone waiting for it.
    pub fn release(&self, pid: Pid) {
        let Some(slot) = self.slot(pid) else {
            return;
        };
        let mut active = slot.active.lock();
        *active = false;
        slot.exited.broadcast_locked(&mut active);
    }

    /// Whether `pid` names an active process.
    pub fn is_active(&self, pid: Pid) -> bool {
        self.slot(pid).is_some_and(|slot| *slot.active.lock())
    }

    /// Blocks until the slot of `pid` is no longer active.
    pub fn wait(&self, pid: Pid) -> Result<(), KernelError> {
        let slot = self.slot(pid).ok_or(KernelError::InvalidArgument)?;
        let active = slot.active.lock();
        slot.exited.wait_while(active, |active| *active).unlock();
        Ok(())
    }

    /// Counts one more running process.
    pub fn process_started(&self) {
        *self.running.lock() += 1;
    }

    /// Counts one process fewer, returning how many are left.
    pub fn process_finished(&self) -> usize {
        let mut running = self.running.lock();
        *running = running.saturating_sub(1);
        *running
    }

    /// Processes started and not yet finished.
    pub fn running(&self) -> usize {
        *self.running.lock()
    }
}
