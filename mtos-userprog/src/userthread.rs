//! User threads.
//!
//! A [`UserThread`] is the kernel-side state of one thread of a user program:
//! its id within the address space, the address space itself, and the stack
//! slot it runs on. Every user thread is carried by a kernel thread of its
//! own, spawned by [`UserThread::do_thread_create`] (or by the kernel for the
//! initial thread of a process).
//!
//! A thread ends by calling [`UserThread::do_thread_exit`], or by returning
//! from its function into a context with nowhere left to go, which ends up at
//! the same place. When the last thread of an address space leaves, the
//! process ends with it.

use crate::{addrspace::AddrSpace, kernel::Kernel};
use mtos::{
    KernelError,
    syscall::{ARG_REGS, RET_ADDR_REG},
    thread::{Current, ThreadBuilder},
};
use std::sync::Arc;

/// Where a new thread starts executing.
#[derive(Clone, Copy, Debug)]
pub struct ThreadParams {
    /// Code address of the function to run.
    pub function: usize,
    /// Value of the first argument register.
    pub arg: usize,
    /// Code address the function returns to.
    pub return_addr: usize,
}

/// Kernel-side state of a user thread.
pub struct UserThread {
    /// Thread id within the address space.
    pub tid: u64,
    pub(crate) kernel: Arc<Kernel>,
    pub(crate) space: Arc<AddrSpace>,
    stack_pointer: Option<usize>,
}

impl UserThread {
    /// Creates the state of thread `tid` of `space`.
    ///
    /// A thread without `stack_pointer` runs on the default stack of the
    /// address space.
    pub(crate) fn new(
        kernel: Arc<Kernel>,
        space: Arc<AddrSpace>,
        tid: u64,
        stack_pointer: Option<usize>,
    ) -> Self {
        Self {
            tid,
            kernel,
            space,
            stack_pointer,
        }
    }

    /// Address space the thread runs in.
    pub fn space(&self) -> &Arc<AddrSpace> {
        &self.space
    }

    /// Entry point of the kernel thread carrying this user thread.
    pub(crate) fn run(mut self, params: ThreadParams) {
        let mut regs = self.space.init_registers();
        regs.set_pc(params.function);
        regs.write(ARG_REGS[0], params.arg);
        regs.write(RET_ADDR_REG, params.return_addr);
        if let Some(sp) = self.stack_pointer {
            regs.set_stack_pointer(sp);
        }
        log::debug!(
            "pid {} thread {} starts at {:#x}",
            self.space.pid,
            self.tid,
            params.function
        );

        let machine = self.kernel.machine.clone();
        machine.run(&mut self, &mut regs);
        self.do_thread_exit()
    }

    /// Starts a new thread running `function(arg)` in the current address
    /// space, returning to `return_addr` when `function` returns.
    ///
    /// # Errors
    /// - [`KernelError::TryAgain`] if the address space already runs its
    ///   maximum number of threads.
    /// - [`KernelError::NoSpace`] if no stack slot is free.
    pub fn do_thread_create(
        &self,
        function: usize,
        arg: usize,
        return_addr: usize,
    ) -> Result<u64, KernelError> {
        let threads = &self.space.threads;
        let max_threads = threads.max_threads();

        let mut table = threads.lock_table();
        if table.len() > max_threads {
            log::warn!(
                "pid {}: thread limit of {max_threads} reached",
                self.space.pid
            );
            return Err(KernelError::TryAgain);
        }
        let tid = table.next_thread_id();
        table.add_thread(tid);
        table.unlock();

        let Some(sp) = threads.get_stack_pointer() else {
            log::warn!("pid {}: no free thread stack", self.space.pid);
            self.forget(tid);
            return Err(KernelError::NoSpace);
        };

        let child = UserThread::new(self.kernel.clone(), self.space.clone(), tid, Some(sp));
        let params = ThreadParams {
            function,
            arg,
            return_addr,
        };
        ThreadBuilder::new(format!("pid {} thread {tid}", self.space.pid))
            .spawn(move || child.run(params))
            .inspect_err(|_| {
                threads.remove_stack_pointer(sp);
                self.forget(tid);
            })?;

        log::debug!("pid {}: created thread {tid}", self.space.pid);
        Ok(tid)
    }

    // Drops a thread that was registered but never started.
    fn forget(&self, tid: u64) {
        let threads = &self.space.threads;
        let mut table = threads.lock_table();
        threads.remove_thread(&mut table, tid);
    }

    /// Ends the current thread.
    ///
    /// Joiners of the thread are woken and its stack slot is freed. If it was
    /// the last thread of its address space, the process ends as well.
    pub fn do_thread_exit(&self) -> ! {
        let threads = &self.space.threads;
        let mut table = threads.lock_table();
        let last = threads.remove_thread(&mut table, self.tid) == Some(0);
        table.unlock();

        if let Some(sp) = self.stack_pointer {
            threads.remove_stack_pointer(sp);
        }
        log::debug!("pid {}: thread {} exits", self.space.pid, self.tid);

        if last {
            self.kernel.finish_process(self.space.pid);
        }
        Current::exit(0)
    }

    /// Blocks until thread `tid` of the current address space has exited.
    ///
    /// # Errors
    /// - [`KernelError::Deadlock`] if `tid` is the caller.
    /// - [`KernelError::NoSuchThread`] if `tid` is not live.
    pub fn do_thread_join(&self, tid: u64) -> Result<(), KernelError> {
        if tid == self.tid {
            return Err(KernelError::Deadlock);
        }
        let threads = &self.space.threads;
        let table = threads.lock_table();
        threads
            .join(table, tid)
            .ok_or(KernelError::NoSuchThread)?
            .unlock();
        Ok(())
    }
}
