//! User processes.
//!
//! Process-level services offered to a running thread: starting a sibling
//! program, ending the current one, waiting for another to end, and stopping
//! the machine.

use crate::{process_table::Pid, userthread::UserThread};
use mtos::{KernelError, thread::Current};

/// Longest program name accepted from user memory, NUL included.
pub const MAX_FILENAME_LEN: usize = 256;

impl UserThread {
    /// Starts the program whose NUL-terminated name lives at `filename_va`,
    /// returning the id of the new process.
    ///
    /// # Errors
    /// - [`KernelError::NoSuchEntry`] if the program does not exist.
    /// - [`KernelError::NoMemory`] if there are not enough free frames.
    /// - [`KernelError::TooManyProcesses`] if the process table is full.
    pub fn do_process_create(
        &self,
        filename_va: usize,
        arg: usize,
        return_addr: usize,
    ) -> Result<Pid, KernelError> {
        let filename = self.space.read_string(filename_va, MAX_FILENAME_LEN)?;
        self.kernel.spawn_process(&filename, arg, return_addr)
    }

    /// Ends the current process with `code` once every other thread of it
    /// has exited.
    pub fn do_process_exit(&self, code: i32) -> ! {
        let pid = self.space.pid;
        let threads = &self.space.threads;
        log::debug!("pid {pid}: thread {} requests exit({code})", self.tid);
        threads
            .wait_until_at_most(threads.lock_table(), 1)
            .unlock();

        log::info!("pid {pid} exits with {code}");
        self.kernel.finish_process(pid);
        Current::exit(code)
    }

    /// Blocks until process `pid` has ended.
    ///
    /// # Errors
    /// - [`KernelError::Deadlock`] if `pid` is the calling process.
    /// - [`KernelError::InvalidArgument`] if `pid` is outside the process
    ///   table.
    pub fn do_wait_process(&self, pid: Pid) -> Result<(), KernelError> {
        if pid == self.space.pid {
            return Err(KernelError::Deadlock);
        }
        self.kernel.processes().wait(pid)
    }

    /// Stops the machine and ends the current thread.
    pub fn do_halt(&self) -> ! {
        log::info!("pid {}: halt requested", self.space.pid);
        self.kernel.halt();
        Current::exit(0)
    }
}
