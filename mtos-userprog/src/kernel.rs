//! The kernel context.
//!
//! A [`Kernel`] owns every machine-wide resource: physical memory and its
//! frame provider, the process table, the CPU that runs user code, and the
//! file system programs are loaded from. It is created once with
//! [`Kernel::builder`] and shared by reference-counted handles with every
//! kernel thread that needs it; nothing in this crate reaches for global
//! state.

use crate::{
    addrspace::{AddrSpace, SpaceLayout},
    frame_provider::FrameProvider,
    process_table::{Pid, ProcessTable},
    sync::{Condition, Mutex},
    thread_manager::MAIN_THREAD_ID,
    userthread::{ThreadParams, UserThread},
};
use mtos::{KernelError, fs::FileSystem, machine::Machine, mm::PhysicalMemory, thread::ThreadBuilder};
use rand::{SeedableRng, rngs::StdRng};
use std::sync::Arc;

/// A builder for the kernel configuration.
///
/// Every setting has a default, so `Kernel::builder().build(machine, fs)`
/// yields a working kernel.
#[derive(Clone, Debug)]
pub struct KernelBuilder {
    phys_pages: usize,
    page_size: usize,
    user_stack_size: usize,
    thread_stack_pages: usize,
    max_processes: usize,
    seed: Option<u64>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self {
            phys_pages: 128,
            page_size: 128,
            user_stack_size: 1024,
            thread_stack_pages: 2,
            max_processes: 64,
            seed: None,
        }
    }
}

impl KernelBuilder {
    /// Sets the number of physical frames.
    pub fn phys_pages(mut self, phys_pages: usize) -> Self {
        self.phys_pages = phys_pages;
        self
    }

    /// Sets the size of a page and of a frame.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the size of the stack region of every address space.
    pub fn user_stack_size(mut self, user_stack_size: usize) -> Self {
        self.user_stack_size = user_stack_size;
        self
    }

    /// Sets the number of pages of one thread stack.
    pub fn thread_stack_pages(mut self, thread_stack_pages: usize) -> Self {
        self.thread_stack_pages = thread_stack_pages;
        self
    }

    /// Sets how many processes may exist at once.
    pub fn max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    /// Makes frame selection reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the kernel.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if a size is zero.
    pub fn build(
        self,
        machine: Arc<dyn Machine>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Arc<Kernel>, KernelError> {
        if self.page_size == 0 || self.thread_stack_pages == 0 || self.phys_pages == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let memory = Arc::new(PhysicalMemory::new(self.phys_pages, self.page_size));
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let layout = SpaceLayout {
            page_size: self.page_size,
            user_stack_size: self.user_stack_size,
            thread_stack_size: self.thread_stack_pages * self.page_size,
        };
        log::info!(
            "kernel: {} frames of {} bytes, {} process slots",
            self.phys_pages,
            self.page_size,
            self.max_processes
        );
        Ok(Arc::new(Kernel {
            layout,
            machine,
            fs,
            frames: Arc::new(FrameProvider::new(memory, rng)),
            processes: ProcessTable::new(self.max_processes),
            halted: Mutex::new("halt", false),
            halt_condition: Condition::new(),
        }))
    }
}

/// Machine-wide kernel state.
pub struct Kernel {
    layout: SpaceLayout,
    pub(crate) machine: Arc<dyn Machine>,
    fs: Arc<dyn FileSystem>,
    frames: Arc<FrameProvider>,
    processes: ProcessTable,
    halted: Mutex<bool>,
    halt_condition: Condition,
}

impl Kernel {
    /// Starts configuring a kernel.
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    /// Geometry of every address space.
    pub fn layout(&self) -> SpaceLayout {
        self.layout
    }

    /// The frame provider.
    pub fn frames(&self) -> &Arc<FrameProvider> {
        &self.frames
    }

    /// The process table.
    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    /// Boots the first program.
    pub fn start_process(self: &Arc<Self>, filename: &str) -> Result<Pid, KernelError> {
        self.spawn_process(filename, 0, 0)
    }

    /// Loads `filename` into a new address space and starts its initial
    /// thread with `arg` as argument and `return_addr` as return address.
    ///
    /// The initial thread enters through the program's start routine, which
    /// ends the process itself once `main` returns, so `return_addr` is
    /// loaded into the return address register but never jumped to.
    pub fn spawn_process(
        self: &Arc<Self>,
        filename: &str,
        arg: usize,
        return_addr: usize,
    ) -> Result<Pid, KernelError> {
        let executable = self.fs.open(filename).ok_or_else(|| {
            log::warn!("cannot open `{filename}`");
            KernelError::NoSuchEntry
        })?;
        let space = Arc::new(AddrSpace::new(
            executable.as_ref(),
            &self.frames,
            &self.processes,
            self.layout,
        )?);
        let pid = space.pid;

        // Count the process before it can run, so that it cannot finish
        // before being counted.
        self.processes.process_started();
        let main = UserThread::new(self.clone(), space, MAIN_THREAD_ID, None);
        let params = ThreadParams {
            function: 0,
            arg,
            return_addr,
        };
        if let Err(e) = ThreadBuilder::new(format!("{filename} (pid {pid})"))
            .spawn(move || main.run(params))
        {
            self.processes.process_finished();
            self.processes.release(pid);
            return Err(e);
        }
        log::info!("started `{filename}` as pid {pid}");
        Ok(pid)
    }

    /// Accounts for the end of process `pid`.
    ///
    /// The last process to finish halts the machine; otherwise the slot of
    /// `pid` is released and its waiters are woken.
    pub(crate) fn finish_process(&self, pid: Pid) {
        let remaining = self.processes.process_finished();
        log::info!("pid {pid} finished, {remaining} left");
        if remaining == 0 {
            self.halt();
        } else {
            self.processes.release(pid);
        }
    }

    /// Stops the machine.
    pub fn halt(&self) {
        let mut halted = self.halted.lock();
        if !*halted {
            log::info!("machine halting");
            *halted = true;
        }
        self.halt_condition.broadcast_locked(&mut halted);
    }

    /// Whether the machine has halted.
    pub fn is_halted(&self) -> bool {
        *self.halted.lock()
    }

    /// Blocks until the machine halts.
    pub fn wait_for_halt(&self) {
        let halted = self.halted.lock();
        self.halt_condition
            .wait_while(halted, |halted| !*halted)
            .unlock();
    }
}
