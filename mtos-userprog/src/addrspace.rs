//! Address space of a user program.
//!
//! An [`AddrSpace`] is built from an executable image. Every virtual page is
//! backed by a frame taken from the [`FrameProvider`] for the whole life of
//! the address space; there is no paging. The address space is laid out as
//! code, initialized data, uninitialized data and finally the stack region,
//! rounded up to whole pages.
//!
//! Besides memory, the address space carries everything its threads share:
//! the [`ThreadManager`], the user semaphores, and the slot it claimed in the
//! process table.

use crate::{
    frame_provider::FrameProvider,
    process_table::{Pid, ProcessTable},
    sync::{Mutex, Semaphore},
    thread_manager::ThreadManager,
};
use bitflags::bitflags;
use mtos::{
    KernelError,
    fs::{Executable, Segment},
    mm::PhysicalMemory,
    syscall::Registers,
};
use std::sync::Arc;

/// Distance between the top of the address space and the initial stack
/// pointer.
pub const STACK_TOP_OFFSET: usize = 16;

bitflags! {
    /// Flags of a page table entry.
    pub struct PteFlags: u32 {
        /// The entry maps a frame.
        const VALID = 1 << 0;
        /// User code may not write the page.
        const READ_ONLY = 1 << 1;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    // Writes by the loader, which may fill read-only pages.
    Load,
}

/// Mapping of one virtual page.
#[derive(Clone, Copy, Debug)]
pub struct TranslationEntry {
    /// Frame backing the page.
    pub physical_page: usize,
    /// Flags of the mapping.
    pub flags: PteFlags,
}

/// Page table owning the frames it maps.
///
/// Dropping the table gives every frame back to the provider.
pub struct PageTable {
    entries: Vec<TranslationEntry>,
    frames: Arc<FrameProvider>,
}

impl PageTable {
    /// Backs `num_pages` pages with fresh zeroed frames.
    pub fn allocate(frames: &Arc<FrameProvider>, num_pages: usize) -> Result<Self, KernelError> {
        let available = frames.num_avail_frame();
        if available < num_pages {
            log::warn!("{num_pages} frames requested, {available} available");
            return Err(KernelError::NoMemory);
        }

        let mut table = Self {
            entries: Vec::with_capacity(num_pages),
            frames: frames.clone(),
        };
        for _ in 0..num_pages {
            let physical_page = frames.get_empty_frame().ok_or(KernelError::NoMemory)?;
            table.entries.push(TranslationEntry {
                physical_page,
                flags: PteFlags::VALID,
            });
        }
        Ok(table)
    }

    /// Number of pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table maps nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry of virtual page `vpn`.
    pub fn get(&self, vpn: usize) -> Option<&TranslationEntry> {
        self.entries.get(vpn)
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for entry in &self.entries {
            if entry.flags.contains(PteFlags::VALID) {
                self.frames.release_frame(entry.physical_page);
            }
        }
    }
}

/// Geometry of an address space.
#[derive(Clone, Copy, Debug)]
pub struct SpaceLayout {
    /// Bytes per page.
    pub page_size: usize,
    /// Bytes of the stack region.
    pub user_stack_size: usize,
    /// Bytes of one thread stack.
    pub thread_stack_size: usize,
}

/// Memory and shared state of one user program.
pub struct AddrSpace {
    /// Process this address space belongs to.
    pub pid: Pid,
    /// Threads running in this address space.
    pub threads: ThreadManager,
    page_table: PageTable,
    memory: Arc<PhysicalMemory>,
    page_size: usize,
    semaphores: Mutex<Vec<Arc<Semaphore>>>,
}

impl AddrSpace {
    /// Loads `executable` into fresh frames and claims a process slot for it.
    ///
    /// Fails without leaking a frame if memory is short or the process table
    /// is full.
    pub fn new(
        executable: &dyn Executable,
        frames: &Arc<FrameProvider>,
        processes: &ProcessTable,
        layout: SpaceLayout,
    ) -> Result<Self, KernelError> {
        let header = executable.header()?;
        let size = header.size() + layout.user_stack_size;
        let num_pages = size.div_ceil(layout.page_size);
        if num_pages > frames.total() {
            log::warn!("image needs {num_pages} pages, machine has {}", frames.total());
            return Err(KernelError::NoMemory);
        }

        let mut space = Self {
            pid: 0,
            threads: ThreadManager::new(
                num_pages * layout.page_size,
                layout.user_stack_size,
                layout.thread_stack_size,
            ),
            page_table: PageTable::allocate(frames, num_pages)?,
            memory: frames.memory().clone(),
            page_size: layout.page_size,
            semaphores: Mutex::new("user semaphores", Vec::new()),
        };
        space.load_segment(executable, &header.code)?;
        space.load_segment(executable, &header.init_data)?;
        space.protect_code(&header.code);

        space.pid = processes.claim()?;
        log::debug!(
            "address space of pid {} uses {num_pages} pages",
            space.pid
        );
        Ok(space)
    }

    fn load_segment(&self, executable: &dyn Executable, segment: &Segment) -> Result<(), KernelError> {
        if segment.size == 0 {
            return Ok(());
        }
        let mut bytes = vec![0; segment.size];
        if executable.read_at(&mut bytes, segment.in_file_addr) != segment.size {
            return Err(KernelError::NoExec);
        }
        self.copy(segment.virtual_addr, bytes.len(), Access::Load, |pa, range| {
            self.memory.write(pa, &bytes[range])
        })
    }

    fn protect_code(&mut self, code: &Segment) {
        let first = code.virtual_addr.div_ceil(self.page_size);
        let end = (code.virtual_addr + code.size) / self.page_size;
        for entry in self.page_table.entries.iter_mut().take(end).skip(first) {
            entry.flags |= PteFlags::READ_ONLY;
        }
    }

    /// Number of pages.
    pub fn num_pages(&self) -> usize {
        self.page_table.len()
    }

    /// Size of the address space in bytes.
    pub fn size(&self) -> usize {
        self.num_pages() * self.page_size
    }

    /// Page table of this address space.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Translates `va` into a physical address.
    pub fn translate(&self, va: usize, write: bool) -> Result<usize, KernelError> {
        let entry = self
            .page_table
            .get(va / self.page_size)
            .filter(|entry| entry.flags.contains(PteFlags::VALID))
            .ok_or(KernelError::BadAddress)?;
        if write && entry.flags.contains(PteFlags::READ_ONLY) {
            return Err(KernelError::InvalidAccess);
        }
        Ok(entry.physical_page * self.page_size + va % self.page_size)
    }

    // Walks `len` bytes from `va` page by page, handing each physical chunk
    // and its range within the buffer to `f`.
    fn copy(
        &self,
        va: usize,
        len: usize,
        access: Access,
        mut f: impl FnMut(usize, std::ops::Range<usize>) -> Result<(), KernelError>,
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < len {
            let addr = va.checked_add(done).ok_or(KernelError::BadAddress)?;
            let chunk = (self.page_size - addr % self.page_size).min(len - done);
            let pa = self.translate(addr, access == Access::Write)?;
            f(pa, done..done + chunk)?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies user memory at `va` into `buf`.
    pub fn read_mem(&self, va: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        let len = buf.len();
        self.copy(va, len, Access::Read, |pa, range| {
            self.memory.read(pa, &mut buf[range])
        })
    }

    /// Copies `data` into user memory at `va`.
    pub fn write_mem(&self, va: usize, data: &[u8]) -> Result<(), KernelError> {
        self.copy(va, data.len(), Access::Write, |pa, range| {
            self.memory.write(pa, &data[range])
        })
    }

    /// Reads a NUL-terminated string of at most `max` bytes at `va`.
    pub fn read_string(&self, va: usize, max: usize) -> Result<String, KernelError> {
        let mut bytes = Vec::new();
        let mut byte = [0];
        loop {
            if bytes.len() == max {
                return Err(KernelError::NameTooLong);
            }
            self.read_mem(va + bytes.len(), &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)
    }

    /// Register state a program starts with: everything zero except the
    /// program counter at 0 and the stack pointer near the top.
    pub fn init_registers(&self) -> Registers {
        let mut regs = Registers::default();
        regs.set_pc(0);
        regs.set_stack_pointer(self.size() - STACK_TOP_OFFSET);
        regs
    }

    /// Creates a user semaphore holding `value` units and returns its handle.
    pub fn sem_init(&self, value: usize) -> usize {
        let mut semaphores = self.semaphores.lock();
        semaphores.push(Arc::new(Semaphore::new(value)));
        semaphores.len() - 1
    }

    /// User semaphore behind `handle`.
    pub fn semaphore(&self, handle: usize) -> Result<Arc<Semaphore>, KernelError> {
        self.semaphores
            .lock()
            .get(handle)
            .cloned()
            .ok_or(KernelError::InvalidArgument)
    }
}
