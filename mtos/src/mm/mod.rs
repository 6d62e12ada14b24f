//! Memory Management.
//!
//! The simulated machine owns a flat array of physical memory, divided into
//! frames of a fixed page size. Physical addresses index this array
//! directly. Deciding which frame belongs to whom is the kernel's business;
//! this module only offers bounds-checked byte access.
//!
//! Bytes are stored as atomics so that threads of one address space may touch
//! the same frame concurrently. Ordering between such accesses is the duty
//! of the user program's own synchronization.

use crate::KernelError;
use std::sync::atomic::{AtomicU8, Ordering};

/// Physical memory of the machine.
pub struct PhysicalMemory {
    page_size: usize,
    bytes: Box<[AtomicU8]>,
}

impl PhysicalMemory {
    /// Create `frames` zero-filled frames of `page_size` bytes each.
    pub fn new(frames: usize, page_size: usize) -> Self {
        Self {
            page_size,
            bytes: (0..frames * page_size).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Size of a frame in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of frames.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.bytes.len() / self.page_size
    }

    fn range(&self, pa: usize, len: usize) -> Result<&[AtomicU8], KernelError> {
        let end = pa.checked_add(len).ok_or(KernelError::BadAddress)?;
        self.bytes.get(pa..end).ok_or(KernelError::BadAddress)
    }

    /// Fill frame `frame` with zeros.
    pub fn zero_frame(&self, frame: usize) -> Result<(), KernelError> {
        let pa = frame
            .checked_mul(self.page_size)
            .ok_or(KernelError::BadAddress)?;
        self.range(pa, self.page_size)?
            .iter()
            .for_each(|b| b.store(0, Ordering::Relaxed));
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at physical address `pa` into `buf`.
    pub fn read(&self, pa: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        let src = self.range(pa, buf.len())?;
        for (dst, src) in buf.iter_mut().zip(src) {
            *dst = src.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy `data` to physical address `pa`.
    pub fn write(&self, pa: usize, data: &[u8]) -> Result<(), KernelError> {
        let dst = self.range(pa, data.len())?;
        for (dst, src) in dst.iter().zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
        Ok(())
    }
}
