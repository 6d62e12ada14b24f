//! Physical frame allocator.
//!
//! The [`FrameProvider`] hands out frames of the machine's
//! [`PhysicalMemory`] one at a time. Instead of returning the lowest free
//! frame, it picks one uniformly at random among all free frames, so that
//! allocations spread over the whole memory instead of piling up at low
//! indices.
//!
//! The selection is a single pass of reservoir sampling over the bitmap:
//! while scanning, the `k`-th free frame replaces the current candidate with
//! probability `1/k`. When the scan ends, every free frame has had the same
//! chance of being chosen.
//!
//! Frame 0 is reserved at construction and never handed out.

use crate::{
    bitmap::BitMap,
    sync::{Mutex, MutexGuard},
};
use mtos::mm::PhysicalMemory;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::Arc;

/// Index of the frame that is never allocated.
pub const RESERVED_FRAME: usize = 0;

struct Frames {
    bitmap: BitMap,
    rng: StdRng,
}

/// Allocator of physical frames.
pub struct FrameProvider {
    memory: Arc<PhysicalMemory>,
    frames: Mutex<Frames>,
}

impl FrameProvider {
    /// Creates a provider over every frame of `memory`, drawing random numbers
    /// from `rng`.
    pub fn new(memory: Arc<PhysicalMemory>, rng: StdRng) -> Self {
        let mut bitmap = BitMap::new(memory.frame_count());
        if !bitmap.is_empty() {
            bitmap.mark(RESERVED_FRAME);
        }
        Self {
            memory,
            frames: Mutex::new("frame provider", Frames { bitmap, rng }),
        }
    }

    /// Creates a provider whose choices are reproducible.
    pub fn with_seed(memory: Arc<PhysicalMemory>, seed: u64) -> Self {
        Self::new(memory, StdRng::seed_from_u64(seed))
    }

    /// Total number of frames, the reserved one included.
    pub fn total(&self) -> usize {
        self.memory.frame_count()
    }

    /// Memory the frames belong to.
    pub fn memory(&self) -> &Arc<PhysicalMemory> {
        &self.memory
    }

    fn lock(&self) -> MutexGuard<'_, Frames> {
        self.frames.lock()
    }

    /// Allocates a free frame chosen uniformly at random and fills it with
    /// zeros.
    ///
    /// Returns `None` when every frame is in use.
    pub fn get_empty_frame(&self) -> Option<usize> {
        let mut guard = self.lock();
        let Frames { bitmap, rng } = &mut *guard;

        let mut seen = 0usize;
        let mut selected = None;
        for frame in bitmap.iter_clear() {
            seen += 1;
            if rng.gen_range(0..seen) == 0 {
                selected = Some(frame);
            }
        }

        let Some(frame) = selected else {
            log::warn!("no free frame");
            return None;
        };
        if let Err(e) = self.memory.zero_frame(frame) {
            log::warn!("frame {frame} is not backed by memory: {e}");
            return None;
        }
        bitmap.mark(frame);
        drop(guard);

        log::debug!("allocated frame {frame}");
        Some(frame)
    }

    /// Returns `frame` to the pool.
    ///
    /// Releasing the reserved frame or a frame out of range is ignored.
    pub fn release_frame(&self, frame: usize) {
        if frame == RESERVED_FRAME || frame >= self.total() {
            log::warn!("ignoring release of frame {frame}");
            return;
        }
        self.lock().bitmap.clear(frame);
        log::debug!("released frame {frame}");
    }

    /// Number of frames that can still be allocated.
    pub fn num_avail_frame(&self) -> usize {
        self.lock().bitmap.num_clear()
    }

    /// Whether at least one frame can still be allocated.
    pub fn is_frame_avail(&self) -> bool {
        self.num_avail_frame() > 0
    }
}
