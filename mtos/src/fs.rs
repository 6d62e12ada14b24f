//! Executable images and the file system that hands them out.
//!
//! The loader does not parse any executable format. It asks an
//! [`Executable`] for its [`ImageHeader`], which says where each segment lives
//! in the file and where it belongs in the address space, and then copies the
//! bytes with [`Executable::read_at`].

use crate::KernelError;
use std::{collections::BTreeMap, sync::Arc};

/// A contiguous part of an executable image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    /// Location of the segment in the address space.
    pub virtual_addr: usize,
    /// Location of the segment in the image.
    pub in_file_addr: usize,
    /// Size in bytes.
    pub size: usize,
}

/// Layout of an executable image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageHeader {
    /// Program code.
    pub code: Segment,
    /// Initialized data.
    pub init_data: Segment,
    /// Zero-filled data; has no bytes in the image.
    pub uninit_data: Segment,
}

impl ImageHeader {
    /// Bytes of address space the segments need.
    pub fn size(&self) -> usize {
        self.code.size + self.init_data.size + self.uninit_data.size
    }
}

/// A byte-addressable executable image.
pub trait Executable: Send + Sync {
    /// Layout of this image.
    fn header(&self) -> Result<ImageHeader, KernelError>;

    /// Read up to `buf.len()` bytes starting at `position`.
    ///
    /// Returns the number of bytes read, which is short only at the end of
    /// the image.
    fn read_at(&self, buf: &mut [u8], position: usize) -> usize;
}

/// A file system able to open executables by name.
pub trait FileSystem: Send + Sync {
    /// Open the executable called `name`.
    fn open(&self, name: &str) -> Option<Arc<dyn Executable>>;
}

/// An executable held in memory.
///
/// Code is placed at virtual address 0 and initialized data right after it,
/// aligned to 8 bytes. Uninitialized data follows the initialized data.
#[derive(Clone, Debug)]
pub struct RamImage {
    header: ImageHeader,
    bytes: Vec<u8>,
}

impl RamImage {
    /// Build an image out of code bytes, data bytes and a bss size.
    pub fn new(code: &[u8], data: &[u8], bss: usize) -> Self {
        let data_va = code.len().next_multiple_of(8);
        let header = ImageHeader {
            code: Segment {
                virtual_addr: 0,
                in_file_addr: 0,
                size: code.len(),
            },
            init_data: Segment {
                virtual_addr: data_va,
                in_file_addr: code.len(),
                size: data.len(),
            },
            uninit_data: Segment {
                virtual_addr: data_va + data.len(),
                in_file_addr: 0,
                size: bss,
            },
        };
        let mut bytes = Vec::with_capacity(code.len() + data.len());
        bytes.extend_from_slice(code);
        bytes.extend_from_slice(data);
        Self { header, bytes }
    }
}

impl Executable for RamImage {
    fn header(&self) -> Result<ImageHeader, KernelError> {
        Ok(self.header)
    }

    fn read_at(&self, buf: &mut [u8], position: usize) -> usize {
        let Some(src) = self.bytes.get(position..) else {
            return 0;
        };
        let len = src.len().min(buf.len());
        buf[..len].copy_from_slice(&src[..len]);
        len
    }
}

/// An in-memory file system.
#[derive(Default, Clone)]
pub struct RamFs {
    files: BTreeMap<String, Arc<RamImage>>,
}

impl RamFs {
    /// Create an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `image` under `name`, replacing any previous file.
    pub fn insert(&mut self, name: impl Into<String>, image: RamImage) -> &mut Self {
        self.files.insert(name.into(), Arc::new(image));
        self
    }
}

impl FileSystem for RamFs {
    fn open(&self, name: &str) -> Option<Arc<dyn Executable>> {
        self.files
            .get(name)
            .map(|image| image.clone() as Arc<dyn Executable>)
    }
}
