//! Segment descriptors for vectored I/O

use crate::memory::{MemorySlab, SlabId};
use std::fmt;
use std::io::IoSlice;

/// One physically contiguous piece of a buffer
///
/// Equivalent to an `(array, offset, count)` triple: `offset` is the position
/// inside the slab's backing array. A segment never crosses a block boundary
/// and borrows the buffer it came from, so it cannot outlive it.
#[derive(Clone, Copy)]
pub struct Segment<'a> {
    slab: &'a MemorySlab,
    offset: u64,
    count: u64,
}

impl<'a> Segment<'a> {
    pub(crate) fn new(slab: &'a MemorySlab, offset: u64, count: u64) -> Self {
        debug_assert!(offset + count <= slab.size());
        Self {
            slab,
            offset,
            count,
        }
    }

    /// Slab whose backing array holds the bytes
    pub fn slab_id(&self) -> SlabId {
        self.slab.id()
    }

    /// Start position inside the backing array
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Address of the backing array itself
    pub fn array_ptr(&self) -> *const u8 {
        self.slab.base_ptr()
    }

    /// The bytes covered by this segment
    pub fn as_slice(&self) -> &'a [u8] {
        // SAFETY: the range lies inside a block owned by the borrowed buffer,
        // and the shared borrow rules out writes through that buffer
        unsafe {
            std::slice::from_raw_parts(
                self.slab.base_ptr().add(self.offset as usize),
                self.count as usize,
            )
        }
    }

    /// View suitable for `write_vectored`
    pub fn as_io_slice(&self) -> IoSlice<'a> {
        IoSlice::new(self.as_slice())
    }

    /// Whether the two segments share any byte
    pub fn overlaps(&self, other: &Segment<'_>) -> bool {
        self.slab_id() == other.slab_id()
            && self.offset < other.offset + other.count
            && other.offset < self.offset + self.count
    }
}

impl fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("slab", &self.slab_id())
            .field("offset", &self.offset)
            .field("count", &self.count)
            .finish()
    }
}
