//! Block descriptors for slab memory

use std::fmt;

/// Unique identifier of a slab within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlabId(pub u64);

impl fmt::Display for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slab#{}", self.0)
    }
}

/// A contiguous range `[start, start + length)` inside one slab
///
/// Blocks carry no behaviour. Whoever holds one owns the range: the slab's
/// free index while it is free, a buffer while it is on loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryBlock {
    /// Slab the range belongs to
    pub slab: SlabId,
    /// Offset of the first byte in the slab
    pub start: u64,
    /// Length in bytes (never zero)
    pub length: u64,
}

impl MemoryBlock {
    /// Create a new block descriptor
    pub fn new(slab: SlabId, start: u64, length: u64) -> Self {
        debug_assert!(length > 0, "memory blocks cannot be empty");
        Self {
            slab,
            start,
            length,
        }
    }

    /// Offset of the last byte in the slab
    pub fn end(&self) -> u64 {
        self.start + self.length - 1
    }

    /// Check whether `other` starts right after this block ends
    pub fn precedes(&self, other: &MemoryBlock) -> bool {
        self.slab == other.slab && self.end() + 1 == other.start
    }
}

impl fmt::Display for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({}, start={}, len={})",
            self.slab, self.start, self.length
        )
    }
}
