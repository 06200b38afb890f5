//! Point-in-time pool statistics

use crate::memory::MemorySlab;
use serde::Serialize;
use std::sync::Arc;

/// Statistics for a buffer pool
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub slab_count: usize,
    /// Slabs with nothing on loan
    pub empty_slabs: usize,
    /// Sum of all slab sizes
    pub capacity: u64,
    pub free_bytes: u64,
    /// Largest block a single slab could hand out right now
    pub largest_free_block: u64,
}

impl PoolStats {
    pub(crate) fn collect(slabs: &[Arc<MemorySlab>]) -> Self {
        let mut stats = PoolStats::default();
        for slab in slabs {
            stats.slab_count += 1;
            stats.capacity += slab.size();
            stats.free_bytes += slab.free_bytes();
            stats.largest_free_block = stats.largest_free_block.max(slab.largest_free_block());
            if slab.is_fully_free() {
                stats.empty_slabs += 1;
            }
        }
        stats
    }

    /// Bytes currently on loan
    pub fn used_bytes(&self) -> u64 {
        self.capacity - self.free_bytes
    }

    /// Fraction of capacity on loan, 0.0 to 1.0
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 / self.capacity as f64
    }
}
