//! Splitting one request across several slabs

use crate::buffer::Lease;
use crate::error::Result;
use crate::memory::MemorySlab;
use std::sync::Arc;

/// Smallest piece that still lets `remaining` bytes fit in `segments_left` blocks
fn min_piece(remaining: u64, segments_left: usize) -> u64 {
    let segments = segments_left as u64;
    (remaining + segments - 1) / segments
}

/// Collect up to `target` bytes from `slabs` into `leases`
///
/// Each block taken must be at least `ceil(remaining / segments_left)` bytes
/// so the request can never need more than `max_segments` blocks. After every
/// success the scan restarts from the first slab. Returns the number of bytes
/// allocated, which is less than `target` when a full scan finds nothing or
/// the segment budget runs out.
pub(crate) fn allocate_across(
    slabs: &[Arc<MemorySlab>],
    target: u64,
    max_segments: usize,
    leases: &mut Vec<Lease>,
) -> Result<u64> {
    let mut remaining = target;
    let mut segments_left = max_segments;

    'scan: while remaining > 0 && segments_left > 0 {
        let min = min_piece(remaining, segments_left);

        for slab in slabs {
            if slab.largest_free_block() < min {
                continue;
            }
            if let Some(block) = slab.try_allocate_range(min, remaining)? {
                remaining -= block.length;
                segments_left -= 1;
                leases.push(Lease::new(Arc::clone(slab), block));
                continue 'scan;
            }
        }
        break;
    }

    Ok(target - remaining)
}
