//! Buffers assembled from slab blocks

use super::segment::Segment;
use crate::error::{Error, Result};
use crate::memory::{MemoryBlock, MemorySlab};
use crate::pool::metrics;
use std::io::IoSliceMut;
use std::sync::Arc;
use tracing::warn;

/// A block on loan together with the slab it must go back to
pub(crate) struct Lease {
    pub(crate) slab: Arc<MemorySlab>,
    pub(crate) block: MemoryBlock,
}

impl Lease {
    pub(crate) fn new(slab: Arc<MemorySlab>, block: MemoryBlock) -> Self {
        debug_assert_eq!(slab.id(), block.slab);
        Self { slab, block }
    }

    /// Hand the block back to its slab
    pub(crate) fn release(self) {
        if let Err(e) = self.slab.free(&self.block) {
            warn!(error = %e, block = %self.block, "Failed to return block to slab");
            debug_assert!(false, "failed to return {}: {}", self.block, e);
        }
    }
}

/// A logical byte range made of one or more slab blocks
///
/// Block `0` holds bytes `[0, len0)`, block `1` holds `[len0, len0 + len1)`
/// and so on. The blocks go back to their slabs exactly once, on
/// [`dispose`](Self::dispose) or when the buffer is dropped.
///
/// A zero-length buffer owns no blocks; it keeps a handle on one slab so it
/// can still report a single empty segment.
pub struct ManagedBuffer {
    leases: Vec<Lease>,
    empty_slab: Option<Arc<MemorySlab>>,
    size: u64,
    segment_count: usize,
    disposed: bool,
}

impl ManagedBuffer {
    pub(crate) fn from_leases(leases: Vec<Lease>) -> Self {
        debug_assert!(!leases.is_empty());
        let size = leases.iter().map(|l| l.block.length).sum();
        let segment_count = leases.len();
        Self {
            leases,
            empty_slab: None,
            size,
            segment_count,
            disposed: false,
        }
    }

    pub(crate) fn empty(slab: Arc<MemorySlab>) -> Self {
        Self {
            leases: Vec::new(),
            empty_slab: Some(slab),
            size: 0,
            segment_count: 1,
            disposed: false,
        }
    }

    /// Total size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of segments a full-length [`segments`](Self::segments) call returns
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Blocks backing the buffer, in logical order
    pub fn blocks(&self) -> Vec<MemoryBlock> {
        self.leases.iter().map(|l| l.block).collect()
    }

    /// Segments covering the whole buffer
    pub fn segments(&self) -> Result<Vec<Segment<'_>>> {
        self.get_segments(0, self.size)
    }

    /// Segments covering the first `length` bytes
    pub fn segments_with_len(&self, length: u64) -> Result<Vec<Segment<'_>>> {
        self.get_segments(0, length)
    }

    /// Segments covering `[offset, offset + length)`
    ///
    /// A zero-length buffer always yields one empty segment.
    pub fn get_segments(&self, offset: u64, length: u64) -> Result<Vec<Segment<'_>>> {
        self.ensure_live()?;
        self.check_range(offset, length)?;

        if let Some(slab) = &self.empty_slab {
            return Ok(vec![Segment::new(slab, 0, 0)]);
        }

        let mut segments = Vec::new();
        self.walk(offset, length, |lease, inner, count| {
            segments.push(Segment::new(&lease.slab, lease.block.start + inner, count));
        });
        Ok(segments)
    }

    /// Segments as `IoSlice`s for `write_vectored`
    pub fn io_slices(&self) -> Result<Vec<std::io::IoSlice<'_>>> {
        Ok(self.segments()?.iter().map(|s| s.as_io_slice()).collect())
    }

    /// Mutable views of `[offset, offset + length)`, one per block touched
    ///
    /// A zero-length buffer yields one empty slice, like [`get_segments`](Self::get_segments).
    pub fn get_segments_mut(&mut self, offset: u64, length: u64) -> Result<Vec<&mut [u8]>> {
        self.ensure_live()?;
        self.check_range(offset, length)?;

        if self.empty_slab.is_some() {
            return Ok(vec![<&mut [u8]>::default()]);
        }

        let mut slices = Vec::new();
        self.walk(offset, length, |lease, inner, count| {
            // SAFETY: the block is owned by this buffer, which is borrowed
            // mutably for the lifetime of the slices; ranges never overlap
            let slice = unsafe {
                std::slice::from_raw_parts_mut(
                    lease.slab.base_ptr().add((lease.block.start + inner) as usize),
                    count as usize,
                )
            };
            slices.push(slice);
        });
        Ok(slices)
    }

    /// Whole buffer as `IoSliceMut`s for `read_vectored`
    pub fn io_slices_mut(&mut self) -> Result<Vec<IoSliceMut<'_>>> {
        let size = self.size;
        Ok(self
            .get_segments_mut(0, size)?
            .into_iter()
            .map(IoSliceMut::new)
            .collect())
    }

    /// Copy the whole buffer into `dest`
    pub fn copy_to(&self, dest: &mut [u8]) -> Result<()> {
        self.copy_to_at(dest, 0, self.size)
    }

    /// Copy the first `length` bytes of the buffer into `dest[dest_index..]`
    pub fn copy_to_at(&self, dest: &mut [u8], dest_index: usize, length: u64) -> Result<()> {
        self.ensure_live()?;
        if length > self.size {
            return Err(Error::InvalidArgument(format!(
                "length {} is larger than buffer size {}",
                length, self.size
            )));
        }
        let end = dest_index as u64 + length;
        if end > dest.len() as u64 {
            return Err(Error::InvalidArgument(format!(
                "dest_index + length ({}) is greater than the destination length {}",
                end,
                dest.len()
            )));
        }
        if length == 0 {
            return Ok(());
        }

        let mut copied = dest_index;
        self.walk(0, length, |lease, inner, count| {
            let count = count as usize;
            // SAFETY: the range lies inside a block owned by this buffer
            unsafe {
                lease
                    .slab
                    .read_at(lease.block.start + inner, &mut dest[copied..copied + count]);
            }
            copied += count;
        });
        Ok(())
    }

    /// Copy all of `src` into the start of the buffer
    pub fn fill_with(&mut self, src: &[u8]) -> Result<()> {
        self.fill_with_from(src, 0, src.len() as u64)
    }

    /// Copy `src[src_index..src_index + length]` into the start of the buffer
    pub fn fill_with_from(&mut self, src: &[u8], src_index: usize, length: u64) -> Result<()> {
        self.ensure_live()?;
        if length > self.size {
            return Err(Error::InvalidArgument(format!(
                "length {} will not fit in buffer of size {}",
                length, self.size
            )));
        }
        let end = src_index as u64 + length;
        if end > src.len() as u64 {
            return Err(Error::InvalidArgument(format!(
                "src_index + length ({}) is greater than the source length {}",
                end,
                src.len()
            )));
        }
        if length == 0 {
            return Ok(());
        }

        let mut copied = src_index;
        self.walk(0, length, |lease, inner, count| {
            let count = count as usize;
            // SAFETY: the range lies inside a block owned by this buffer
            unsafe {
                lease
                    .slab
                    .write_at(lease.block.start + inner, &src[copied..copied + count]);
            }
            copied += count;
        });
        Ok(())
    }

    /// Return every block to its slab
    ///
    /// Safe to call more than once; only the first call releases anything.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.empty_slab = None;

        if !self.leases.is_empty() {
            for lease in self.leases.drain(..) {
                lease.release();
            }
            metrics::record_buffer_released();
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        if length > self.size {
            return Err(Error::InvalidArgument(format!(
                "length {} is larger than buffer size {}",
                length, self.size
            )));
        }
        if offset >= self.size && self.size != 0 {
            return Err(Error::InvalidArgument(format!(
                "offset {} is outside buffer of size {}",
                offset, self.size
            )));
        }
        if self.size != 0 && offset + length > self.size {
            return Err(Error::InvalidArgument(format!(
                "offset + length ({}) runs past buffer size {}",
                offset + length,
                self.size
            )));
        }
        Ok(())
    }

    /// Visit `(lease, offset inside block, count)` for each block piece
    /// covering the logical range `[offset, offset + length)`
    fn walk<'s, F>(&'s self, offset: u64, length: u64, mut visit: F)
    where
        F: FnMut(&'s Lease, u64, u64),
    {
        let mut scanned = 0u64;
        let mut remaining = length;
        let mut first = true;

        for lease in &self.leases {
            let block_len = lease.block.length;
            if first {
                if offset >= scanned + block_len {
                    scanned += block_len;
                    continue;
                }
                first = false;
                let inner = offset - scanned;
                let count = remaining.min(block_len - inner);
                visit(lease, inner, count);
                remaining -= count;
            } else {
                let count = remaining.min(block_len);
                visit(lease, 0, count);
                remaining -= count;
            }
            if remaining == 0 {
                break;
            }
        }
    }
}

impl Drop for ManagedBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedBuffer")
            .field("size", &self.size)
            .field("blocks", &self.blocks())
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const L: u64 = 100;

    /// Buffer of three L-byte blocks taken from three different slabs
    fn three_block_buffer() -> Result<ManagedBuffer> {
        let mut leases = Vec::new();
        for _ in 0..3 {
            let slab = Arc::new(MemorySlab::new(4 * L)?);
            // Skip the first L bytes so segment offsets differ from logical ones
            let _pad = slab.try_allocate(L)?.unwrap();
            let block = slab.try_allocate(L)?.unwrap();
            leases.push(Lease::new(slab, block));
        }
        Ok(ManagedBuffer::from_leases(leases))
    }

    #[test]
    fn test_size_and_segment_count() -> Result<()> {
        let buffer = three_block_buffer()?;
        assert_eq!(buffer.size(), 3 * L);
        assert_eq!(buffer.segment_count(), 3);
        assert!(!buffer.is_disposed());
        Ok(())
    }

    #[test]
    fn test_segments_split_at_block_boundaries() -> Result<()> {
        let buffer = three_block_buffer()?;
        let segments = buffer.get_segments(1, 2 * L)?;

        let counts: Vec<usize> = segments.iter().map(|s| s.len()).collect();
        assert_eq!(counts, vec![(L - 1) as usize, L as usize, 1]);
        assert_eq!(counts.iter().sum::<usize>(), (2 * L) as usize);
        assert_eq!(segments[0].offset(), L + 1);
        assert_eq!(segments[1].offset(), L);
        Ok(())
    }

    #[test]
    fn test_segments_within_one_block() -> Result<()> {
        let buffer = three_block_buffer()?;
        let segments = buffer.get_segments(L + 10, 20)?;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].offset(), L + 10);
        assert_eq!(segments[0].len(), 20);
        Ok(())
    }

    #[test]
    fn test_segments_bounds() -> Result<()> {
        let buffer = three_block_buffer()?;
        assert!(buffer.get_segments(0, 3 * L + 1).is_err());
        assert!(buffer.get_segments(3 * L, 0).is_err());
        assert!(buffer.get_segments(2 * L, 2 * L).is_err());
        assert_eq!(buffer.segments_with_len(L)?.len(), 1);
        assert_eq!(buffer.segments()?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_empty_buffer_has_one_empty_segment() -> Result<()> {
        let slab = Arc::new(MemorySlab::new(64)?);
        let buffer = ManagedBuffer::empty(slab);

        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.segment_count(), 1);
        let segments = buffer.get_segments(5, 0)?;
        assert_eq!(segments.len(), 1);
        assert!(segments[0].is_empty());
        Ok(())
    }

    #[test]
    fn test_empty_buffer_has_one_empty_mutable_segment() -> Result<()> {
        let slab = Arc::new(MemorySlab::new(64)?);
        let mut buffer = ManagedBuffer::empty(slab);

        let slices = buffer.get_segments_mut(0, 0)?;
        assert_eq!(slices.len(), 1);
        assert!(slices[0].is_empty());

        let io = buffer.io_slices_mut()?;
        assert_eq!(io.len(), 1);
        assert!(io[0].is_empty());
        assert_eq!(buffer.io_slices()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_fill_and_copy_across_blocks() -> Result<()> {
        let mut buffer = three_block_buffer()?;
        let data: Vec<u8> = (0..3 * L).map(|i| i as u8).collect();

        buffer.fill_with(&data)?;
        let mut out = vec![0u8; (3 * L) as usize];
        buffer.copy_to(&mut out)?;
        assert_eq!(out, data);

        // Contents are visible through the segments as well
        let joined: Vec<u8> = buffer
            .segments()?
            .iter()
            .flat_map(|s| s.as_slice().iter().copied())
            .collect();
        assert_eq!(joined, data);
        Ok(())
    }

    #[test]
    fn test_partial_copy_with_indices() -> Result<()> {
        let mut buffer = three_block_buffer()?;
        let src: Vec<u8> = (0..200).map(|i| (i * 3) as u8).collect();
        buffer.fill_with_from(&src, 50, 150)?;

        let mut dest = vec![0xFFu8; 160];
        buffer.copy_to_at(&mut dest, 10, 150)?;
        assert_eq!(&dest[..10], &[0xFF; 10]);
        assert_eq!(&dest[10..], &src[50..200]);
        Ok(())
    }

    #[test]
    fn test_copy_argument_checks() -> Result<()> {
        let mut buffer = three_block_buffer()?;
        let mut small = vec![0u8; 10];

        assert!(buffer.copy_to(&mut small).is_err());
        assert!(buffer.copy_to_at(&mut small, 5, 6).is_err());
        assert!(buffer.copy_to_at(&mut small, 0, 3 * L + 1).is_err());
        assert!(buffer.fill_with(&vec![1u8; (3 * L + 1) as usize]).is_err());
        assert!(buffer.fill_with_from(&small, 8, 5).is_err());
        Ok(())
    }

    #[test]
    fn test_io_slices_mut_write_through() -> Result<()> {
        let mut buffer = three_block_buffer()?;
        for slice in buffer.io_slices_mut()?.iter_mut() {
            slice.fill(7);
        }

        let mut out = vec![0u8; (3 * L) as usize];
        buffer.copy_to(&mut out)?;
        assert!(out.iter().all(|&b| b == 7));
        assert_eq!(buffer.io_slices()?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_dispose_is_idempotent_and_returns_blocks() -> Result<()> {
        let slab = Arc::new(MemorySlab::new(1024)?);
        let block = slab.try_allocate(512)?.unwrap();
        let mut buffer = ManagedBuffer::from_leases(vec![Lease::new(slab.clone(), block)]);
        assert_eq!(slab.largest_free_block(), 512);

        buffer.dispose();
        buffer.dispose();
        assert!(buffer.is_disposed());
        assert!(slab.is_fully_free());
        assert_eq!(slab.free_block_count(), 1);

        assert!(matches!(buffer.segments(), Err(Error::Disposed)));
        assert!(matches!(buffer.fill_with(b"x"), Err(Error::Disposed)));
        assert!(matches!(buffer.copy_to(&mut [0u8; 4]), Err(Error::Disposed)));
        Ok(())
    }

    #[test]
    fn test_drop_returns_blocks() -> Result<()> {
        let slab = Arc::new(MemorySlab::new(1024)?);
        {
            let block = slab.try_allocate(1000)?.unwrap();
            let _buffer = ManagedBuffer::from_leases(vec![Lease::new(slab.clone(), block)]);
            assert!(!slab.is_fully_free());
        }
        assert!(slab.is_fully_free());
        Ok(())
    }
}
