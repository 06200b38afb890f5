//! Memory slab: one large backing array plus its free-block index

use super::block::{MemoryBlock, SlabId};
use super::free_index::FreeBlockIndex;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, Weak};
use tracing::{debug, warn};

static NEXT_SLAB_ID: AtomicU64 = AtomicU64::new(0);

/// Receives a callback when a slab becomes entirely free
///
/// Called after the slab has released its own lock, so implementations may
/// take their own locks (including ones that read other slabs).
pub trait SlabObserver: Send + Sync {
    fn slab_emptied(&self, slab: SlabId);
}

/// Heap array that outlives every block carved from it
struct Backing {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: Backing is Send + Sync because:
// - the array is only reached through blocks handed out by the slab lock
// - live blocks never overlap, so no two owners touch the same byte
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
    fn allocate(len: usize) -> Result<Self> {
        let mut data: Vec<u8> = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            Error::AllocationFailed(format!("cannot reserve {} bytes for slab: {}", len, e))
        })?;
        data.resize(len, 0);

        let raw = Box::into_raw(data.into_boxed_slice()) as *mut u8;
        // SAFETY: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(raw) };
        Ok(Self { ptr, len })
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from the boxed slice leaked in `allocate`
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

#[derive(Debug)]
struct SlabState {
    index: FreeBlockIndex,
    /// Set once the pool evicts the slab; nothing is allocated afterwards
    retired: bool,
}

/// A large fixed-length region from which variable-length blocks are allocated
///
/// All index mutation happens under one lock per slab. The largest free block
/// length is mirrored in an atomic so callers can reject a slab without taking
/// the lock; a positive answer is always re-checked under the lock.
pub struct MemorySlab {
    id: SlabId,
    size: u64,
    backing: Backing,
    state: Mutex<SlabState>,
    largest: AtomicU64,
    observer: OnceLock<Weak<dyn SlabObserver>>,
}

impl MemorySlab {
    /// Create a slab with nobody to notify when it empties
    pub fn new(size: u64) -> Result<Self> {
        Self::build(size, None)
    }

    /// Create a slab that reports to `observer` whenever it becomes fully free
    pub fn with_observer(size: u64, observer: Weak<dyn SlabObserver>) -> Result<Self> {
        Self::build(size, Some(observer))
    }

    fn build(size: u64, observer: Option<Weak<dyn SlabObserver>>) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "slab size must be greater than 0".to_string(),
            ));
        }
        let len = usize::try_from(size).map_err(|_| {
            Error::AllocationFailed(format!("slab size {} exceeds the address space", size))
        })?;

        let backing = Backing::allocate(len)?;
        let id = SlabId(NEXT_SLAB_ID.fetch_add(1, Ordering::Relaxed));
        debug!(%id, size, "Created memory slab");

        let cell = OnceLock::new();
        if let Some(observer) = observer {
            let _ = cell.set(observer);
        }

        Ok(Self {
            id,
            size,
            backing,
            state: Mutex::new(SlabState {
                index: FreeBlockIndex::new(size),
                retired: false,
            }),
            largest: AtomicU64::new(size),
            observer: cell,
        })
    }

    /// Attach an observer to a slab created without one
    ///
    /// Returns false if the slab already reports to someone.
    pub fn set_observer(&self, observer: Weak<dyn SlabObserver>) -> bool {
        self.observer.set(observer).is_ok()
    }

    /// Unique slab identifier
    pub fn id(&self) -> SlabId {
        self.id
    }

    /// Size of the slab in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last known largest free block length (lock-free, may be stale)
    pub fn largest_free_block(&self) -> u64 {
        self.largest.load(Ordering::Acquire)
    }

    /// Whether no block is currently on loan
    pub fn is_fully_free(&self) -> bool {
        self.largest_free_block() == self.size
    }

    /// Total free bytes (takes the slab lock)
    pub fn free_bytes(&self) -> u64 {
        self.state.lock().index.free_bytes()
    }

    /// Number of separate free ranges (takes the slab lock)
    pub fn free_block_count(&self) -> usize {
        self.state.lock().index.block_count()
    }

    /// Whether the slab has been evicted from its pool
    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// Allocate exactly `length` bytes
    pub fn try_allocate(&self, length: u64) -> Result<Option<MemoryBlock>> {
        if length == 0 {
            return Err(Error::InvalidArgument(
                "length must be greater than 0".to_string(),
            ));
        }
        self.try_allocate_range(length, length)
    }

    /// Allocate between `min_length` and `max_length` bytes (both inclusive)
    ///
    /// Useful when several threads are working the slab and the caller wants
    /// "as much as possible, up to `max_length`". The smallest block holding
    /// `max_length` is used when one exists, otherwise the largest free block.
    pub fn try_allocate_range(
        &self,
        min_length: u64,
        max_length: u64,
    ) -> Result<Option<MemoryBlock>> {
        if min_length == 0 {
            return Err(Error::InvalidArgument(
                "min_length must be greater than 0".to_string(),
            ));
        }
        if min_length > max_length {
            return Err(Error::InvalidArgument(format!(
                "min_length {} is greater than max_length {}",
                min_length, max_length
            )));
        }

        // Advisory only, re-checked below
        if self.largest_free_block() < min_length {
            return Ok(None);
        }

        let mut state = self.state.lock();
        if state.retired {
            return Ok(None);
        }

        let taken = state.index.take(min_length, max_length);
        self.largest.store(state.index.largest(), Ordering::Release);
        drop(state);

        Ok(taken.map(|(start, length)| {
            let block = MemoryBlock::new(self.id, start, length);
            debug!(%block, "Allocated block");
            block
        }))
    }

    /// Return an allocated block to the slab
    ///
    /// Must not be called while holding a lock the observer may take.
    pub fn free(&self, block: &MemoryBlock) -> Result<()> {
        if block.slab != self.id {
            return Err(Error::InvalidArgument(format!(
                "{} does not belong to {}",
                block, self.id
            )));
        }

        let emptied = {
            let mut state = self.state.lock();
            state
                .index
                .release(block.start, block.length)
                .map_err(|e| {
                    Error::InvalidArgument(format!(
                        "{} overlaps free memory (start={}, len={}); double free?",
                        block, e.start, e.length
                    ))
                })?;
            let largest = state.index.largest();
            self.largest.store(largest, Ordering::Release);
            largest == self.size && !state.retired
        };

        debug!(%block, "Freed block");

        if emptied {
            if let Some(observer) = self.observer.get().and_then(Weak::upgrade) {
                observer.slab_emptied(self.id);
            }
        }
        Ok(())
    }

    /// Mark the slab as evicted if it is entirely free
    ///
    /// Returns false when a block is on loan, in which case the slab stays usable.
    pub fn retire(&self) -> bool {
        let mut state = self.state.lock();
        if state.retired {
            return true;
        }
        if !state.index.is_fully_free() {
            warn!(id = %self.id, "Refusing to retire slab with outstanding blocks");
            return false;
        }
        state.retired = true;
        self.largest.store(0, Ordering::Release);
        true
    }

    /// Free ranges ordered by start offset
    pub fn free_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().index.ranges()
    }

    /// Base address of the backing array
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.backing.ptr.as_ptr()
    }

    /// Copy `dst.len()` bytes starting at slab offset `start` into `dst`
    ///
    /// # Safety
    /// `[start, start + dst.len())` must lie inside a block the caller holds.
    pub(crate) unsafe fn read_at(&self, start: u64, dst: &mut [u8]) {
        debug_assert!(start as usize + dst.len() <= self.backing.len);
        // SAFETY: range is in bounds and owned by the caller's block
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base_ptr().add(start as usize),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
    }

    /// Copy `src` into the slab starting at offset `start`
    ///
    /// # Safety
    /// `[start, start + src.len())` must lie inside a block the caller holds.
    pub(crate) unsafe fn write_at(&self, start: u64, src: &[u8]) {
        debug_assert!(start as usize + src.len() <= self.backing.len);
        // SAFETY: range is in bounds and owned by the caller's block
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.base_ptr().add(start as usize),
                src.len(),
            );
        }
    }
}

impl std::fmt::Debug for MemorySlab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySlab")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("largest_free_block", &self.largest_free_block())
            .finish()
    }
}
