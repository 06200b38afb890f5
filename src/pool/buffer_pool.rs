//! Buffer pool: a growable set of slabs that hands out managed buffers

use super::config::{PoolConfig, MAX_SEGMENTS_PER_BUFFER};
use super::metrics;
use super::placement::allocate_across;
use super::stats::PoolStats;
use crate::buffer::{Lease, ManagedBuffer};
use crate::error::{Error, Result};
use crate::memory::{MemorySlab, SlabId, SlabObserver};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Thread-safe pool of slab-backed buffers
///
/// Cloning is cheap and every clone refers to the same slabs.
///
/// ```text
/// get_buffer(n)
///   1. fast path:   one slab only, contiguous block, no list lock
///   2. scan:        split across existing slabs (≤ 16 blocks)
///   3. grow:        under the creation lock add slabs for the remainder,
///                   then top up to `growth_slabs` new slabs
/// ```
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    config: PoolConfig,
    slab_size: u64,
    /// Slab list; slab 0 is never evicted
    slabs: RwLock<Vec<Arc<MemorySlab>>>,
    first_slab: Arc<MemorySlab>,
    /// Held while slabs are being created
    grow_lock: Mutex<()>,
    /// Hint that the list holds exactly one slab
    single_slab: AtomicBool,
    /// Handed to every slab so frees can trigger a shrink
    observer: Weak<dyn SlabObserver>,
}

impl BufferPool {
    /// Create a pool of `initial_slabs` slabs of `slab_size` bytes that grows
    /// by `growth_slabs` slabs at a time
    pub fn new(slab_size: u64, initial_slabs: usize, growth_slabs: usize) -> Result<Self> {
        Self::with_config(PoolConfig::new(slab_size, initial_slabs, growth_slabs))
    }

    /// Create a pool from a validated configuration
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let slab_size = config.effective_slab_size();

        let mut slabs = Vec::with_capacity(config.initial_slabs);
        for _ in 0..config.initial_slabs {
            slabs.push(Arc::new(MemorySlab::new(slab_size)?));
        }
        let first_slab = Arc::clone(&slabs[0]);
        let single_slab = slabs.len() == 1;

        let shared = Arc::new_cyclic(|weak: &Weak<PoolShared>| {
            let observer: Weak<dyn SlabObserver> = weak.clone();
            PoolShared {
                config: config.clone(),
                slab_size,
                slabs: RwLock::new(slabs),
                first_slab,
                grow_lock: Mutex::new(()),
                single_slab: AtomicBool::new(single_slab),
                observer,
            }
        });

        for slab in shared.slabs.read().iter() {
            slab.set_observer(shared.observer.clone());
        }
        metrics::record_slabs_created(config.initial_slabs);

        info!(
            slab_size,
            initial_slabs = config.initial_slabs,
            growth_slabs = config.growth_slabs,
            max_slabs = ?config.max_slabs,
            "Created buffer pool"
        );

        Ok(Self { shared })
    }

    /// Get a buffer of exactly `size` bytes
    pub fn get_buffer(&self, size: u64) -> Result<ManagedBuffer> {
        self.get_buffer_filled(size, &[])
    }

    /// Get a buffer of `size` bytes whose first bytes are a copy of `content`
    ///
    /// An empty `content` leaves the buffer as it came from the slab.
    pub fn get_buffer_filled(&self, size: u64, content: &[u8]) -> Result<ManagedBuffer> {
        if content.len() as u64 > size {
            return Err(Error::InvalidArgument(format!(
                "content length {} is greater than buffer size {}",
                content.len(),
                size
            )));
        }

        if size == 0 {
            return Ok(ManagedBuffer::empty(Arc::clone(&self.shared.first_slab)));
        }

        let leases = self.shared.allocate(size)?;
        let mut buffer = ManagedBuffer::from_leases(leases);
        if !content.is_empty() {
            buffer.fill_with(content)?;
        }

        metrics::record_buffer_issued(size);
        debug!(size, segments = buffer.segment_count(), "Issued buffer");
        Ok(buffer)
    }

    /// Evict one empty slab if more than `initial_slabs` are empty
    ///
    /// Runs automatically whenever a slab becomes empty. Returns true if a
    /// slab was evicted.
    pub fn try_shrink(&self) -> bool {
        self.shared.try_shrink()
    }

    /// Slab size in use (the requested size clamped up to the minimum)
    pub fn slab_size(&self) -> u64 {
        self.shared.slab_size
    }

    pub fn initial_slabs(&self) -> usize {
        self.shared.config.initial_slabs
    }

    pub fn growth_slabs(&self) -> usize {
        self.shared.config.growth_slabs
    }

    pub fn max_slabs(&self) -> Option<usize> {
        self.shared.config.max_slabs
    }

    /// Number of slabs currently in the pool
    pub fn slab_count(&self) -> usize {
        self.shared.slabs.read().len()
    }

    /// Snapshot of pool usage
    pub fn stats(&self) -> PoolStats {
        PoolStats::collect(&self.shared.snapshot())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("slab_size", &self.shared.slab_size)
            .field("slab_count", &self.slab_count())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl PoolShared {
    fn snapshot(&self) -> Vec<Arc<MemorySlab>> {
        self.slabs.read().clone()
    }

    fn new_slab(&self) -> Result<Arc<MemorySlab>> {
        Ok(Arc::new(MemorySlab::with_observer(
            self.slab_size,
            self.observer.clone(),
        )?))
    }

    /// Allocate `size` bytes as one or more leases, rolling back on failure
    fn allocate(&self, size: u64) -> Result<Vec<Lease>> {
        let mut leases = Vec::new();

        if self.single_slab.load(Ordering::Acquire) {
            if let Some(block) = self.first_slab.try_allocate(size)? {
                leases.push(Lease::new(Arc::clone(&self.first_slab), block));
                return Ok(leases);
            }
            self.single_slab.store(false, Ordering::Release);
        }

        match self.allocate_slow(size, &mut leases) {
            Ok(()) => Ok(leases),
            Err(e) => {
                let blocks = leases.len();
                for lease in leases {
                    lease.release();
                }
                metrics::record_growth_rollback();
                warn!(size, blocks, error = %e, "Buffer allocation rolled back");
                Err(e)
            }
        }
    }

    fn allocate_slow(&self, size: u64, leases: &mut Vec<Lease>) -> Result<()> {
        let snapshot = self.snapshot();
        let allocated = allocate_across(&snapshot, size, MAX_SEGMENTS_PER_BUFFER, leases)?;
        if allocated == size {
            return Ok(());
        }
        self.grow(size - allocated, leases)
    }

    /// Satisfy the last `remaining` bytes of a request, adding slabs as needed
    fn grow(&self, mut remaining: u64, leases: &mut Vec<Lease>) -> Result<()> {
        let _guard = self.grow_lock.lock();

        // Another thread may have grown the pool while we waited
        let snapshot = self.snapshot();
        let segments_left = MAX_SEGMENTS_PER_BUFFER.saturating_sub(leases.len());
        remaining -= allocate_across(&snapshot, remaining, segments_left, leases)?;
        if remaining == 0 {
            return Ok(());
        }

        let existing = snapshot.len();
        let mut created: Vec<Arc<MemorySlab>> = Vec::new();

        while remaining > 0 {
            self.check_limit(existing + created.len() + 1)?;
            let slab = self.new_slab()?;
            let length = remaining.min(self.slab_size);
            let block = slab.try_allocate(length)?.ok_or_else(|| {
                Error::AllocationFailed(format!(
                    "new {} could not supply {} bytes",
                    slab.id(),
                    length
                ))
            })?;
            leases.push(Lease::new(Arc::clone(&slab), block));
            remaining -= length;
            created.push(slab);
        }

        while created.len() < self.config.growth_slabs {
            if self.check_limit(existing + created.len() + 1).is_err() {
                break;
            }
            created.push(self.new_slab()?);
        }

        let count = created.len();
        let total = {
            let mut slabs = self.slabs.write();
            slabs.extend(created);
            self.single_slab.store(false, Ordering::Release);
            slabs.len()
        };
        metrics::record_slabs_created(count);
        info!(created = count, total, "Buffer pool grew");
        Ok(())
    }

    fn check_limit(&self, wanted: usize) -> Result<()> {
        match self.config.max_slabs {
            Some(limit) if wanted > limit => Err(Error::SlabLimitReached { limit }),
            _ => Ok(()),
        }
    }

    fn try_shrink(&self) -> bool {
        let mut slabs = self.slabs.write();

        let mut empty = 0;
        let mut last_empty = None;
        for (i, slab) in slabs.iter().enumerate() {
            if slab.is_fully_free() {
                empty += 1;
                last_empty = Some(i);
            }
        }

        if empty <= self.config.initial_slabs {
            return false;
        }
        let index = match last_empty {
            Some(index) if index > 0 => index,
            _ => return false,
        };
        // Anyone holding a stale snapshot may have taken a block since the count
        if !slabs[index].retire() {
            return false;
        }

        let evicted = slabs.remove(index);
        if slabs.len() == 1 {
            self.single_slab.store(true, Ordering::Release);
        }
        let remaining = slabs.len();
        drop(slabs);

        metrics::record_slab_evicted();
        info!(id = %evicted.id(), remaining, "Evicted empty slab");
        true
    }
}

impl SlabObserver for PoolShared {
    fn slab_emptied(&self, slab: SlabId) {
        debug!(%slab, "Slab emptied");
        self.try_shrink();
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        metrics::record_slabs_dropped(self.slabs.get_mut().len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::config::MIN_SLAB_SIZE;

    #[test]
    fn test_constructor_properties() -> Result<()> {
        let pool = BufferPool::new(MIN_SLAB_SIZE * 2, 3, 2)?;
        assert_eq!(pool.slab_size(), MIN_SLAB_SIZE * 2);
        assert_eq!(pool.initial_slabs(), 3);
        assert_eq!(pool.growth_slabs(), 2);
        assert_eq!(pool.slab_count(), 3);
        assert!(pool.max_slabs().is_none());
        Ok(())
    }

    #[test]
    fn test_constructor_rejects_zero_arguments() {
        assert!(matches!(BufferPool::new(0, 1, 1), Err(Error::InvalidArgument(_))));
        assert!(matches!(BufferPool::new(1, 0, 1), Err(Error::InvalidArgument(_))));
        assert!(matches!(BufferPool::new(1, 1, 0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_slab_size_clamped_to_minimum() -> Result<()> {
        let pool = BufferPool::new(1, 1, 1)?;
        assert_eq!(pool.slab_size(), MIN_SLAB_SIZE);

        let pool = BufferPool::new(MIN_SLAB_SIZE - 1, 1, 1)?;
        assert_eq!(pool.slab_size(), MIN_SLAB_SIZE);

        let pool = BufferPool::new(MIN_SLAB_SIZE + 1, 1, 1)?;
        assert_eq!(pool.slab_size(), MIN_SLAB_SIZE + 1);
        Ok(())
    }

    #[test]
    fn test_zero_buffer_does_not_disturb_allocation() -> Result<()> {
        let pool = BufferPool::new(2 * 1024 * 1024, 1, 1)?;

        let first = pool.get_buffer(20 * 1024)?;
        assert_eq!(first.size(), 20 * 1024);

        let zero = pool.get_buffer(0)?;
        assert_eq!(zero.size(), 0);
        assert_eq!(zero.segments()?.len(), 1);
        assert!(zero.segments()?[0].is_empty());

        let third = pool.get_buffer(100 * 1024)?;
        assert_eq!(third.size(), 100 * 1024);
        assert_eq!(third.segments()?[0].offset(), 20 * 1024);
        Ok(())
    }

    #[test]
    fn test_content_longer_than_size_rejected() -> Result<()> {
        let pool = BufferPool::new(MIN_SLAB_SIZE, 1, 1)?;
        assert!(matches!(
            pool.get_buffer_filled(3, b"abcd"),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(pool.stats().free_bytes, MIN_SLAB_SIZE);
        Ok(())
    }

    #[test]
    fn test_filled_buffer_content() -> Result<()> {
        let pool = BufferPool::new(MIN_SLAB_SIZE, 1, 1)?;
        let buffer = pool.get_buffer_filled(8, b"slab")?;

        let mut out = [0xAAu8; 8];
        buffer.copy_to(&mut out)?;
        assert_eq!(&out[..4], b"slab");
        Ok(())
    }

    #[test]
    fn test_shrink_sequence() -> Result<()> {
        let pool = BufferPool::new(MIN_SLAB_SIZE, 1, 3)?;
        assert_eq!(pool.slab_count(), 1);

        let mut first = pool.get_buffer(MIN_SLAB_SIZE)?;
        assert_eq!(pool.slab_count(), 1);
        assert!(!pool.try_shrink());
        assert_eq!(pool.slab_count(), 1);

        // Forces one slab for the request plus two spares
        let mut second = pool.get_buffer(MIN_SLAB_SIZE)?;
        assert_eq!(pool.slab_count(), 4);

        assert!(pool.try_shrink());
        assert_eq!(pool.slab_count(), 3);
        assert!(!pool.try_shrink());
        assert_eq!(pool.slab_count(), 3);

        // Emptying slab 0 evicts the remaining spare
        first.dispose();
        assert_eq!(pool.slab_count(), 2);
        assert!(!pool.try_shrink());
        assert_eq!(pool.slab_count(), 2);

        second.dispose();
        assert_eq!(pool.slab_count(), 1);
        Ok(())
    }

    #[test]
    fn test_growth_tops_up_to_growth_slabs() -> Result<()> {
        let pool = BufferPool::new(MIN_SLAB_SIZE, 1, 41)?;
        let _first = pool.get_buffer(MIN_SLAB_SIZE)?;
        let _second = pool.get_buffer(MIN_SLAB_SIZE)?;
        assert_eq!(pool.growth_slabs(), 41);
        assert_eq!(pool.slab_count(), 42);
        Ok(())
    }

    #[test]
    fn test_request_larger_than_slab_spans_slabs() -> Result<()> {
        let pool = BufferPool::new(MIN_SLAB_SIZE, 1, 1)?;
        let size = MIN_SLAB_SIZE * 2 + 100;
        let buffer = pool.get_buffer(size)?;

        assert_eq!(buffer.size(), size);
        assert_eq!(buffer.segment_count(), 3);
        assert_eq!(pool.slab_count(), 3);

        let lengths: Vec<usize> = buffer.segments()?.iter().map(|s| s.len()).collect();
        assert_eq!(lengths, vec![MIN_SLAB_SIZE as usize, MIN_SLAB_SIZE as usize, 100]);
        Ok(())
    }

    #[test]
    fn test_slab_limit_rolls_back() -> Result<()> {
        let config = PoolConfig::new(MIN_SLAB_SIZE, 1, 1).with_max_slabs(2);
        let pool = BufferPool::with_config(config)?;
        let _held = pool.get_buffer(1024)?;

        let result = pool.get_buffer(MIN_SLAB_SIZE * 2);
        assert!(matches!(result, Err(Error::SlabLimitReached { limit: 2 })));

        // Nothing from the failed request stays on loan
        let stats = pool.stats();
        assert_eq!(stats.used_bytes(), 1024);
        assert!(pool.slab_count() <= 2);
        Ok(())
    }

    #[test]
    fn test_spares_stop_at_slab_limit() -> Result<()> {
        let config = PoolConfig::new(MIN_SLAB_SIZE, 1, 5).with_max_slabs(3);
        let pool = BufferPool::with_config(config)?;
        let _first = pool.get_buffer(MIN_SLAB_SIZE)?;
        let _second = pool.get_buffer(MIN_SLAB_SIZE)?;
        assert_eq!(pool.slab_count(), 3);
        Ok(())
    }

    #[test]
    fn test_fast_path_rearmed_after_shrink() -> Result<()> {
        let pool = BufferPool::new(MIN_SLAB_SIZE, 1, 1)?;
        let mut first = pool.get_buffer(MIN_SLAB_SIZE)?;
        let mut second = pool.get_buffer(MIN_SLAB_SIZE)?;
        assert!(!pool.shared.single_slab.load(Ordering::Acquire));

        first.dispose();
        second.dispose();
        assert_eq!(pool.slab_count(), 1);
        assert!(pool.shared.single_slab.load(Ordering::Acquire));
        Ok(())
    }

    #[test]
    fn test_stats() -> Result<()> {
        let pool = BufferPool::new(MIN_SLAB_SIZE, 2, 1)?;
        let _buffer = pool.get_buffer(1000)?;

        let stats = pool.stats();
        assert_eq!(stats.slab_count, 2);
        assert_eq!(stats.empty_slabs, 1);
        assert_eq!(stats.capacity, 2 * MIN_SLAB_SIZE);
        assert_eq!(stats.used_bytes(), 1000);
        Ok(())
    }
}
