//! Concurrent access tests for the buffer pool

use rayon::prelude::*;
use slabbuf::error::Result;
use slabbuf::{BufferPool, ManagedBuffer, SlabId, MIN_SLAB_SIZE};
use std::sync::Barrier;

#[test]
fn test_concurrent_buffers_are_disjoint() -> Result<()> {
    const THREADS: usize = 16;
    const SIZE: u64 = 15 * 1024;
    const SLAB: u64 = MIN_SLAB_SIZE;
    const GROWTH: usize = 1;

    let pool = BufferPool::new(SLAB, 1, GROWTH)?;
    let hold = Barrier::new(THREADS);

    let buffers: Vec<ManagedBuffer> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pool = &pool;
                let hold = &hold;
                scope.spawn(move || -> Result<ManagedBuffer> {
                    let buffer = pool.get_buffer_filled(SIZE, &vec![t as u8; SIZE as usize]);
                    // Keep every buffer alive until all threads have one
                    hold.wait();
                    buffer
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Result<Vec<_>>>()
    })?;

    // Contents survived the other threads' writes
    for (t, buffer) in buffers.iter().enumerate() {
        let mut out = vec![0u8; SIZE as usize];
        buffer.copy_to(&mut out)?;
        assert!(out.iter().all(|&b| b == t as u8), "buffer {} was overwritten", t);
    }

    let mut ranges: Vec<(SlabId, u64, u64)> = Vec::new();
    for buffer in &buffers {
        for segment in buffer.segments()? {
            ranges.push((segment.slab_id(), segment.offset(), segment.len() as u64));
        }
    }
    ranges.sort();
    for pair in ranges.windows(2) {
        let (slab_a, start_a, len_a) = pair[0];
        let (slab_b, start_b, _) = pair[1];
        assert!(
            slab_a != slab_b || start_a + len_a <= start_b,
            "overlapping segments {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }

    let needed = ((THREADS as u64 * SIZE + SLAB - 1) / SLAB) as usize;
    let slabs = pool.slab_count();
    assert!(slabs >= needed, "{} slabs cannot hold {} buffers", slabs, THREADS);
    assert!(slabs <= needed + GROWTH, "pool grew to {} slabs", slabs);
    Ok(())
}

#[test]
fn test_parallel_churn_returns_all_memory() -> Result<()> {
    let pool = BufferPool::new(MIN_SLAB_SIZE, 2, 2)?;

    (0..2000u64).into_par_iter().try_for_each(|i| -> Result<()> {
        let size = 1 + (i * 7919) % (3 * MIN_SLAB_SIZE);
        let pattern = vec![(i % 256) as u8; size as usize];

        let mut buffer = pool.get_buffer_filled(size, &pattern)?;
        assert_eq!(buffer.size(), size);

        let mut out = vec![0u8; size as usize];
        buffer.copy_to(&mut out)?;
        assert_eq!(out, pattern);

        buffer.dispose();
        Ok(())
    })?;

    let stats = pool.stats();
    assert_eq!(stats.used_bytes(), 0);
    assert!(pool.slab_count() >= 2);

    while pool.try_shrink() {}
    assert_eq!(pool.slab_count(), 2);
    Ok(())
}

#[test]
fn test_buffers_released_on_other_threads() -> Result<()> {
    let pool = BufferPool::new(MIN_SLAB_SIZE, 1, 1)?;
    let buffers: Vec<ManagedBuffer> = (0..8)
        .map(|_| pool.get_buffer(MIN_SLAB_SIZE / 2))
        .collect::<Result<_>>()?;
    assert_eq!(pool.slab_count(), 4);

    std::thread::scope(|scope| {
        for buffer in buffers {
            scope.spawn(move || drop(buffer));
        }
    });

    assert_eq!(pool.stats().used_bytes(), 0);
    while pool.try_shrink() {}
    assert_eq!(pool.slab_count(), 1);
    Ok(())
}
