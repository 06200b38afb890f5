//! Free-block bookkeeping for a single slab
//!
//! Free ranges are indexed three ways:
//!
//! ```text
//! by_length: 64   → {128, 4096}      best fit = ceiling(len) in O(log n)
//!            512  → {1024}
//! by_start:  128 → 64, 1024 → 512, 4096 → 64
//! by_end:    191 → 128, 1535 → 1024, 4159 → 4096
//! ```
//!
//! `by_start` is ordered so a released range can be checked against its
//! nearest free neighbours; `by_end` finds the range to coalesce with on the
//! left in O(1).

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Release was rejected because the range is already (partly) free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleFree {
    pub start: u64,
    pub length: u64,
}

/// Index of the free ranges of one slab
///
/// Not synchronized; [`MemorySlab`](super::MemorySlab) keeps it behind its lock.
#[derive(Debug)]
pub struct FreeBlockIndex {
    /// Total size of the managed region
    capacity: u64,
    /// Free ranges grouped by length, each group ordered by start offset
    by_length: BTreeMap<u64, BTreeSet<u64>>,
    /// start offset → length
    by_start: BTreeMap<u64, u64>,
    /// end offset (inclusive) → start offset
    by_end: HashMap<u64, u64>,
    /// Length of the largest free range
    largest: u64,
    /// Sum of all free range lengths
    free_bytes: u64,
}

impl FreeBlockIndex {
    /// Create an index where the whole `[0, capacity)` region is free
    pub fn new(capacity: u64) -> Self {
        let mut index = Self {
            capacity,
            by_length: BTreeMap::new(),
            by_start: BTreeMap::new(),
            by_end: HashMap::new(),
            largest: 0,
            free_bytes: 0,
        };
        if capacity > 0 {
            index.insert(0, capacity);
        }
        index
    }

    /// Length of the largest free range
    pub fn largest(&self) -> u64 {
        self.largest
    }

    /// Total number of free bytes
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Number of distinct free ranges
    pub fn block_count(&self) -> usize {
        self.by_start.len()
    }

    /// Whether nothing is on loan
    pub fn is_fully_free(&self) -> bool {
        self.largest == self.capacity
    }

    /// Take a range of at least `min` and at most `max` bytes
    ///
    /// The smallest free range that holds `max` bytes is preferred. When no
    /// range is that large, the largest range is taken whole. Returns the
    /// `(start, length)` of the taken range.
    pub fn take(&mut self, min: u64, max: u64) -> Option<(u64, u64)> {
        debug_assert!(min > 0 && min <= max);

        if self.largest < min {
            return None;
        }

        let (key, length) = match self.by_length.range(max..).next() {
            Some((&key, _)) => (key, max),
            None => (self.largest, self.largest),
        };

        let start = match self.by_length.get(&key).and_then(|starts| starts.first()) {
            Some(&start) => start,
            None => unreachable!("largest free length {} has no range in the index", key),
        };

        self.remove(start, key);
        if key > length {
            self.insert(start + length, key - length);
        }

        Some((start, length))
    }

    /// Return `[start, start + length)` to the free set, merging it with the
    /// free ranges directly before and after it
    ///
    /// Returns the `(start, length)` of the merged free range.
    pub fn release(&mut self, start: u64, length: u64) -> Result<(u64, u64), DoubleFree> {
        if length == 0 {
            return Err(DoubleFree { start, length });
        }

        let end = start + length - 1;
        if end >= self.capacity
            || self.free_bytes + length > self.capacity
            || self.overlaps_free(start, end)
        {
            return Err(DoubleFree { start, length });
        }

        let mut merged_start = start;
        let mut merged_length = length;

        if start > 0 {
            if let Some(&before) = self.by_end.get(&(start - 1)) {
                let before_length = self.by_start[&before];
                self.remove(before, before_length);
                merged_start = before;
                merged_length += before_length;
            }
        }

        if end + 1 < self.capacity {
            if let Some(&after_length) = self.by_start.get(&(end + 1)) {
                self.remove(end + 1, after_length);
                merged_length += after_length;
            }
        }

        self.insert(merged_start, merged_length);
        Ok((merged_start, merged_length))
    }

    /// Free ranges ordered by start offset
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.by_start.iter().map(|(&s, &l)| (s, l)).collect()
    }

    /// Whether `[start, end]` shares a byte with any free range
    fn overlaps_free(&self, start: u64, end: u64) -> bool {
        let before = self.by_start.range(..=start).next_back();
        if matches!(before, Some((&s, &l)) if s + l > start) {
            return true;
        }
        let after = self.by_start.range(start..).next();
        matches!(after, Some((&s, _)) if s <= end)
    }

    fn insert(&mut self, start: u64, length: u64) {
        self.by_length.entry(length).or_default().insert(start);
        self.by_start.insert(start, length);
        self.by_end.insert(start + length - 1, start);
        self.free_bytes += length;
        if length > self.largest {
            self.largest = length;
        }
    }

    fn remove(&mut self, start: u64, length: u64) {
        self.by_start.remove(&start);
        self.by_end.remove(&(start + length - 1));
        self.free_bytes -= length;

        let group_emptied = match self.by_length.get_mut(&length) {
            Some(starts) => {
                starts.remove(&start);
                starts.is_empty()
            }
            None => false,
        };

        if group_emptied {
            self.by_length.remove(&length);
            // Only the loss of the last range of the largest length moves the maximum
            if length == self.largest {
                self.largest = self.by_length.last_key_value().map_or(0, |(&k, _)| k);
            }
        }
    }
}
