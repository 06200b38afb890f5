//! Buffer pool
//!
//! Owns the slabs, grows them under pressure and evicts empty ones once more
//! than `initial_slabs` sit idle.
//!
//! # Growth example (slab size 90 KiB, growth 3)
//!
//! ```text
//! before:  [#0 full]
//! request: 90 KiB → nothing fits
//! after:   [#0 full] [#1 full ← request] [#2 empty] [#3 empty]
//! ```

pub mod buffer_pool;
pub mod config;
pub mod metrics;
pub(crate) mod placement;
pub mod stats;

pub use buffer_pool::BufferPool;
pub use config::{PoolConfig, MAX_SEGMENTS_PER_BUFFER, MAX_SLAB_SIZE, MIN_SLAB_SIZE};
pub use metrics::{export_metrics, init_metrics};
pub use stats::PoolStats;
